//! Shared fixtures: tracing setup plus stub implementations of the
//! emitter, worker and request shapes with observable call counts.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::watch;

use deferral::{EventEmitter, ListenerFn, ListenerId, Payload, Request, RequestError, TaskId, Worker};

/// Installs the test tracing subscriber once per process.
pub fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,deferral=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

type ListenerEntry = (ListenerId, ListenerFn, bool);

/// Emitter stub recording every listen/unlisten call. `emit` dispatches a
/// snapshot, so handlers may re-enter and install further listeners.
pub struct StubEmitter {
  next_id: AtomicU64,
  native_once: bool,
  listeners: Mutex<HashMap<String, Vec<ListenerEntry>>>,
  pub listen_calls: AtomicUsize,
  pub unlisten_calls: AtomicUsize,
}

impl StubEmitter {
  pub fn new() -> Arc<Self> {
    Arc::new(StubEmitter {
      next_id: AtomicU64::new(1),
      native_once: false,
      listeners: Mutex::new(HashMap::new()),
      listen_calls: AtomicUsize::new(0),
      unlisten_calls: AtomicUsize::new(0),
    })
  }

  pub fn with_native_once() -> Arc<Self> {
    Arc::new(StubEmitter {
      next_id: AtomicU64::new(1),
      native_once: true,
      listeners: Mutex::new(HashMap::new()),
      listen_calls: AtomicUsize::new(0),
      unlisten_calls: AtomicUsize::new(0),
    })
  }

  fn install(&self, event: &str, handler: ListenerFn, once: bool) -> ListenerId {
    let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
    self.listen_calls.fetch_add(1, Ordering::SeqCst);
    self
      .listeners
      .lock()
      .unwrap()
      .entry(event.to_string())
      .or_default()
      .push((id, handler, once));
    id
  }

  pub fn emit(&self, event: &str, value: Payload) {
    let snapshot: Vec<ListenerEntry> = self
      .listeners
      .lock()
      .unwrap()
      .get(event)
      .cloned()
      .unwrap_or_default();
    for (id, handler, once) in snapshot {
      if once {
        // Native once: the emitter removes the registration before the
        // handler runs.
        if let Some(entries) = self.listeners.lock().unwrap().get_mut(event) {
          entries.retain(|(entry_id, _, _)| *entry_id != id);
        }
      }
      handler(value.clone());
    }
  }

  pub fn listener_count(&self, event: &str) -> usize {
    self.listeners.lock().unwrap().get(event).map_or(0, Vec::len)
  }

  pub fn total_listeners(&self) -> usize {
    self.listeners.lock().unwrap().values().map(Vec::len).sum()
  }
}

impl EventEmitter for StubEmitter {
  fn listen(&self, event: &str, handler: ListenerFn) -> ListenerId {
    self.install(event, handler, false)
  }

  fn unlisten(&self, event: &str, listener: ListenerId) -> bool {
    self.unlisten_calls.fetch_add(1, Ordering::SeqCst);
    let mut listeners = self.listeners.lock().unwrap();
    let Some(entries) = listeners.get_mut(event) else { return false };
    let before = entries.len();
    entries.retain(|(entry_id, _, _)| *entry_id != listener);
    entries.len() < before
  }

  fn listen_once(&self, event: &str, handler: ListenerFn) -> Option<ListenerId> {
    if self.native_once {
      Some(self.install(event, handler, true))
    } else {
      None
    }
  }
}

/// Emitter whose removal surface is broken; used to exercise the
/// missing-destructor failure path.
pub struct RudeEmitter {
  inner: Arc<StubEmitter>,
}

impl RudeEmitter {
  pub fn new() -> Arc<Self> {
    Arc::new(RudeEmitter { inner: StubEmitter::new() })
  }

  pub fn emit(&self, event: &str, value: Payload) {
    self.inner.emit(event, value);
  }
}

impl EventEmitter for RudeEmitter {
  fn listen(&self, event: &str, handler: ListenerFn) -> ListenerId {
    self.inner.listen(event, handler)
  }

  fn unlisten(&self, _event: &str, _listener: ListenerId) -> bool {
    false
  }
}

/// Worker stub counting terminations. A non-cooperative worker refuses to
/// terminate, which the coordinator reports as a missing destructor.
pub struct StubWorker {
  cooperative: bool,
  pub terminations: AtomicUsize,
}

impl StubWorker {
  pub fn new() -> Arc<Self> {
    Arc::new(StubWorker { cooperative: true, terminations: AtomicUsize::new(0) })
  }

  pub fn unstoppable() -> Arc<Self> {
    Arc::new(StubWorker { cooperative: false, terminations: AtomicUsize::new(0) })
  }
}

impl Worker for StubWorker {
  fn terminate(&self) -> bool {
    if !self.cooperative {
      return false;
    }
    self.terminations.fetch_add(1, Ordering::SeqCst);
    true
  }
}

type RequestVerdict = Option<Result<Payload, RequestError>>;

/// Request stub: completion is a watch channel the test settles on demand;
/// abort reasons are recorded for inspection.
pub struct StubRequest {
  verdict: watch::Sender<RequestVerdict>,
  aborts: Mutex<Vec<Option<TaskId>>>,
}

impl StubRequest {
  pub fn new() -> Arc<Self> {
    let (verdict, _) = watch::channel(None);
    Arc::new(StubRequest { verdict, aborts: Mutex::new(Vec::new()) })
  }

  pub fn complete(&self, value: Payload) {
    let _ = self.verdict.send(Some(Ok(value)));
  }

  pub fn fail(&self, error: RequestError) {
    let _ = self.verdict.send(Some(Err(error)));
  }

  pub fn abort_reasons(&self) -> Vec<Option<TaskId>> {
    self.aborts.lock().unwrap().clone()
  }
}

impl Request for StubRequest {
  fn completion(&self) -> BoxFuture<'static, Result<Payload, RequestError>> {
    let mut rx = self.verdict.subscribe();
    Box::pin(async move {
      loop {
        let settled = rx.borrow().clone();
        if let Some(verdict) = settled {
          return verdict;
        }
        if rx.changed().await.is_err() {
          // The stub was dropped without settling; never completes.
          futures::future::pending::<()>().await;
        }
      }
    })
  }

  fn abort(&self, replaced_by: Option<TaskId>) {
    self.aborts.lock().unwrap().push(replaced_by);
  }
}
