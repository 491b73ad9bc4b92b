use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::CoordError;
use crate::registry::{Group, Kind, Label};
use crate::shapes::{EventEmitter, ListenerId, Request, Worker};

lazy_static::lazy_static! {
  static ref NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);
}

/// Identity of one live task, unique for the lifetime of the process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
  pub(crate) fn next() -> Self {
    TaskId(NEXT_TASK_ID.fetch_add(1, AtomicOrdering::Relaxed))
  }
}

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl fmt::Debug for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "TaskId({})", self.0)
  }
}

/// Heterogeneous completion value delivered to bridge waiters.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Wraps a value as a [`Payload`].
pub fn payload<T: Send + Sync + 'static>(value: T) -> Payload {
  Arc::new(value)
}

/// What a single-shot callback hands back to the coordinator: either a
/// ready value or a future whose output becomes the completion value.
pub enum TaskOutcome {
  Value(Payload),
  Deferred(BoxFuture<'static, Payload>),
}

impl TaskOutcome {
  pub fn value<T: Send + Sync + 'static>(value: T) -> Self {
    TaskOutcome::Value(Arc::new(value))
  }

  pub fn deferred<F>(future: F) -> Self
  where
    F: Future<Output = Payload> + Send + 'static,
  {
    TaskOutcome::Deferred(Box::pin(future))
  }
}

impl From<()> for TaskOutcome {
  fn from(_: ()) -> Self {
    TaskOutcome::value(())
  }
}

impl From<Payload> for TaskOutcome {
  fn from(value: Payload) -> Self {
    TaskOutcome::Value(value)
  }
}

impl From<BoxFuture<'static, Payload>> for TaskOutcome {
  fn from(future: BoxFuture<'static, Payload>) -> Self {
    TaskOutcome::Deferred(future)
  }
}

/// Hook invoked when a task is cleared before natural completion. Hooks are
/// shared handles so one registration can cover several event links; each
/// individual link still runs its copy at most once.
pub type ClearHook = Arc<dyn Fn(&ClearContext) + Send + Sync + 'static>;

/// Describes which task was cleared, why, and what (if anything) replaced
/// it. Passed to every `on_clear` hook and carried inside
/// [`CoordError::Cancelled`].
#[derive(Debug, Clone)]
pub struct ClearContext {
  pub id: TaskId,
  pub kind: Kind,
  pub label: Option<Label>,
  pub group: Option<Group>,
  pub name: Option<Arc<str>>,
  pub reason: Option<Arc<str>>,
  pub replaced_by: Option<TaskId>,
}

impl ClearContext {
  /// Human-facing identity of the task, preferring its display name.
  pub fn describe(&self) -> String {
    if let Some(name) = &self.name {
      return name.to_string();
    }
    if let Some(label) = &self.label {
      return format!("labeled {label:?}");
    }
    format!("#{}", self.id)
  }
}

/// One pending resolve/reject pair of a promise bridge. The sender carries
/// both verdicts; `depth` counts how many times the waiter has been handed
/// along a replacement chain.
pub(crate) struct Waiter {
  pub(crate) tx: oneshot::Sender<Result<Payload, CoordError>>,
  pub(crate) depth: u32,
}

impl Waiter {
  pub(crate) fn new() -> (Self, oneshot::Receiver<Result<Payload, CoordError>>) {
    let (tx, rx) = oneshot::channel();
    (Waiter { tx, depth: 0 }, rx)
  }
}

/// The kind-specific destructor of a live task.
pub(crate) enum Canceler {
  /// Stops a spawned driver task.
  Token(CancellationToken),
  Worker(Arc<dyn Worker>),
  /// Abortable request plus the token that stops its completion driver.
  Request {
    request: Arc<dyn Request>,
    token: CancellationToken,
  },
  Listener {
    emitter: Arc<dyn EventEmitter>,
    event: String,
    registration: ListenerId,
  },
  /// Nothing to destroy; the task simply becomes inert once removed.
  Inert,
}

impl fmt::Debug for Canceler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let variant = match self {
      Canceler::Token(_) => "Token",
      Canceler::Worker(_) => "Worker",
      Canceler::Request { .. } => "Request",
      Canceler::Listener { .. } => "Listener",
      Canceler::Inert => "Inert",
    };
    f.write_str(variant)
  }
}

/// The in-registry record for one live task.
pub(crate) struct Link {
  pub(crate) id: TaskId,
  pub(crate) kind: Kind,
  pub(crate) label: Option<Label>,
  pub(crate) group: Option<Group>,
  pub(crate) name: Option<Arc<str>>,
  pub(crate) interval: bool,
  pub(crate) canceler: Canceler,
  pub(crate) on_clear: Vec<ClearHook>,
  pub(crate) on_complete: Vec<Waiter>,
}

impl Link {
  pub(crate) fn context(&self, reason: Option<Arc<str>>, replaced_by: Option<TaskId>) -> ClearContext {
    ClearContext {
      id: self.id,
      kind: self.kind,
      label: self.label.clone(),
      group: self.group.clone(),
      name: self.name.clone(),
      reason,
      replaced_by,
    }
  }
}

impl fmt::Debug for Link {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Link")
      .field("id", &self.id)
      .field("kind", &self.kind)
      .field("label", &self.label)
      .field("group", &self.group)
      .field("interval", &self.interval)
      .field("canceler", &self.canceler)
      .field("clear_hooks", &self.on_clear.len())
      .field("waiters", &self.on_complete.len())
      .finish_non_exhaustive()
  }
}
