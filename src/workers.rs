//! Adapters for caller-owned primitives: workers, abortable requests and
//! proxied callbacks.

use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::bridge::Bridged;
use crate::coordinator::{Coordinator, Inner, SetOutcome, TaskSpec};
use crate::error::CoordError;
use crate::link::{Canceler, Payload, TaskId, Waiter};
use crate::options::{ClearTarget, ListenerOptions, TaskOptions};
use crate::registry::{Group, Kind};
use crate::shapes::{Request, Worker};

impl<O: Send + Sync + 'static> Coordinator<O> {
  /// Registers a caller-owned worker so its lifetime is tracked alongside
  /// every other deferred task. Clearing the registration terminates the
  /// worker.
  pub fn worker(&self, worker: Arc<dyn Worker>, opts: TaskOptions) -> TaskId {
    self
      .set_async(TaskSpec {
        kind: Kind::Worker,
        interval: true,
        opts,
        canceler: Canceler::Worker(worker),
        waiter: None,
      })
      .id()
  }

  pub fn terminate_worker(&self, target: impl Into<ClearTarget>) -> Result<(), CoordError> {
    self.clear_kind(Kind::Worker, target.into())
  }

  /// Issues and tracks an abortable request. The factory runs only when a
  /// fresh task is actually installed, so a merge join against a live
  /// label never issues a duplicate request. The returned bridge resolves
  /// with the request's completion value.
  pub fn request<F>(&self, factory: F, opts: TaskOptions) -> Bridged
  where
    F: FnOnce() -> Arc<dyn Request>,
  {
    let (waiter, rx) = Waiter::new();
    let group = opts.group.clone();
    let outcome = self.set_async(TaskSpec {
      kind: Kind::Request,
      interval: false,
      opts,
      canceler: Canceler::Inert,
      waiter: Some(waiter),
    });
    match outcome {
      SetOutcome::Merged(id) => Bridged::new(id, rx),
      SetOutcome::Installed(id) => {
        let request = factory();
        let token = CancellationToken::new();
        self.attach_canceler(
          Kind::Request,
          group.as_deref(),
          id,
          Canceler::Request { request: request.clone(), token: token.clone() },
        );
        self.spawn_request(id, group, request, token);
        Bridged::new(id, rx)
      }
    }
  }

  pub fn cancel_request(&self, target: impl Into<ClearTarget>) -> Result<(), CoordError> {
    self.clear_kind(Kind::Request, target.into())
  }

  /// Wraps a callback so it can be handed to foreign code while remaining
  /// cancellable: once cleared, calling the proxy is a no-op.
  pub fn proxy<F>(&self, callback: F, opts: ListenerOptions) -> ProxyFn<O>
  where
    F: Fn(&O, Payload) + Send + Sync + 'static,
  {
    let single = opts.single;
    let group = opts.task.group.clone();
    let id = self
      .set_async(TaskSpec {
        kind: Kind::Proxy,
        interval: !single,
        opts: opts.task,
        canceler: Canceler::Inert,
        waiter: None,
      })
      .id();
    ProxyFn {
      inner: self.downgrade(),
      id,
      group,
      single,
      callback: Arc::new(callback),
    }
  }

  pub fn clear_proxy(&self, target: impl Into<ClearTarget>) -> Result<(), CoordError> {
    self.clear_kind(Kind::Proxy, target.into())
  }

  fn spawn_request(
    &self,
    id: TaskId,
    group: Option<Group>,
    request: Arc<dyn Request>,
    token: CancellationToken,
  ) {
    let weak = self.downgrade();
    self.inner.handle.spawn(async move {
      let completion = request.completion();
      let settled = tokio::select! {
        biased;
        _ = token.cancelled() => {
          trace!(task_id = %id, "request driver cancelled");
          return;
        }
        settled = completion => settled,
      };
      let Some(inner) = weak.upgrade() else { return };
      let coordinator = Coordinator::from_inner(inner);
      let Some(link) = coordinator.fire_single(Kind::Request, group.as_deref(), id) else {
        return;
      };
      match settled {
        Ok(value) => coordinator.deliver(link, value),
        Err(source) => coordinator.deliver_failure(link, source),
      }
    });
  }
}

/// Cancellable callback handle returned by [`Coordinator::proxy`].
///
/// The handle is cheap to clone and may outlive the coordinator; calls
/// after the coordinator (or the registration) is gone report `false`.
pub struct ProxyFn<O: Send + Sync + 'static> {
  inner: Weak<Inner<O>>,
  id: TaskId,
  group: Option<Group>,
  single: bool,
  callback: Arc<dyn Fn(&O, Payload) + Send + Sync + 'static>,
}

impl<O: Send + Sync + 'static> ProxyFn<O> {
  pub fn id(&self) -> TaskId {
    self.id
  }

  /// Invokes the wrapped callback if the registration is still live.
  /// Single-shot proxies remove their link before the callback runs, so a
  /// second call reports `false`.
  pub fn call(&self, value: Payload) -> bool {
    let Some(inner) = self.inner.upgrade() else { return false };
    let coordinator = Coordinator::from_inner(inner);
    if self.single {
      let Some(link) = coordinator.fire_single(Kind::Proxy, self.group.as_deref(), self.id) else {
        return false;
      };
      (self.callback)(coordinator.owner(), value.clone());
      coordinator.deliver(link, value);
      true
    } else {
      if !coordinator.alive(Kind::Proxy, self.group.as_deref(), self.id) {
        return false;
      }
      (self.callback)(coordinator.owner(), value);
      true
    }
  }
}

impl<O: Send + Sync + 'static> Clone for ProxyFn<O> {
  fn clone(&self) -> Self {
    ProxyFn {
      inner: self.inner.clone(),
      id: self.id,
      group: self.group.clone(),
      single: self.single,
      callback: self.callback.clone(),
    }
  }
}

impl<O: Send + Sync + 'static> std::fmt::Debug for ProxyFn<O> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyFn")
      .field("id", &self.id)
      .field("group", &self.group)
      .field("single", &self.single)
      .finish_non_exhaustive()
  }
}
