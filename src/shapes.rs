//! The shapes the coordinator requires of external collaborators: event
//! emitters, workers, and abortable requests. The coordinator never owns
//! these objects' lifecycles beyond the registered destructor call.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::RequestError;
use crate::link::{Payload, TaskId};

/// Handler installed on an emitter; receives the event payload.
pub type ListenerFn = Arc<dyn Fn(Payload) + Send + Sync + 'static>;

/// Emitter-scoped identity of one installed listener.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ListenerId(pub u64);

/// An event-emitter surface the listener adapters can subscribe to.
pub trait EventEmitter: Send + Sync + 'static {
  /// Installs a persistent listener for `event` and returns its handle.
  fn listen(&self, event: &str, handler: ListenerFn) -> ListenerId;

  /// Removes a previously installed listener. Returning `false` means the
  /// emitter offers no way to remove it; the coordinator reports that as a
  /// missing destructor.
  fn unlisten(&self, event: &str, listener: ListenerId) -> bool;

  /// Installs a listener the emitter itself removes after the first fire.
  /// Emitters without native once support keep the default; the
  /// coordinator then wraps the handler so it tears down its own
  /// registration.
  fn listen_once(&self, event: &str, handler: ListenerFn) -> Option<ListenerId> {
    let _ = (event, handler);
    None
  }
}

/// A long-lived computation whose lifetime the coordinator tracks.
pub trait Worker: Send + Sync + 'static {
  /// Stops the worker. Returning `false` means the worker cannot be
  /// stopped; the coordinator reports that as a missing destructor while
  /// still dropping its registry entry.
  fn terminate(&self) -> bool {
    false
  }
}

/// An in-flight remote request: a completion future plus an abort switch.
pub trait Request: Send + Sync + 'static {
  /// Settles when the request finishes, successfully or not.
  fn completion(&self) -> BoxFuture<'static, Result<Payload, RequestError>>;

  /// Aborts the request. When the task was superseded through a replace
  /// join, `replaced_by` carries the successor's id so the transport can
  /// tell the remote endpoint who took over.
  fn abort(&self, replaced_by: Option<TaskId>);
}
