//! Owner-scoped coordination of deferred work: timers, event listeners,
//! workers and requests behind one registry with labeled deduplication,
//! grouping, bulk cancellation and competitive-join policies.
//!
//! The entry point is [`Coordinator`]. Every registration may carry a
//! label (at most one live task per `(kind, group, label)`), a group (the
//! unit of bulk cancellation) and a [`Join`] policy deciding how a late
//! arrival at an occupied label is reconciled with the incumbent. Every
//! single-shot primitive also exists in a thenable form returning
//! [`Bridged`], whose rejection carries the full cancel context.

mod bridge;
mod coordinator;
mod error;
mod events;
mod link;
mod options;
mod registry;
mod shapes;
mod timers;
mod workers;

pub use bridge::Bridged;
pub use coordinator::Coordinator;
pub use error::{CoordError, RequestError};
pub use events::{DndOptions, DragHandler};
pub use link::{payload, ClearContext, ClearHook, Payload, TaskId, TaskOutcome};
pub use options::{ClearOptions, ClearTarget, Config, GroupPattern, Join, ListenerOptions, TaskOptions};
pub use registry::{Group, Kind, Label};
pub use shapes::{EventEmitter, ListenerFn, ListenerId, Request, Worker};
pub use workers::ProxyFn;
