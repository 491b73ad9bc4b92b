use std::sync::Arc;

use thiserror::Error;

use crate::link::ClearContext;
use crate::registry::{Kind, Label};

/// The error of a bridged request whose underlying transport failed.
pub type RequestError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the coordinator.
///
/// `Cancelled` is carried, never raised: it is the rejection value of a
/// bridged task and the payload of every cancel context. Only
/// `MissingDestructor` and `ReplacementOverflow` originate in the
/// coordinator itself.
#[derive(Error, Debug)]
pub enum CoordError {
  /// The task was cleared before natural completion. The context names the
  /// cleared task and, on a replacement, its successor.
  #[error("task {} was cancelled", .0.id)]
  Cancelled(ClearContext),

  /// A worker or event emitter offered no way to tear the task down. The
  /// registry entry is removed regardless; leaking is worse than shouting.
  #[error("no destructor available for {kind} task {task}")]
  MissingDestructor { kind: Kind, task: String },

  /// A promise bridge was handed along a replacement chain more times than
  /// the configured cap allows.
  #[error("replacement chain for label {label:?} exceeded {depth} forwards")]
  ReplacementOverflow { label: Option<Label>, depth: u32 },

  /// The bridged request completed with a transport-level failure.
  #[error("request failed: {0}")]
  RequestFailed(RequestError),

  /// The internal result channel of a bridge closed without a verdict.
  #[error("bridge result channel closed unexpectedly")]
  BridgeChannelClosed,
}

impl CoordError {
  /// Returns the cancel context when this error is a cancellation.
  pub fn cancel_context(&self) -> Option<&ClearContext> {
    match self {
      CoordError::Cancelled(context) => Some(context),
      _ => None,
    }
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, CoordError::Cancelled(_))
  }
}
