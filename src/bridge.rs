//! The promise bridge: every single-shot primitive in a thenable form.
//!
//! Each bridge registers its resolve side as the task's payload and its
//! reject side on the clear path, so the returned future settles exactly
//! once: with the completion value on natural completion, or with a
//! [`CoordError::Cancelled`] carrying the cancel context when the task is
//! cleared. A task superseded through a replace join hands its pending
//! waiters to the successor instead of rejecting, up to the configured
//! forwarding cap.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::coordinator::{Coordinator, SetOutcome, TaskSpec};
use crate::error::CoordError;
use crate::events::ListenerHandler;
use crate::link::{payload, Canceler, Payload, TaskId, TaskOutcome, Waiter};
use crate::options::{ListenerOptions, TaskOptions};
use crate::registry::Kind;
use crate::shapes::EventEmitter;
use crate::timers::{Fuse, OnceFn};

type WaiterRx = oneshot::Receiver<Result<Payload, CoordError>>;

/// A bridged task: a future over the task's outcome that also exposes the
/// task id, so the underlying registration stays addressable for clears.
#[derive(Debug)]
pub struct Bridged {
  id: TaskId,
  rx: BridgedRx,
}

/// A multi-event bridge (`promisify_once` over a space-separated list)
/// carries one waiter per link and settles on the first verdict any of
/// them produces.
#[derive(Debug)]
enum BridgedRx {
  Single(WaiterRx),
  Any(Vec<WaiterRx>),
}

impl Bridged {
  pub(crate) fn new(id: TaskId, rx: WaiterRx) -> Self {
    Bridged { id, rx: BridgedRx::Single(rx) }
  }

  pub(crate) fn from_receivers(id: TaskId, mut receivers: Vec<WaiterRx>) -> Self {
    let rx = if receivers.len() == 1 {
      BridgedRx::Single(receivers.remove(0))
    } else {
      BridgedRx::Any(receivers)
    };
    Bridged { id, rx }
  }

  pub fn id(&self) -> TaskId {
    self.id
  }
}

impl Future for Bridged {
  type Output = Result<Payload, CoordError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match &mut self.get_mut().rx {
      BridgedRx::Single(rx) => Pin::new(rx).poll(cx).map(|received| match received {
        Ok(verdict) => verdict,
        Err(_) => Err(CoordError::BridgeChannelClosed),
      }),
      BridgedRx::Any(receivers) => {
        let mut index = 0;
        while index < receivers.len() {
          match Pin::new(&mut receivers[index]).poll(cx) {
            Poll::Ready(Ok(verdict)) => return Poll::Ready(verdict),
            // A dropped sender: forget that receiver, keep waiting on the
            // rest. It must not be polled again once it has settled.
            Poll::Ready(Err(_)) => {
              receivers.swap_remove(index);
            }
            Poll::Pending => index += 1,
          }
        }
        if receivers.is_empty() {
          Poll::Ready(Err(CoordError::BridgeChannelClosed))
        } else {
          Poll::Pending
        }
      }
    }
  }
}

fn noop_payload<O: Send + Sync + 'static>() -> OnceFn<O> {
  Box::new(|_owner: &O| TaskOutcome::value(()))
}

impl<O: Send + Sync + 'static> Coordinator<O> {
  /// Thenable `set_timeout`: resolves with `()` after `delay`.
  pub fn sleep(&self, delay: Duration, opts: TaskOptions) -> Bridged {
    let (waiter, rx) = Waiter::new();
    let id = self.single_shot(Kind::Timeout, Fuse::Delay(delay), noop_payload(), opts, Some(waiter));
    Bridged::new(id, rx)
  }

  /// Thenable `set_immediate`: resolves on the next turn of the event
  /// loop.
  pub fn next_tick(&self, opts: TaskOptions) -> Bridged {
    let (waiter, rx) = Waiter::new();
    let id = self.single_shot(Kind::Immediate, Fuse::NextTick, noop_payload(), opts, Some(waiter));
    Bridged::new(id, rx)
  }

  /// Thenable `request_idle_callback`.
  pub fn idle(&self, timeout: Option<Duration>, opts: TaskOptions) -> Bridged {
    let (waiter, rx) = Waiter::new();
    let fuse = self.idle_fuse(timeout);
    let id = self.single_shot(Kind::IdleCallback, fuse, noop_payload(), opts, Some(waiter));
    Bridged::new(id, rx)
  }

  /// Thenable `request_animation_frame`.
  pub fn animation_frame(&self, opts: TaskOptions) -> Bridged {
    let (waiter, rx) = Waiter::new();
    let fuse = Fuse::Delay(self.inner.config.frame_interval);
    let id = self.single_shot(Kind::AnimationFrame, fuse, noop_payload(), opts, Some(waiter));
    Bridged::new(id, rx)
  }

  /// Wraps an arbitrary future as a managed, cancellable task. Clearing
  /// the task rejects the bridge and drops the future.
  pub fn promise<F>(&self, future: F, opts: TaskOptions) -> Bridged
  where
    F: Future<Output = Payload> + Send + 'static,
  {
    let (waiter, rx) = Waiter::new();
    let group = opts.group.clone();
    let token = CancellationToken::new();
    let outcome = self.set_async(TaskSpec {
      kind: Kind::Request,
      interval: false,
      opts,
      canceler: Canceler::Token(token.clone()),
      waiter: Some(waiter),
    });
    match outcome {
      SetOutcome::Merged(id) => Bridged::new(id, rx),
      SetOutcome::Installed(id) => {
        let weak = self.downgrade();
        self.inner.handle.spawn(async move {
          let value = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            value = future => value,
          };
          let Some(inner) = weak.upgrade() else { return };
          let coordinator = Coordinator::from_inner(inner);
          if let Some(link) = coordinator.fire_single(Kind::Request, group.as_deref(), id) {
            coordinator.deliver(link, value);
          }
        });
        Bridged::new(id, rx)
      }
    }
  }

  /// Resolves once any of the named events fires; rejects when the
  /// underlying once-listener is cleared first. Every event's waiter rides
  /// its own link through the generic register path, so a merge join
  /// against a live label attaches to the incumbent and observes its
  /// completion, and a replace join forwards like any other bridge.
  pub fn promisify_once(
    &self,
    emitter: Arc<dyn EventEmitter>,
    events: &str,
    opts: ListenerOptions,
  ) -> Bridged {
    let opts = opts.single(true);
    let handler: ListenerHandler<O> = Arc::new(|_owner: &O, _value: Payload| {});
    let mut ids = Vec::new();
    let mut receivers = Vec::new();
    for event in events.split_whitespace() {
      let (waiter, rx) = Waiter::new();
      ids.push(self.listen_one(emitter.clone(), event, handler.clone(), opts.clone(), Some(waiter)));
      receivers.push(rx);
    }
    // An empty event list registers nothing; the bridge then reports its
    // channel as closed.
    let id = ids.first().copied().unwrap_or_else(TaskId::next);
    Bridged::from_receivers(id, receivers)
  }

  /// Polls `predicate` on the configured probe period and resolves once it
  /// reports `true`. The probe registers under the interval kind, so label
  /// and group clears aimed at intervals cover it; clearing rejects the
  /// bridge.
  pub fn wait<P>(&self, predicate: P, opts: TaskOptions) -> Bridged
  where
    P: Fn(&O) -> bool + Send + 'static,
  {
    let (waiter, rx) = Waiter::new();
    let group = opts.group.clone();
    let token = CancellationToken::new();
    let probe = self.inner.config.wait_probe;
    let outcome = self.set_async(TaskSpec {
      kind: Kind::Interval,
      interval: false,
      opts,
      canceler: Canceler::Token(token.clone()),
      waiter: Some(waiter),
    });
    match outcome {
      SetOutcome::Merged(id) => Bridged::new(id, rx),
      SetOutcome::Installed(id) => {
        let weak = self.downgrade();
        self.inner.handle.spawn(async move {
          let mut ticker = tokio::time::interval(probe);
          loop {
            tokio::select! {
              biased;
              _ = token.cancelled() => return,
              _ = ticker.tick() => {}
            }
            let Some(inner) = weak.upgrade() else { return };
            let coordinator = Coordinator::from_inner(inner);
            if !coordinator.alive(Kind::Interval, group.as_deref(), id) {
              return;
            }
            if predicate(coordinator.owner()) {
              if let Some(link) = coordinator.fire_single(Kind::Interval, group.as_deref(), id) {
                coordinator.deliver(link, payload(()));
              }
              return;
            }
          }
        });
        Bridged::new(id, rx)
      }
    }
  }
}
