//! Adapters for the timer family: immediate, timeout, interval, animation
//! frame and idle callback. Each registration installs a link and spawns a
//! driver task on the coordinator's runtime handle; the driver holds only a
//! weak reference back, so an abandoned coordinator is not kept alive by
//! its own timers.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::coordinator::{Coordinator, SetOutcome, TaskSpec};
use crate::error::CoordError;
use crate::link::{Canceler, TaskId, TaskOutcome, Waiter};
use crate::options::{ClearTarget, TaskOptions};
use crate::registry::{Group, Kind};

/// Boxed single-shot payload; invoked with the owner once the primitive
/// fires.
pub(crate) type OnceFn<O> = Box<dyn FnOnce(&O) -> TaskOutcome + Send + 'static>;

/// Boxed interval payload; invoked with the owner on every tick.
pub(crate) type RepeatFn<O> = Box<dyn FnMut(&O) + Send + 'static>;

/// What a single-shot driver waits for before firing.
pub(crate) enum Fuse {
  NextTick,
  Delay(Duration),
}

impl<O: Send + Sync + 'static> Coordinator<O> {
  /// Schedules `callback` for the next turn of the event loop.
  pub fn set_immediate<F, T>(&self, callback: F, opts: TaskOptions) -> TaskId
  where
    F: FnOnce(&O) -> T + Send + 'static,
    T: Into<TaskOutcome>,
  {
    self.single_shot(
      Kind::Immediate,
      Fuse::NextTick,
      Box::new(move |owner: &O| callback(owner).into()),
      opts,
      None,
    )
  }

  /// Schedules `callback` once after `delay`.
  pub fn set_timeout<F, T>(&self, callback: F, delay: Duration, opts: TaskOptions) -> TaskId
  where
    F: FnOnce(&O) -> T + Send + 'static,
    T: Into<TaskOutcome>,
  {
    self.single_shot(
      Kind::Timeout,
      Fuse::Delay(delay),
      Box::new(move |owner: &O| callback(owner).into()),
      opts,
      None,
    )
  }

  /// Schedules `callback` on a recurring timer. Interval tasks never
  /// remove themselves; they live until cleared.
  pub fn set_interval<F>(&self, callback: F, period: Duration, opts: TaskOptions) -> TaskId
  where
    F: FnMut(&O) + Send + 'static,
  {
    let group = opts.group.clone();
    let token = CancellationToken::new();
    let outcome = self.set_async(TaskSpec {
      kind: Kind::Interval,
      interval: true,
      opts,
      canceler: Canceler::Token(token.clone()),
      waiter: None,
    });
    match outcome {
      SetOutcome::Merged(id) => id,
      SetOutcome::Installed(id) => {
        self.spawn_interval(id, group, token, Box::new(callback), period);
        id
      }
    }
  }

  /// Schedules `callback` for the next frame of the configured frame
  /// clock.
  pub fn request_animation_frame<F, T>(&self, callback: F, opts: TaskOptions) -> TaskId
  where
    F: FnOnce(&O) -> T + Send + 'static,
    T: Into<TaskOutcome>,
  {
    let frame = self.inner.config.frame_interval;
    self.single_shot(
      Kind::AnimationFrame,
      Fuse::Delay(frame),
      Box::new(move |owner: &O| callback(owner).into()),
      opts,
      None,
    )
  }

  /// Schedules `callback` for the next idle slot. A `timeout` caps how
  /// long the task may wait for one.
  pub fn request_idle_callback<F, T>(
    &self,
    callback: F,
    timeout: Option<Duration>,
    opts: TaskOptions,
  ) -> TaskId
  where
    F: FnOnce(&O) -> T + Send + 'static,
    T: Into<TaskOutcome>,
  {
    self.single_shot(
      Kind::IdleCallback,
      self.idle_fuse(timeout),
      Box::new(move |owner: &O| callback(owner).into()),
      opts,
      None,
    )
  }

  pub fn clear_immediate(&self, target: impl Into<ClearTarget>) -> Result<(), CoordError> {
    self.clear_kind(Kind::Immediate, target.into())
  }

  pub fn clear_timeout(&self, target: impl Into<ClearTarget>) -> Result<(), CoordError> {
    self.clear_kind(Kind::Timeout, target.into())
  }

  pub fn clear_interval(&self, target: impl Into<ClearTarget>) -> Result<(), CoordError> {
    self.clear_kind(Kind::Interval, target.into())
  }

  pub fn clear_animation_frame(&self, target: impl Into<ClearTarget>) -> Result<(), CoordError> {
    self.clear_kind(Kind::AnimationFrame, target.into())
  }

  pub fn clear_idle_callback(&self, target: impl Into<ClearTarget>) -> Result<(), CoordError> {
    self.clear_kind(Kind::IdleCallback, target.into())
  }

  pub(crate) fn idle_fuse(&self, timeout: Option<Duration>) -> Fuse {
    let idle = self.inner.config.idle_delay;
    Fuse::Delay(timeout.map_or(idle, |cap| cap.min(idle)))
  }

  /// Shared registration path for every single-shot kind, bridged or not.
  pub(crate) fn single_shot(
    &self,
    kind: Kind,
    fuse: Fuse,
    payload: OnceFn<O>,
    opts: TaskOptions,
    waiter: Option<Waiter>,
  ) -> TaskId {
    let group = opts.group.clone();
    let token = CancellationToken::new();
    let outcome = self.set_async(TaskSpec {
      kind,
      interval: false,
      opts,
      canceler: Canceler::Token(token.clone()),
      waiter,
    });
    match outcome {
      SetOutcome::Merged(id) => id,
      SetOutcome::Installed(id) => {
        self.spawn_single(kind, fuse, group, id, token, payload);
        id
      }
    }
  }

  fn spawn_single(
    &self,
    kind: Kind,
    fuse: Fuse,
    group: Option<Group>,
    id: TaskId,
    token: CancellationToken,
    payload: OnceFn<O>,
  ) {
    let weak = self.downgrade();
    self.inner.handle.spawn(async move {
      tokio::select! {
        biased;
        _ = token.cancelled() => {
          trace!(task_id = %id, kind = %kind, "driver cancelled before fire");
          return;
        }
        _ = async {
          match fuse {
            Fuse::NextTick => tokio::task::yield_now().await,
            Fuse::Delay(delay) => tokio::time::sleep(delay).await,
          }
        } => {}
      }
      let Some(inner) = weak.upgrade() else { return };
      Coordinator::from_inner(inner).run_single(kind, group, id, payload);
    });
  }

  /// The synthesized wrapper of every single-shot task. The link is
  /// removed before the payload runs, so a re-entrant registration under
  /// the same label lands in an empty slot; a missing link means the task
  /// was cleared and the fire is a no-op.
  pub(crate) fn run_single(&self, kind: Kind, group: Option<Group>, id: TaskId, payload: OnceFn<O>) {
    let Some(link) = self.fire_single(kind, group.as_deref(), id) else {
      return;
    };
    match payload(self.owner()) {
      TaskOutcome::Value(value) => self.deliver(link, value),
      TaskOutcome::Deferred(future) => {
        let weak = self.downgrade();
        self.inner.handle.spawn(async move {
          let value = future.await;
          if let Some(inner) = weak.upgrade() {
            Coordinator::from_inner(inner).deliver(link, value);
          }
        });
      }
    }
  }

  fn spawn_interval(
    &self,
    id: TaskId,
    group: Option<Group>,
    token: CancellationToken,
    mut payload: RepeatFn<O>,
    period: Duration,
  ) {
    let weak = self.downgrade();
    self.inner.handle.spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick of a tokio interval completes immediately; consume
      // it so the first fire lands one full period after registration.
      ticker.tick().await;
      loop {
        tokio::select! {
          biased;
          _ = token.cancelled() => break,
          _ = ticker.tick() => {}
        }
        let Some(inner) = weak.upgrade() else { break };
        let coordinator = Coordinator::from_inner(inner);
        if !coordinator.alive(Kind::Interval, group.as_deref(), id) {
          break;
        }
        payload(coordinator.owner());
      }
      trace!(task_id = %id, "interval driver stopped");
    });
  }
}
