//! Listener adapters: `on`, `once`, `off` and the drag-and-drop composite
//! recipe. Every event name in a space-separated list produces its own
//! link, grouped under the event name unless the caller forces a group.

use std::sync::Arc;

use tracing::warn;

use crate::coordinator::{Coordinator, SetOutcome, TaskSpec};
use crate::error::CoordError;
use crate::link::{Canceler, Payload, TaskId, Waiter};
use crate::options::{ClearOptions, ClearTarget, ListenerOptions};
use crate::registry::{Group, Kind};
use crate::shapes::{EventEmitter, ListenerFn};

/// Owner-aware listener callback shared across the events of one
/// registration.
pub(crate) type ListenerHandler<O> = Arc<dyn Fn(&O, Payload) + Send + Sync + 'static>;

/// Handler of one dnd phase.
pub type DragHandler<O> = Arc<dyn Fn(&O, Payload) + Send + Sync + 'static>;

/// Recipe options for [`Coordinator::dnd`].
pub struct DndOptions<O: Send + Sync + 'static = ()> {
  pub(crate) group: Option<Group>,
  pub(crate) on_drag_start: Option<DragHandler<O>>,
  pub(crate) on_drag: Option<DragHandler<O>>,
  pub(crate) on_drag_end: Option<DragHandler<O>>,
}

impl<O: Send + Sync + 'static> Default for DndOptions<O> {
  fn default() -> Self {
    DndOptions { group: None, on_drag_start: None, on_drag: None, on_drag_end: None }
  }
}

impl<O: Send + Sync + 'static> Clone for DndOptions<O> {
  fn clone(&self) -> Self {
    DndOptions {
      group: self.group.clone(),
      on_drag_start: self.on_drag_start.clone(),
      on_drag: self.on_drag.clone(),
      on_drag_end: self.on_drag_end.clone(),
    }
  }
}

impl<O: Send + Sync + 'static> DndOptions<O> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn group(mut self, group: impl Into<Group>) -> Self {
    self.group = Some(group.into());
    self
  }

  pub fn on_drag_start<F>(mut self, handler: F) -> Self
  where
    F: Fn(&O, Payload) + Send + Sync + 'static,
  {
    self.on_drag_start = Some(Arc::new(handler));
    self
  }

  pub fn on_drag<F>(mut self, handler: F) -> Self
  where
    F: Fn(&O, Payload) + Send + Sync + 'static,
  {
    self.on_drag = Some(Arc::new(handler));
    self
  }

  pub fn on_drag_end<F>(mut self, handler: F) -> Self
  where
    F: Fn(&O, Payload) + Send + Sync + 'static,
  {
    self.on_drag_end = Some(Arc::new(handler));
    self
  }
}

impl<O: Send + Sync + 'static> Coordinator<O> {
  /// Subscribes `handler` to every event named in the space-separated
  /// `events` list. Each event gets an independent link; the returned ids
  /// follow the order of the list.
  pub fn on<H>(
    &self,
    emitter: Arc<dyn EventEmitter>,
    events: &str,
    handler: H,
    opts: ListenerOptions,
  ) -> Vec<TaskId>
  where
    H: Fn(&O, Payload) + Send + Sync + 'static,
  {
    let handler: ListenerHandler<O> = Arc::new(handler);
    events
      .split_whitespace()
      .map(|event| self.listen_one(emitter.clone(), event, handler.clone(), opts.clone(), None))
      .collect()
  }

  /// `on` with `single: true`: the listener removes itself after the
  /// first fire. The emitter's native once support is preferred when
  /// offered.
  pub fn once<H>(
    &self,
    emitter: Arc<dyn EventEmitter>,
    events: &str,
    handler: H,
    opts: ListenerOptions,
  ) -> Vec<TaskId>
  where
    H: Fn(&O, Payload) + Send + Sync + 'static,
  {
    self.on(emitter, events, handler, opts.single(true))
  }

  /// Unsubscribes listeners by id, label or group; a group pattern fans
  /// out over every matching group.
  pub fn off(&self, target: impl Into<ClearTarget>) -> Result<(), CoordError> {
    self.clear_kind(Kind::EventListener, target.into())
  }

  /// Installs the drag-and-drop composite: a persistent start listener
  /// (`mousedown touchstart`) which, on fire, registers the move and end
  /// listeners under a private sub-group that the end listener tears down
  /// again. Returns the recipe's group key; clearing a group pattern that
  /// covers it removes the whole recipe.
  pub fn dnd(&self, emitter: Arc<dyn EventEmitter>, opts: DndOptions<O>) -> Group {
    let base = opts.group.unwrap_or_else(|| format!("dnd.{}", TaskId::next()));
    let active = format!("{base}.active");

    let weak = self.downgrade();
    let dnd_emitter = emitter.clone();
    let on_drag_start = opts.on_drag_start;
    let on_drag = opts.on_drag;
    let on_drag_end = opts.on_drag_end;
    let active_scope = active.clone();

    let down = move |owner: &O, value: Payload| {
      let Some(inner) = weak.upgrade() else { return };
      let coordinator = Coordinator::from_inner(inner);
      if let Some(handler) = &on_drag_start {
        handler(owner, value.clone());
      }

      let drag = on_drag.clone();
      coordinator.on(
        dnd_emitter.clone(),
        "mousemove touchmove",
        move |owner: &O, value: Payload| {
          if let Some(handler) = &drag {
            handler(owner, value);
          }
        },
        ListenerOptions::new().group(active_scope.clone()),
      );

      let finish = on_drag_end.clone();
      let finish_scope = active_scope.clone();
      let finish_coordinator = coordinator.clone();
      coordinator.once(
        dnd_emitter.clone(),
        "mouseup touchend",
        move |owner: &O, value: Payload| {
          if let Some(handler) = &finish {
            handler(owner, value);
          }
          if let Err(error) = finish_coordinator.off(ClearOptions::new().group(finish_scope.clone())) {
            warn!(%error, "dnd teardown reported a destructor failure");
          }
        },
        ListenerOptions::new().group(active_scope.clone()),
      );
    };

    self.on(emitter, "mousedown touchstart", down, ListenerOptions::new().group(base.clone()));
    base
  }

  /// Registers one event of a listener registration. A bridge waiter, when
  /// given, rides the link through the generic register path, so merge
  /// joins attach it to the incumbent and replace joins forward it.
  pub(crate) fn listen_one(
    &self,
    emitter: Arc<dyn EventEmitter>,
    event: &str,
    handler: ListenerHandler<O>,
    opts: ListenerOptions,
    waiter: Option<Waiter>,
  ) -> TaskId {
    let single = opts.single;
    let mut task = opts.task;
    let group = task.group.get_or_insert_with(|| event.to_string()).clone();

    let outcome = self.set_async(TaskSpec {
      kind: Kind::EventListener,
      interval: !single,
      opts: task,
      canceler: Canceler::Inert,
      waiter,
    });
    let id = match outcome {
      SetOutcome::Merged(id) => return id,
      SetOutcome::Installed(id) => id,
    };

    let registration = if single {
      // Prefer the emitter's own once support; otherwise the fire path
      // removes the registration itself.
      match emitter.listen_once(event, self.single_fire(group.clone(), id, handler.clone(), false)) {
        Some(registration) => registration,
        None => emitter.listen(event, self.single_fire(group.clone(), id, handler, true)),
      }
    } else {
      emitter.listen(event, self.persistent_fire(group.clone(), id, handler))
    };

    self.attach_canceler(
      Kind::EventListener,
      Some(&group),
      id,
      Canceler::Listener { emitter, event: event.to_string(), registration },
    );
    id
  }

  /// Emitter-side wrapper of a single listener: removes the link before
  /// the user handler runs, optionally removes its own emitter
  /// registration, then resolves any pending waiters with the event value.
  fn single_fire(
    &self,
    group: Group,
    id: TaskId,
    handler: ListenerHandler<O>,
    self_unlisten: bool,
  ) -> ListenerFn {
    let weak = self.downgrade();
    Arc::new(move |value: Payload| {
      let Some(inner) = weak.upgrade() else { return };
      let coordinator = Coordinator::from_inner(inner);
      let Some(link) = coordinator.fire_single(Kind::EventListener, Some(&group), id) else {
        return;
      };
      handler(coordinator.owner(), value.clone());
      if self_unlisten {
        if let Canceler::Listener { emitter, event, registration } = &link.canceler {
          if !emitter.unlisten(event, *registration) {
            warn!(task_id = %id, event = %event, "single listener could not remove its own registration");
          }
        }
      }
      coordinator.deliver(link, value);
    })
  }

  fn persistent_fire(&self, group: Group, id: TaskId, handler: ListenerHandler<O>) -> ListenerFn {
    let weak = self.downgrade();
    Arc::new(move |value: Payload| {
      let Some(inner) = weak.upgrade() else { return };
      let coordinator = Coordinator::from_inner(inner);
      if !coordinator.alive(Kind::EventListener, Some(&group), id) {
        return;
      }
      handler(coordinator.owner(), value);
    })
  }
}
