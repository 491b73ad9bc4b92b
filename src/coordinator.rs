use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use tokio::runtime::Handle as TokioHandle;
use tracing::{debug, error, trace, warn};

use crate::error::CoordError;
use crate::link::{Canceler, ClearContext, Link, Payload, TaskId, Waiter};
use crate::options::{ClearOptions, ClearTarget, Config, GroupPattern, Join, TaskOptions};
use crate::registry::{Group, Kind, Registry};

/// Owner-scoped coordinator for deferred work.
///
/// One coordinator wraps every kind of deferred task its owner starts
/// (timers, idle and frame callbacks, workers, requests, proxied callbacks
/// and event subscriptions) behind a uniform registry that supports
/// labeled deduplication, grouping, bulk cancellation and competitive-join
/// policies. The owner value is passed by reference to every user callback.
///
/// Cloning is cheap and shares the registry. When the last clone is
/// dropped, every remaining task is cleared and its destructor runs.
pub struct Coordinator<O: Send + Sync + 'static = ()> {
  pub(crate) inner: Arc<Inner<O>>,
}

impl<O: Send + Sync + 'static> Clone for Coordinator<O> {
  fn clone(&self) -> Self {
    Coordinator { inner: self.inner.clone() }
  }
}

pub(crate) struct Inner<O: Send + Sync + 'static> {
  pub(crate) name: Arc<String>,
  pub(crate) owner: Arc<O>,
  pub(crate) handle: TokioHandle,
  pub(crate) config: Config,
  pub(crate) registry: Mutex<Registry>,
}

/// Internal registration descriptor consumed by [`Coordinator::set_async`].
pub(crate) struct TaskSpec {
  pub(crate) kind: Kind,
  pub(crate) interval: bool,
  pub(crate) opts: TaskOptions,
  pub(crate) canceler: Canceler,
  pub(crate) waiter: Option<Waiter>,
}

/// Whether `set_async` installed a fresh link or merged into an incumbent.
/// Adapters only start their primitive on `Installed`.
pub(crate) enum SetOutcome {
  Installed(TaskId),
  Merged(TaskId),
}

impl SetOutcome {
  pub(crate) fn id(&self) -> TaskId {
    match self {
      SetOutcome::Installed(id) | SetOutcome::Merged(id) => *id,
    }
  }
}

impl<O: Send + Sync + 'static> Coordinator<O> {
  pub fn new(owner: O, handle: TokioHandle, name: &str) -> Self {
    Self::with_config(owner, handle, name, Config::default())
  }

  pub fn with_config(owner: O, handle: TokioHandle, name: &str, config: Config) -> Self {
    debug!(coordinator = %name, "coordinator created");
    Coordinator {
      inner: Arc::new(Inner {
        name: Arc::new(name.to_string()),
        owner: Arc::new(owner),
        handle,
        config,
        registry: Mutex::new(Registry::default()),
      }),
    }
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  pub fn owner(&self) -> &O {
    &self.inner.owner
  }

  /// Number of live tasks across every kind and group.
  pub fn live_task_count(&self) -> usize {
    self.lock_registry().len()
  }

  pub fn live_task_count_of(&self, kind: Kind) -> usize {
    self.lock_registry().cache(kind).map_or(0, |cache| cache.len())
  }

  /// Clears every live task across every kind. Listeners are torn down
  /// first so their unsubscriptions run before any timer destructor, then
  /// the timer family, then workers, requests and proxies.
  pub fn clear_all(&self, opts: ClearOptions) -> Result<(), CoordError> {
    debug!(coordinator = %self.inner.name, "clearing all kinds");
    let mut first_error: Option<CoordError> = None;
    for kind in Kind::TEARDOWN_ORDER {
      if let Err(error) = self.clear_kind(kind, ClearTarget::Options(opts.clone())) {
        first_error.get_or_insert(error);
      }
    }
    first_error.map_or(Ok(()), Err)
  }

  /// The generic register engine shared by all adapters: resolves the
  /// scope, applies the label join policy, installs the link, and finally
  /// cascade-clears a displaced incumbent with `replaced_by` pointing at
  /// the fresh task.
  pub(crate) fn set_async(&self, mut spec: TaskSpec) -> SetOutcome {
    let forward = spec.opts.join == Join::Replace;
    let id = TaskId::next();
    let mut displaced: Option<Link> = None;
    let mut overflowed: Vec<Waiter> = Vec::new();
    {
      let mut registry = self.lock_registry();
      let cache = registry.ensure_cache(spec.kind).scope_mut(spec.opts.group.as_deref());

      let mut prior_id = None;
      if let Some(label) = spec.opts.label.as_deref() {
        if let Some(found) = cache.live_id(label) {
          if spec.opts.join == Join::Merge {
            if let Some(incumbent) = cache.links.get_mut(&found) {
              if let Some(waiter) = spec.waiter.take() {
                incumbent.on_complete.push(waiter);
              }
              incumbent.on_clear.extend(spec.opts.on_clear.iter().cloned());
              trace!(
                coordinator = %self.inner.name,
                task_id = %found,
                kind = %spec.kind,
                ?label,
                "merge join attached to incumbent task"
              );
              return SetOutcome::Merged(found);
            }
          } else {
            prior_id = Some(found);
          }
        }
      }

      let mut link = Link {
        id,
        kind: spec.kind,
        label: spec.opts.label.clone(),
        group: spec.opts.group.clone(),
        name: spec.opts.name.clone(),
        interval: spec.interval,
        canceler: spec.canceler,
        on_clear: std::mem::take(&mut spec.opts.on_clear),
        on_complete: Vec::new(),
      };
      if let Some(waiter) = spec.waiter.take() {
        link.on_complete.push(waiter);
      }

      if let Some(mut prior) = prior_id.and_then(|pid| cache.remove(pid)) {
        if forward {
          // Replace join: pending bridge waiters are handed to the
          // successor instead of rejecting. The depth cap bounds storms of
          // rapid replacement.
          let cap = self.inner.config.max_forwards;
          for mut waiter in prior.on_complete.drain(..) {
            waiter.depth += 1;
            if waiter.depth >= cap {
              overflowed.push(waiter);
            } else {
              link.on_complete.push(waiter);
            }
          }
        }
        displaced = Some(prior);
      }

      cache.install(link);
    }

    if let Some(prior) = displaced {
      debug!(
        coordinator = %self.inner.name,
        task_id = %prior.id,
        successor = %id,
        kind = %prior.kind,
        "label occupied; cascading clear of the displaced task"
      );
      let context = prior.context(None, Some(id));
      for waiter in overflowed {
        let depth = waiter.depth;
        let _ = waiter.tx.send(Err(CoordError::ReplacementOverflow {
          label: context.label.clone(),
          depth,
        }));
      }
      if let Err(error) = self.finish_clear(prior, &context, forward) {
        warn!(
          coordinator = %self.inner.name,
          task_id = %context.id,
          %error,
          "destructor failure while cascading a replacement"
        );
      }
    }

    SetOutcome::Installed(id)
  }

  /// The generic cancel engine. Resolves the scope set (a group pattern
  /// fans out over every matching group), picks the doomed ids, removes
  /// their links under the lock, and then runs hooks and destructors with
  /// the lock released so hooks may re-enter the coordinator.
  pub(crate) fn clear_kind(&self, kind: Kind, target: ClearTarget) -> Result<(), CoordError> {
    let opts = match target {
      ClearTarget::Id(id) => ClearOptions::new().id(id),
      ClearTarget::Options(opts) => opts,
    };

    let mut removed: Vec<(Link, ClearContext)> = Vec::new();
    {
      let mut registry = self.lock_registry();
      let Some(cache_object) = registry.cache_mut(kind) else {
        return Ok(());
      };

      let scopes: Vec<Option<Group>> = match &opts.group {
        Some(GroupPattern::Exact(name)) => vec![Some(name.clone())],
        Some(GroupPattern::Pattern(pattern)) => cache_object
          .matching_groups(pattern)
          .into_iter()
          .map(Some)
          .collect(),
        // Ids are unique across scopes, so an id-only clear may search the
        // root and every group; without any target this is the whole-kind
        // sweep. A label without a group stays in the root scope.
        None if opts.label.is_none() => {
          let mut scopes: Vec<Option<Group>> = vec![None];
          scopes.extend(cache_object.group_names().into_iter().map(Some));
          scopes
        }
        None => vec![None],
      };

      for scope in scopes {
        let Some(cache) = cache_object.existing_mut(scope.as_deref()) else {
          continue;
        };
        let doomed: Vec<TaskId> = if let Some(label) = opts.label.as_deref() {
          match cache.live_id(label) {
            // A stale id alongside the label is a guard against clearing a
            // successor that took the label over; disagreement is a no-op.
            Some(found) if opts.id.map_or(true, |id| id == found) => vec![found],
            _ => continue,
          }
        } else if let Some(id) = opts.id {
          vec![id]
        } else {
          cache.ids()
        };

        for id in doomed {
          if let Some(link) = cache.remove(id) {
            let context = link.context(opts.reason.clone(), None);
            removed.push((link, context));
          }
        }
      }
    }

    let mut first_error: Option<CoordError> = None;
    for (link, context) in removed {
      trace!(coordinator = %self.inner.name, task_id = %context.id, kind = %kind, "clearing task");
      if let Err(error) = self.finish_clear(link, &context, false) {
        warn!(
          coordinator = %self.inner.name,
          task_id = %context.id,
          kind = %kind,
          %error,
          "destructor failure"
        );
        first_error.get_or_insert(error);
      }
    }
    first_error.map_or(Ok(()), Err)
  }

  /// Post-removal pipeline: reject waiters, run clear hooks in order, then
  /// invoke the kind's destructor. Must be called with the registry lock
  /// released.
  pub(crate) fn finish_clear(
    &self,
    link: Link,
    context: &ClearContext,
    forwarded: bool,
  ) -> Result<(), CoordError> {
    run_clear_pipeline(&self.inner.name, link, context, forwarded)
  }

  /// Removes a single-shot link right before its payload runs. Returning
  /// `None` means the task was already cleared and the fire must become a
  /// no-op. Removing first is what makes a same-label re-registration from
  /// inside the callback land in an empty slot. Interval-like links leave
  /// the registry only through a clear, never through this path.
  pub(crate) fn fire_single(&self, kind: Kind, group: Option<&str>, id: TaskId) -> Option<Link> {
    let mut registry = self.lock_registry();
    let link = registry.cache_mut(kind)?.existing_mut(group)?.remove(id)?;
    debug_assert!(
      !link.interval,
      "interval-like task {} took the single-shot exit path",
      link.id
    );
    Some(link)
  }

  /// Liveness probe used by interval-like drivers before each callback run.
  pub(crate) fn alive(&self, kind: Kind, group: Option<&str>, id: TaskId) -> bool {
    let registry = self.lock_registry();
    registry
      .cache(kind)
      .and_then(|cache| cache.scope(group))
      .map_or(false, |cache| cache.links.contains_key(&id))
  }

  /// Fires the completion side of a removed link: every pending waiter
  /// resolves with the value.
  pub(crate) fn deliver(&self, mut link: Link, value: Payload) {
    for waiter in link.on_complete.drain(..) {
      let _ = waiter.tx.send(Ok(value.clone()));
    }
  }

  /// Rejects every pending waiter of a removed link with a request failure.
  pub(crate) fn deliver_failure(&self, mut link: Link, source: crate::error::RequestError) {
    for waiter in link.on_complete.drain(..) {
      let _ = waiter.tx.send(Err(CoordError::RequestFailed(source.clone())));
    }
  }

  /// Patches the destructor of a link whose primitive finished registering
  /// after the link was installed (listeners and requests hand out their
  /// handles late). If the task was cleared in between, the fresh
  /// destructor runs immediately so nothing leaks.
  pub(crate) fn attach_canceler(&self, kind: Kind, group: Option<&str>, id: TaskId, canceler: Canceler) {
    {
      let mut registry = self.lock_registry();
      if let Some(link) = registry
        .cache_mut(kind)
        .and_then(|cache| cache.existing_mut(group))
        .and_then(|cache| cache.links.get_mut(&id))
      {
        link.canceler = canceler;
        return;
      }
    }
    let context = ClearContext {
      id,
      kind,
      label: None,
      group: group.map(str::to_string),
      name: None,
      reason: None,
      replaced_by: None,
    };
    if let Err(error) = destroy_canceler(canceler, &context, false) {
      warn!(
        coordinator = %self.inner.name,
        task_id = %id,
        %error,
        "late destructor failed for a task cleared mid-registration"
      );
    }
  }

  pub(crate) fn downgrade(&self) -> Weak<Inner<O>> {
    Arc::downgrade(&self.inner)
  }

  pub(crate) fn from_inner(inner: Arc<Inner<O>>) -> Self {
    Coordinator { inner }
  }

  fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
    match self.inner.registry.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}

impl<O: Send + Sync + 'static> Drop for Inner<O> {
  fn drop(&mut self) {
    let registry = match self.registry.get_mut() {
      Ok(registry) => registry,
      Err(poisoned) => poisoned.into_inner(),
    };
    let mut doomed: Vec<Link> = Vec::new();
    for kind in Kind::TEARDOWN_ORDER {
      if let Some(cache) = registry.take_cache(kind) {
        doomed.extend(cache.drain_links());
      }
    }
    if doomed.is_empty() {
      return;
    }
    debug!(
      coordinator = %self.name,
      remaining = doomed.len(),
      "coordinator dropped; clearing remaining tasks"
    );
    for link in doomed {
      let context = link.context(Some(Arc::from("coordinator dropped")), None);
      if let Err(error) = run_clear_pipeline(&self.name, link, &context, false) {
        warn!(coordinator = %self.name, task_id = %context.id, %error, "destructor failure during drop");
      }
    }
  }
}

/// Shared clear pipeline used by live clears and the drop sweep.
///
/// A panicking hook is caught, reported through the tracing sink, and does
/// not stop the remaining hooks; that is this crate's documented policy for
/// hook failures.
pub(crate) fn run_clear_pipeline(
  name: &str,
  mut link: Link,
  context: &ClearContext,
  forwarded: bool,
) -> Result<(), CoordError> {
  for waiter in link.on_complete.drain(..) {
    let _ = waiter.tx.send(Err(CoordError::Cancelled(context.clone())));
  }
  for hook in link.on_clear.drain(..) {
    if catch_unwind(AssertUnwindSafe(|| hook(context))).is_err() {
      error!(
        coordinator = %name,
        task_id = %context.id,
        kind = %context.kind,
        "clear hook panicked; continuing with the remaining hooks"
      );
    }
  }
  destroy_canceler(link.canceler, context, forwarded)
}

fn destroy_canceler(
  canceler: Canceler,
  context: &ClearContext,
  forwarded: bool,
) -> Result<(), CoordError> {
  match canceler {
    Canceler::Token(token) => {
      token.cancel();
      Ok(())
    }
    Canceler::Worker(worker) => {
      if worker.terminate() {
        Ok(())
      } else {
        Err(CoordError::MissingDestructor {
          kind: context.kind,
          task: context.describe(),
        })
      }
    }
    Canceler::Request { request, token } => {
      // The successor's id travels as the abort reason only when the task
      // was superseded through a replace join.
      request.abort(if forwarded { context.replaced_by } else { None });
      token.cancel();
      Ok(())
    }
    Canceler::Listener { emitter, event, registration } => {
      if emitter.unlisten(&event, registration) {
        Ok(())
      } else {
        Err(CoordError::MissingDestructor {
          kind: context.kind,
          task: context.describe(),
        })
      }
    }
    Canceler::Inert => Ok(()),
  }
}

impl<O: Send + Sync + 'static> std::fmt::Debug for Coordinator<O> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Coordinator")
      .field("name", &self.inner.name)
      .field("live_tasks", &self.live_task_count())
      .finish_non_exhaustive()
  }
}
