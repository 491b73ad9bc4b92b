use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::link::{ClearContext, ClearHook, TaskId};
use crate::registry::{Group, Label};

/// How a late arrival at an occupied label is reconciled with the
/// incumbent task.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Join {
  /// Replace: the incumbent is cascade-cleared once the new task is
  /// installed. Pending bridges of the incumbent reject.
  #[default]
  None,
  /// First caller wins: the new payload is dropped and the incumbent's id
  /// is returned. Bridge waiters of late callers attach to the incumbent.
  Merge,
  /// Last caller wins: the incumbent is cascade-cleared and its pending
  /// bridge waiters are forwarded onto the successor.
  Replace,
}

/// Registration options shared by every primitive wrapper.
#[derive(Clone, Default)]
pub struct TaskOptions {
  pub(crate) join: Join,
  pub(crate) label: Option<Label>,
  pub(crate) group: Option<Group>,
  pub(crate) name: Option<Arc<str>>,
  pub(crate) on_clear: Vec<ClearHook>,
}

impl TaskOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn join(mut self, join: Join) -> Self {
    self.join = join;
    self
  }

  pub fn label(mut self, label: impl Into<Label>) -> Self {
    self.label = Some(label.into());
    self
  }

  pub fn group(mut self, group: impl Into<Group>) -> Self {
    self.group = Some(group.into());
    self
  }

  /// Display name used in diagnostics and missing-destructor reports.
  pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
    self.name = Some(name.into());
    self
  }

  /// Registers a hook that runs if the task is cleared before natural
  /// completion. Hooks run in registration order.
  pub fn on_clear<F>(mut self, hook: F) -> Self
  where
    F: Fn(&ClearContext) + Send + Sync + 'static,
  {
    self.on_clear.push(Arc::new(hook));
    self
  }
}

impl fmt::Debug for TaskOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskOptions")
      .field("join", &self.join)
      .field("label", &self.label)
      .field("group", &self.group)
      .field("name", &self.name)
      .field("clear_hooks", &self.on_clear.len())
      .finish()
  }
}

/// Options for listener registrations: everything in [`TaskOptions`] plus
/// the single-shot flag.
#[derive(Clone, Default, Debug)]
pub struct ListenerOptions {
  pub(crate) task: TaskOptions,
  pub(crate) single: bool,
}

impl ListenerOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Removes the listener after its first fire. `once` is `on` with this
  /// flag set.
  pub fn single(mut self, single: bool) -> Self {
    self.single = single;
    self
  }

  pub fn join(mut self, join: Join) -> Self {
    self.task = self.task.join(join);
    self
  }

  pub fn label(mut self, label: impl Into<Label>) -> Self {
    self.task = self.task.label(label);
    self
  }

  pub fn group(mut self, group: impl Into<Group>) -> Self {
    self.task = self.task.group(group);
    self
  }

  pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
    self.task = self.task.name(name);
    self
  }

  pub fn on_clear<F>(mut self, hook: F) -> Self
  where
    F: Fn(&ClearContext) + Send + Sync + 'static,
  {
    self.task = self.task.on_clear(hook);
    self
  }
}

impl From<TaskOptions> for ListenerOptions {
  fn from(task: TaskOptions) -> Self {
    ListenerOptions { task, single: false }
  }
}

/// Group selector for clear calls: an exact name or a pattern matched
/// against every group under the kind.
#[derive(Clone, Debug)]
pub enum GroupPattern {
  Exact(Group),
  Pattern(Regex),
}

impl GroupPattern {
  pub fn matches(&self, group: &str) -> bool {
    match self {
      GroupPattern::Exact(name) => name == group,
      GroupPattern::Pattern(pattern) => pattern.is_match(group),
    }
  }
}

impl From<&str> for GroupPattern {
  fn from(name: &str) -> Self {
    GroupPattern::Exact(name.to_string())
  }
}

impl From<String> for GroupPattern {
  fn from(name: String) -> Self {
    GroupPattern::Exact(name)
  }
}

impl From<Regex> for GroupPattern {
  fn from(pattern: Regex) -> Self {
    GroupPattern::Pattern(pattern)
  }
}

/// Options for clear calls. With no id, label or group the clear sweeps
/// the whole kind (root scope and every group). A label without a group
/// addresses the root scope; an id is unique across scopes, so an id-only
/// clear finds its task in whichever scope holds it.
#[derive(Clone, Default, Debug)]
pub struct ClearOptions {
  pub(crate) id: Option<TaskId>,
  pub(crate) label: Option<Label>,
  pub(crate) group: Option<GroupPattern>,
  pub(crate) reason: Option<Arc<str>>,
}

impl ClearOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn id(mut self, id: TaskId) -> Self {
    self.id = Some(id);
    self
  }

  pub fn label(mut self, label: impl Into<Label>) -> Self {
    self.label = Some(label.into());
    self
  }

  pub fn group(mut self, group: impl Into<GroupPattern>) -> Self {
    self.group = Some(group.into());
    self
  }

  /// Free-form cause recorded in the cancel context.
  pub fn reason(mut self, reason: impl Into<Arc<str>>) -> Self {
    self.reason = Some(reason.into());
    self
  }
}

/// Target of a clear call: a bare id or a full option set.
#[derive(Clone, Debug)]
pub enum ClearTarget {
  Id(TaskId),
  Options(ClearOptions),
}

impl From<TaskId> for ClearTarget {
  fn from(id: TaskId) -> Self {
    ClearTarget::Id(id)
  }
}

impl From<ClearOptions> for ClearTarget {
  fn from(options: ClearOptions) -> Self {
    ClearTarget::Options(options)
  }
}

/// Tunables of one coordinator instance.
#[derive(Clone, Debug)]
pub struct Config {
  /// Period of the animation-frame clock.
  pub frame_interval: Duration,
  /// Longest the idle adapter waits before firing when no timeout caps it.
  pub idle_delay: Duration,
  /// Polling period of [`Coordinator::wait`](crate::Coordinator::wait).
  pub wait_probe: Duration,
  /// How many times a bridge waiter may be handed along a replacement
  /// chain before it rejects with `ReplacementOverflow`.
  pub max_forwards: u32,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      frame_interval: Duration::from_micros(16_667),
      idle_delay: Duration::from_millis(50),
      wait_probe: Duration::from_millis(15),
      max_forwards: 25,
    }
  }
}
