use std::collections::{BTreeMap, HashMap};
use std::fmt;

use regex::Regex;

use crate::link::{Link, TaskId};

/// A uniqueness key within `(kind, group)`; at most one live task may hold
/// a given label at any time.
pub type Label = String;

/// A user-supplied sub-scope within a kind; the unit of bulk cancellation.
pub type Group = String;

/// The category of primitive a task belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Kind {
  Immediate,
  Timeout,
  Interval,
  AnimationFrame,
  IdleCallback,
  Worker,
  Request,
  Proxy,
  EventListener,
}

impl Kind {
  /// Cross-kind teardown order for `clear_all`: listeners go first so their
  /// unsubscriptions run before any timer they may depend on, then the
  /// timer family, then workers, requests and proxies.
  pub(crate) const TEARDOWN_ORDER: [Kind; 9] = [
    Kind::EventListener,
    Kind::Immediate,
    Kind::Timeout,
    Kind::Interval,
    Kind::AnimationFrame,
    Kind::IdleCallback,
    Kind::Worker,
    Kind::Request,
    Kind::Proxy,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      Kind::Immediate => "immediate",
      Kind::Timeout => "timeout",
      Kind::Interval => "interval",
      Kind::AnimationFrame => "animation_frame",
      Kind::IdleCallback => "idle_callback",
      Kind::Worker => "worker",
      Kind::Request => "request",
      Kind::Proxy => "proxy",
      Kind::EventListener => "event_listener",
    }
  }
}

impl fmt::Display for Kind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One scope's worth of live tasks: a label index plus the links themselves.
///
/// `TaskId`s are allocated monotonically, so iterating the `BTreeMap` walks
/// links in insertion order; bulk clears snapshot that order before any
/// user hook can mutate the cache.
#[derive(Default)]
pub(crate) struct LocalCache {
  pub(crate) labels: HashMap<Label, TaskId>,
  pub(crate) links: BTreeMap<TaskId, Link>,
}

impl LocalCache {
  pub(crate) fn live_id(&self, label: &str) -> Option<TaskId> {
    self.labels.get(label).copied()
  }

  pub(crate) fn install(&mut self, link: Link) {
    if let Some(label) = &link.label {
      self.labels.insert(label.clone(), link.id);
    }
    self.links.insert(link.id, link);
  }

  /// Removes a link and, if it still owns its label slot, frees the label.
  /// The ownership check keeps a stale removal from erasing a successor's
  /// label entry.
  pub(crate) fn remove(&mut self, id: TaskId) -> Option<Link> {
    let link = self.links.remove(&id)?;
    if let Some(label) = &link.label {
      if self.labels.get(label) == Some(&id) {
        self.labels.remove(label);
      }
    }
    Some(link)
  }

  /// Snapshot of live ids in insertion order.
  pub(crate) fn ids(&self) -> Vec<TaskId> {
    self.links.keys().copied().collect()
  }

  pub(crate) fn len(&self) -> usize {
    self.links.len()
  }
}

/// Per-kind store: the root scope plus named groups.
#[derive(Default)]
pub(crate) struct CacheObject {
  pub(crate) root: LocalCache,
  pub(crate) groups: HashMap<Group, LocalCache>,
}

impl CacheObject {
  pub(crate) fn scope(&self, group: Option<&str>) -> Option<&LocalCache> {
    match group {
      None => Some(&self.root),
      Some(name) => self.groups.get(name),
    }
  }

  /// Resolves a scope, creating the group cache on demand.
  pub(crate) fn scope_mut(&mut self, group: Option<&str>) -> &mut LocalCache {
    match group {
      None => &mut self.root,
      Some(name) => self.groups.entry(name.to_string()).or_default(),
    }
  }

  /// Resolves a scope without creating it.
  pub(crate) fn existing_mut(&mut self, group: Option<&str>) -> Option<&mut LocalCache> {
    match group {
      None => Some(&mut self.root),
      Some(name) => self.groups.get_mut(name),
    }
  }

  /// All group names, sorted for deterministic iteration. Groups are
  /// user-named and few, so the walk stays cheap; no eager index.
  pub(crate) fn group_names(&self) -> Vec<Group> {
    let mut names: Vec<Group> = self.groups.keys().cloned().collect();
    names.sort();
    names
  }

  pub(crate) fn matching_groups(&self, pattern: &Regex) -> Vec<Group> {
    let mut names: Vec<Group> = self
      .groups
      .keys()
      .filter(|name| pattern.is_match(name))
      .cloned()
      .collect();
    names.sort();
    names
  }

  /// Drains every link: root first, then groups in name order.
  pub(crate) fn drain_links(mut self) -> Vec<Link> {
    let mut links: Vec<Link> = Vec::with_capacity(self.root.len());
    links.extend(std::mem::take(&mut self.root.links).into_values());
    for name in self.group_names() {
      if let Some(cache) = self.groups.remove(&name) {
        links.extend(cache.links.into_values());
      }
    }
    links
  }

  pub(crate) fn len(&self) -> usize {
    self.root.len() + self.groups.values().map(LocalCache::len).sum::<usize>()
  }
}

/// The canonical store of live task records: `kind -> group -> links`.
#[derive(Default)]
pub(crate) struct Registry {
  kinds: HashMap<Kind, CacheObject>,
}

impl Registry {
  pub(crate) fn cache(&self, kind: Kind) -> Option<&CacheObject> {
    self.kinds.get(&kind)
  }

  pub(crate) fn cache_mut(&mut self, kind: Kind) -> Option<&mut CacheObject> {
    self.kinds.get_mut(&kind)
  }

  pub(crate) fn ensure_cache(&mut self, kind: Kind) -> &mut CacheObject {
    self.kinds.entry(kind).or_default()
  }

  pub(crate) fn take_cache(&mut self, kind: Kind) -> Option<CacheObject> {
    self.kinds.remove(&kind)
  }

  pub(crate) fn len(&self) -> usize {
    self.kinds.values().map(CacheObject::len).sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::link::Canceler;

  fn dummy_link(id: TaskId, label: Option<&str>) -> Link {
    Link {
      id,
      kind: Kind::Timeout,
      label: label.map(str::to_string),
      group: None,
      name: None,
      interval: false,
      canceler: Canceler::Inert,
      on_clear: Vec::new(),
      on_complete: Vec::new(),
    }
  }

  #[test]
  fn label_points_at_latest_install() {
    let mut cache = LocalCache::default();
    let first = TaskId::next();
    let second = TaskId::next();
    cache.install(dummy_link(first, Some("job")));
    cache.install(dummy_link(second, Some("job")));

    assert_eq!(cache.live_id("job"), Some(second));
    assert_eq!(cache.links.len(), 2);
  }

  #[test]
  fn stale_removal_keeps_successor_label() {
    let mut cache = LocalCache::default();
    let first = TaskId::next();
    let second = TaskId::next();
    cache.install(dummy_link(first, Some("job")));
    cache.install(dummy_link(second, Some("job")));

    // Removing the displaced link must not erase the successor's slot.
    assert!(cache.remove(first).is_some());
    assert_eq!(cache.live_id("job"), Some(second));

    assert!(cache.remove(second).is_some());
    assert_eq!(cache.live_id("job"), None);
  }

  #[test]
  fn id_snapshot_is_insertion_ordered() {
    let mut cache = LocalCache::default();
    let ids: Vec<TaskId> = (0..5).map(|_| TaskId::next()).collect();
    for id in &ids {
      cache.install(dummy_link(*id, None));
    }
    assert_eq!(cache.ids(), ids);
  }

  #[test]
  fn group_matching_is_sorted_and_filtered() {
    let mut object = CacheObject::default();
    object.scope_mut(Some("dnd.2"));
    object.scope_mut(Some("dnd.1"));
    object.scope_mut(Some("poll"));

    let pattern = Regex::new("^dnd\\.").unwrap();
    assert_eq!(object.matching_groups(&pattern), vec!["dnd.1".to_string(), "dnd.2".to_string()]);
    assert_eq!(object.group_names().len(), 3);
  }
}
