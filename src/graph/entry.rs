use ahash::AHashSet;
use parking_lot::Mutex;

use crate::error::NodeError;
use crate::key::NodeKey;
use crate::value::{values_equal, Value};
use crate::version::Version;

/// The memoized outcome of a node: a value or the error it failed with.
pub type NodeResult = Result<Value, NodeError>;

/// Lifecycle state of a graph entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Created on first reference, never evaluated.
    NeverBuilt,
    /// Being checked or computed in the current build.
    Building,
    /// Holds a value or error that is valid for the current version.
    Done,
    /// A transitive dependency may have changed; old dependencies must be re-checked.
    Dirty,
    /// Must be recomputed. The old value is kept for change pruning.
    Changed,
    /// Scheduled for removal from the graph.
    Deleted,
    /// Value dropped to save memory; edges and versions are kept. Recomputed on demand.
    Evicted,
}

/// How an invalidation marks a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyKind {
    /// A dependency may have changed.
    Dirty,
    /// The node itself changed.
    Changed,
    /// The node is going away.
    Deletion,
}

/// Result of registering interest in a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    /// The node is done for this build; its value can be read now.
    Done,
    /// The caller just moved the node into `Building` and must schedule it.
    NeedsScheduling,
    /// Someone else is evaluating the node; the caller will be signaled.
    AlreadyEvaluating,
}

/// Dependencies in the order and grouping they were requested.
///
/// Each `get_value`/`get_values` call of a node function forms one group. A dirty node
/// re-checks its old groups in order and stops at the first group containing a change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupedDeps {
    groups: Vec<Vec<NodeKey>>,
}

impl GroupedDeps {
    /// No dependencies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a group. Empty groups are dropped.
    pub fn push_group(&mut self, group: Vec<NodeKey>) {
        if !group.is_empty() {
            self.groups.push(group);
        }
    }

    /// Number of groups.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// One group.
    pub fn group(&self, index: usize) -> &[NodeKey] {
        self.groups.get(index).map_or(&[], Vec::as_slice)
    }

    /// Iterate over every dependency.
    pub fn iter(&self) -> impl Iterator<Item = &NodeKey> + '_ {
        self.groups.iter().flatten()
    }

    /// Total dependencies.
    pub fn len(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    /// Returns true if there are no dependencies.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Returns true if `key` is among the dependencies.
    pub fn contains(&self, key: &NodeKey) -> bool {
        self.iter().any(|k| k == key)
    }
}

impl FromIterator<Vec<NodeKey>> for GroupedDeps {
    fn from_iter<T: IntoIterator<Item = Vec<NodeKey>>>(iter: T) -> Self {
        let mut deps = GroupedDeps::new();
        for group in iter {
            deps.push_group(group);
        }
        deps
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Re-checking old dependency groups; `next_group` groups have been requested.
    CheckDependencies { next_group: usize },
    /// The function will run (again).
    Rebuilding,
}

#[derive(Debug)]
struct Building {
    prior: NodeState,
    phase: Phase,
    registered: Vec<NodeKey>,
    registered_set: AHashSet<NodeKey>,
    signaled: usize,
    waiting_parents: Vec<NodeKey>,
    caught: AHashSet<NodeKey>,
    restarts: usize,
}

impl Building {
    fn new(prior: NodeState) -> Self {
        let phase = match prior {
            NodeState::Dirty => Phase::CheckDependencies { next_group: 0 },
            _ => Phase::Rebuilding,
        };
        Self {
            prior,
            phase,
            registered: Vec::new(),
            registered_set: AHashSet::new(),
            signaled: 0,
            waiting_parents: Vec::new(),
            caught: AHashSet::new(),
            restarts: 0,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: NodeState,
    result: Option<NodeResult>,
    deps: GroupedDeps,
    rdeps: AHashSet<NodeKey>,
    last_changed: Version,
    last_evaluated: Version,
    building: Option<Building>,
}

/// What [`NodeEntry::set_value`] did.
#[derive(Debug)]
pub(crate) struct SetValueOutcome {
    /// The new value equaled the old one and the old value object was kept.
    pub kept_old_value: bool,
    /// Parents that were waiting for this node in the current build.
    pub waiting_parents: Vec<NodeKey>,
    /// Keys that used to be dependencies and no longer are.
    pub stale_deps: Vec<NodeKey>,
}

/// What a dirty-checking node should do next.
#[derive(Debug)]
pub(crate) enum CheckState {
    /// Not checking; the function must run.
    Rebuild,
    /// Checking; `next_group` old groups have already been requested.
    Checking {
        next_group: usize,
        last_evaluated: Version,
        old_deps: GroupedDeps,
    },
}

/// One node of the graph.
///
/// All state sits behind a per-entry mutex, so unrelated keys never contend. No method
/// holds the lock while touching another entry.
#[derive(Debug)]
pub struct NodeEntry {
    key: NodeKey,
    inner: Mutex<Inner>,
}

impl NodeEntry {
    pub(crate) fn new(key: NodeKey) -> Self {
        Self {
            key,
            inner: Mutex::new(Inner {
                state: NodeState::NeverBuilt,
                result: None,
                deps: GroupedDeps::new(),
                rdeps: AHashSet::new(),
                last_changed: Version::NEVER,
                last_evaluated: Version::NEVER,
                building: None,
            }),
        }
    }

    /// The key of this entry.
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        self.inner.lock().state
    }

    /// Returns true if the entry is done for the current version.
    pub fn is_done(&self) -> bool {
        self.state() == NodeState::Done
    }

    /// The value or error, if the entry is done.
    pub fn result(&self) -> Option<NodeResult> {
        let inner = self.inner.lock();
        match inner.state {
            NodeState::Done => inner.result.clone(),
            _ => None,
        }
    }

    /// The value, if the entry is done without error.
    pub fn value(&self) -> Option<Value> {
        self.result().and_then(Result::ok)
    }

    /// The last value or error ever stored, even if the entry is dirty.
    pub fn last_result(&self) -> Option<NodeResult> {
        self.inner.lock().result.clone()
    }

    /// The version at which the value last changed.
    pub fn last_changed(&self) -> Version {
        self.inner.lock().last_changed
    }

    /// The version at which the entry was last verified or computed.
    pub fn last_evaluated(&self) -> Version {
        self.inner.lock().last_evaluated
    }

    /// Dependencies of the last completed evaluation.
    pub fn direct_deps(&self) -> GroupedDeps {
        self.inner.lock().deps.clone()
    }

    /// Nodes that depend on this one.
    pub fn reverse_deps(&self) -> Vec<NodeKey> {
        self.inner.lock().rdeps.iter().cloned().collect()
    }

    pub(crate) fn add_rdep(&self, key: &NodeKey) {
        self.inner.lock().rdeps.insert(key.clone());
    }

    pub(crate) fn remove_rdep(&self, key: &NodeKey) {
        self.inner.lock().rdeps.remove(key);
    }

    /// Register `parent` as interested in this node and report whether the node is done.
    ///
    /// Exactly one caller observes [`DependencyState::NeedsScheduling`] per build, which
    /// keeps at most one evaluation of a key in flight.
    pub(crate) fn add_reverse_dep_and_check_if_done(
        &self,
        parent: Option<&NodeKey>,
    ) -> DependencyState {
        let mut inner = self.inner.lock();
        match inner.state {
            NodeState::Done => {
                if let Some(parent) = parent {
                    inner.rdeps.insert(parent.clone());
                }
                DependencyState::Done
            }
            NodeState::Building => {
                if let (Some(parent), Some(building)) = (parent, inner.building.as_mut()) {
                    building.waiting_parents.push(parent.clone());
                }
                DependencyState::AlreadyEvaluating
            }
            prior => {
                let mut building = Building::new(prior);
                if let Some(parent) = parent {
                    building.waiting_parents.push(parent.clone());
                }
                // A node that has no value to fall back on cannot be verified clean.
                if inner.result.is_none() {
                    building.phase = Phase::Rebuilding;
                }
                inner.building = Some(building);
                inner.state = NodeState::Building;
                DependencyState::NeedsScheduling
            }
        }
    }

    /// Record that one registered dependency finished. Returns true when the last
    /// outstanding dependency signals, i.e. the node just became ready.
    pub(crate) fn signal_dep(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.building.as_mut() {
            Some(building) => {
                building.signaled += 1;
                building.signaled == building.registered.len()
            }
            None => false,
        }
    }

    /// Add dependencies this node now waits for. Returns those not registered before.
    pub(crate) fn register_deps(&self, keys: impl IntoIterator<Item = NodeKey>) -> Vec<NodeKey> {
        let mut inner = self.inner.lock();
        let Some(building) = inner.building.as_mut() else {
            return Vec::new();
        };
        let mut added = Vec::new();
        for key in keys {
            if building.registered_set.insert(key.clone()) {
                building.registered.push(key.clone());
                added.push(key);
            }
        }
        added
    }

    /// Dependencies registered during the current build.
    pub(crate) fn registered_deps(&self) -> Vec<NodeKey> {
        self.inner
            .lock()
            .building
            .as_ref()
            .map(|b| b.registered.clone())
            .unwrap_or_default()
    }

    /// Dependencies whose errors this node handles itself.
    pub(crate) fn mark_caught(&self, keys: impl IntoIterator<Item = NodeKey>) {
        if let Some(building) = self.inner.lock().building.as_mut() {
            building.caught.extend(keys);
        }
    }

    /// Count a restart of the function in this build.
    pub(crate) fn note_restart(&self) {
        if let Some(building) = self.inner.lock().building.as_mut() {
            building.restarts += 1;
        }
    }

    pub(crate) fn has_restarted(&self) -> bool {
        self.inner
            .lock()
            .building
            .as_ref()
            .is_some_and(|b| b.restarts > 0)
    }

    pub(crate) fn catches(&self, key: &NodeKey) -> bool {
        self.inner
            .lock()
            .building
            .as_ref()
            .is_some_and(|b| b.caught.contains(key))
    }

    /// Parents waiting in this build plus established reverse dependencies.
    pub(crate) fn parents(&self) -> Vec<NodeKey> {
        let inner = self.inner.lock();
        let mut parents: Vec<NodeKey> = inner.rdeps.iter().cloned().collect();
        if let Some(building) = &inner.building {
            parents.extend(building.waiting_parents.iter().cloned());
        }
        parents
    }

    pub(crate) fn check_state(&self) -> CheckState {
        let inner = self.inner.lock();
        match inner.building.as_ref().map(|b| b.phase) {
            Some(Phase::CheckDependencies { next_group }) => CheckState::Checking {
                next_group,
                last_evaluated: inner.last_evaluated,
                old_deps: inner.deps.clone(),
            },
            _ => CheckState::Rebuild,
        }
    }

    /// Move on to the next old dependency group, returning it.
    pub(crate) fn advance_check_group(&self) -> Vec<NodeKey> {
        let mut inner = self.inner.lock();
        let Inner { deps, building, .. } = &mut *inner;
        match building.as_mut() {
            Some(Building {
                phase: Phase::CheckDependencies { next_group },
                ..
            }) => {
                let group = deps.group(*next_group).to_vec();
                *next_group += 1;
                group
            }
            _ => Vec::new(),
        }
    }

    pub(crate) fn set_rebuilding(&self) {
        if let Some(building) = self.inner.lock().building.as_mut() {
            building.phase = Phase::Rebuilding;
        }
    }

    /// Every old dependency was verified unchanged: keep the old value and finish.
    /// Returns the parents to signal.
    pub(crate) fn mark_clean(&self, version: Version) -> Vec<NodeKey> {
        let mut inner = self.inner.lock();
        let Some(building) = inner.building.take() else {
            return Vec::new();
        };
        inner.state = NodeState::Done;
        inner.last_evaluated = version;
        inner.rdeps.extend(building.waiting_parents.iter().cloned());
        building.waiting_parents
    }

    /// Store the result of an evaluation.
    ///
    /// If the previous value equals the new one, the old value object and its
    /// `last_changed` version are kept, so dependents see no change.
    pub(crate) fn set_value(
        &self,
        result: NodeResult,
        version: Version,
        deps: GroupedDeps,
    ) -> SetValueOutcome {
        let mut inner = self.inner.lock();
        let building = inner.building.take();
        let previous = inner.result.take();
        let (stored, kept_old_value) = match (previous, result) {
            (Some(Ok(old)), Ok(new)) if values_equal(&old, &new) => (Ok(old), true),
            (_, result) => (result, false),
        };
        inner.result = Some(stored);
        if !kept_old_value {
            inner.last_changed = version;
        }
        inner.last_evaluated = version;
        inner.state = NodeState::Done;

        let new_deps: AHashSet<&NodeKey> = deps.iter().collect();
        let mut stale: AHashSet<NodeKey> = inner
            .deps
            .iter()
            .filter(|k| !new_deps.contains(k))
            .cloned()
            .collect();
        let mut waiting_parents = Vec::new();
        if let Some(building) = building {
            stale.extend(
                building
                    .registered
                    .into_iter()
                    .filter(|k| !new_deps.contains(k)),
            );
            waiting_parents = building.waiting_parents;
        }
        drop(new_deps);
        inner.deps = deps;
        inner.rdeps.extend(waiting_parents.iter().cloned());
        SetValueOutcome {
            kept_old_value,
            waiting_parents,
            stale_deps: stale.into_iter().collect(),
        }
    }

    /// Install a value from outside the evaluation. Returns whether the value changed and
    /// the dependencies the node no longer has.
    pub(crate) fn inject(&self, value: Value, version: Version) -> (bool, Vec<NodeKey>) {
        let mut inner = self.inner.lock();
        let changed = !matches!(&inner.result, Some(Ok(old)) if values_equal(old, &value));
        if changed {
            inner.result = Some(Ok(value));
            inner.last_changed = version;
        }
        inner.last_evaluated = version;
        inner.state = NodeState::Done;
        inner.building = None;
        let old_deps = std::mem::take(&mut inner.deps);
        (changed, old_deps.iter().cloned().collect())
    }

    /// Mark the entry invalid. Returns the reverse dependencies to propagate to if this
    /// call changed the state in a way dependents must hear about.
    ///
    /// The stored value and edges are kept, so the next build can compare against them.
    pub(crate) fn mark_dirty(&self, kind: DirtyKind) -> Option<Vec<NodeKey>> {
        let mut inner = self.inner.lock();
        let rdeps = |inner: &Inner| inner.rdeps.iter().cloned().collect::<Vec<_>>();
        match (inner.state, kind) {
            (NodeState::Deleted, _) | (NodeState::Building, _) => None,
            (_, DirtyKind::Deletion) => {
                inner.state = NodeState::Deleted;
                Some(rdeps(&inner))
            }
            (NodeState::Done, DirtyKind::Dirty) => {
                inner.state = NodeState::Dirty;
                Some(rdeps(&inner))
            }
            (NodeState::Done, DirtyKind::Changed) | (NodeState::Evicted, _) => {
                inner.state = NodeState::Changed;
                Some(rdeps(&inner))
            }
            (NodeState::Dirty, DirtyKind::Changed) => {
                inner.state = NodeState::Changed;
                None
            }
            (NodeState::Dirty | NodeState::Changed | NodeState::NeverBuilt, _) => None,
        }
    }

    /// Drop the value of a done entry, keeping edges and versions.
    pub(crate) fn evict(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != NodeState::Done {
            return false;
        }
        inner.result = None;
        inner.state = NodeState::Evicted;
        true
    }

    /// Undo an unfinished evaluation, restoring the state from before the build.
    /// Returns dependencies registered only by the abandoned attempt.
    pub(crate) fn abandon(&self) -> Vec<NodeKey> {
        let mut inner = self.inner.lock();
        if inner.state != NodeState::Building {
            return Vec::new();
        }
        let Some(building) = inner.building.take() else {
            return Vec::new();
        };
        inner.state = match building.prior {
            NodeState::Deleted | NodeState::Building => NodeState::NeverBuilt,
            prior => prior,
        };
        let old: AHashSet<&NodeKey> = inner.deps.iter().collect();
        building
            .registered
            .into_iter()
            .filter(|k| !old.contains(k))
            .collect()
    }

    /// Drop every edge, returning the former dependencies and reverse dependencies.
    pub(crate) fn take_edges(&self) -> (Vec<NodeKey>, Vec<NodeKey>) {
        let mut inner = self.inner.lock();
        let deps = std::mem::take(&mut inner.deps).iter().cloned().collect();
        let rdeps = inner.rdeps.drain().collect();
        (deps, rdeps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::FunctionKind;
    use crate::value::value;

    const K: FunctionKind = FunctionKind::new("K");

    fn key(name: &'static str) -> NodeKey {
        NodeKey::new(K, name)
    }

    fn built(name: &'static str, v: u32, version: Version) -> NodeEntry {
        let entry = NodeEntry::new(key(name));
        assert_eq!(
            entry.add_reverse_dep_and_check_if_done(None),
            DependencyState::NeedsScheduling
        );
        entry.set_value(Ok(value(v)), version, GroupedDeps::new());
        entry
    }

    #[test]
    fn test_first_request_schedules_once() {
        let entry = NodeEntry::new(key("a"));
        let parent = key("p");
        assert_eq!(
            entry.add_reverse_dep_and_check_if_done(Some(&parent)),
            DependencyState::NeedsScheduling
        );
        assert_eq!(
            entry.add_reverse_dep_and_check_if_done(Some(&key("q"))),
            DependencyState::AlreadyEvaluating
        );
        let outcome = entry.set_value(Ok(value(1u32)), Version(1), GroupedDeps::new());
        assert_eq!(outcome.waiting_parents, vec![parent, key("q")]);
        assert_eq!(entry.state(), NodeState::Done);
        assert_eq!(entry.reverse_deps().len(), 2);
    }

    #[test]
    fn test_signal_counts_registered() {
        let entry = NodeEntry::new(key("a"));
        entry.add_reverse_dep_and_check_if_done(None);
        let added = entry.register_deps(vec![key("x"), key("y"), key("x")]);
        assert_eq!(added, vec![key("x"), key("y")]);
        assert!(!entry.signal_dep());
        assert!(entry.signal_dep());
    }

    #[test]
    fn test_equal_value_keeps_old_object() {
        let entry = built("a", 7, Version(1));
        let old = entry.value().unwrap();
        entry.mark_dirty(DirtyKind::Changed);
        entry.add_reverse_dep_and_check_if_done(None);
        let outcome = entry.set_value(Ok(value(7u32)), Version(2), GroupedDeps::new());
        assert!(outcome.kept_old_value);
        assert!(std::sync::Arc::ptr_eq(&old, &entry.value().unwrap()));
        assert_eq!(entry.last_changed(), Version(1));
        assert_eq!(entry.last_evaluated(), Version(2));
    }

    #[test]
    fn test_changed_value_bumps_version() {
        let entry = built("a", 7, Version(1));
        entry.mark_dirty(DirtyKind::Changed);
        entry.add_reverse_dep_and_check_if_done(None);
        let outcome = entry.set_value(Ok(value(8u32)), Version(2), GroupedDeps::new());
        assert!(!outcome.kept_old_value);
        assert_eq!(entry.last_changed(), Version(2));
    }

    #[test]
    fn test_dirty_keeps_value_until_revalidated() {
        let entry = built("a", 1, Version(1));
        entry.add_rdep(&key("parent"));
        assert_eq!(entry.mark_dirty(DirtyKind::Dirty), Some(vec![key("parent")]));
        assert_eq!(entry.state(), NodeState::Dirty);
        assert!(entry.result().is_none());
        assert!(entry.last_result().is_some());
        // Re-marking does not propagate again.
        assert_eq!(entry.mark_dirty(DirtyKind::Dirty), None);
        assert_eq!(entry.mark_dirty(DirtyKind::Changed), None);
        assert_eq!(entry.state(), NodeState::Changed);
    }

    #[test]
    fn test_stale_deps_reported() {
        let entry = NodeEntry::new(key("a"));
        entry.add_reverse_dep_and_check_if_done(None);
        let deps: GroupedDeps = vec![vec![key("x")], vec![key("y")]].into_iter().collect();
        entry.set_value(Ok(value(1u32)), Version(1), deps);
        entry.mark_dirty(DirtyKind::Changed);
        entry.add_reverse_dep_and_check_if_done(None);
        entry.register_deps(vec![key("z")]);
        let deps: GroupedDeps = vec![vec![key("x")]].into_iter().collect();
        let mut stale = entry.set_value(Ok(value(2u32)), Version(2), deps).stale_deps;
        stale.sort();
        assert_eq!(stale, vec![key("y"), key("z")]);
    }

    #[test]
    fn test_abandon_restores_prior_state() {
        let entry = built("a", 1, Version(1));
        entry.mark_dirty(DirtyKind::Dirty);
        entry.add_reverse_dep_and_check_if_done(None);
        entry.register_deps(vec![key("new")]);
        assert_eq!(entry.abandon(), vec![key("new")]);
        assert_eq!(entry.state(), NodeState::Dirty);
        assert!(entry.last_result().is_some());
    }

    #[test]
    fn test_evicted_node_must_rebuild() {
        let entry = built("a", 1, Version(1));
        assert!(entry.evict());
        assert_eq!(entry.state(), NodeState::Evicted);
        assert!(entry.last_result().is_none());
        entry.add_reverse_dep_and_check_if_done(None);
        assert!(matches!(entry.check_state(), CheckState::Rebuild));
        let outcome = entry.set_value(Ok(value(1u32)), Version(2), GroupedDeps::new());
        assert!(!outcome.kept_old_value);
    }

    #[test]
    fn test_inject_detects_equal_value() {
        let entry = NodeEntry::new(key("a"));
        assert!(entry.inject(value(1u32), Version(1)).0);
        assert!(!entry.inject(value(1u32), Version(2)).0);
        assert_eq!(entry.last_changed(), Version(1));
        assert!(entry.inject(value(2u32), Version(3)).0);
        assert_eq!(entry.last_changed(), Version(3));
    }
}
