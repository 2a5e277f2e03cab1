//! In-memory storage of nodes and edges.

mod entry;

pub use entry::{DependencyState, DirtyKind, GroupedDeps, NodeEntry, NodeResult, NodeState};
pub(crate) use entry::CheckState;

use std::sync::Arc;

use papaya::HashMap;

use crate::error::NodeError;
use crate::key::NodeKey;
use crate::value::Value;

/// Read-only view of a graph for tooling: queries, visualizers, diff scanners.
pub trait WalkableGraph: Send + Sync {
    /// The value of a done node.
    fn get_value(&self, key: &NodeKey) -> Option<Value>;

    /// The error of a done node.
    fn get_error(&self, key: &NodeKey) -> Option<NodeError>;

    /// Returns true if the graph holds an entry for `key`.
    fn exists(&self, key: &NodeKey) -> bool;

    /// Dependencies of the last completed evaluation of `key`.
    fn direct_deps(&self, key: &NodeKey) -> Vec<NodeKey>;

    /// Nodes depending on `key`.
    fn reverse_deps(&self, key: &NodeKey) -> Vec<NodeKey>;
}

/// The graph: a concurrent map from key to entry.
///
/// The map itself is lock-free; each entry carries its own lock.
pub struct InMemoryGraph {
    nodes: HashMap<NodeKey, Arc<NodeEntry>, ahash::RandomState>,
}

impl Default for InMemoryGraph {
    fn default() -> Self {
        Self {
            nodes: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<InMemoryGraph>();
    assert_sync::<InMemoryGraph>();
}

impl InMemoryGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the entry for `key`.
    pub fn get(&self, key: &NodeKey) -> Option<Arc<NodeEntry>> {
        self.nodes.pin().get(key).cloned()
    }

    /// Get the entry for `key`, creating a never-built entry if there is none.
    pub fn create_if_absent(&self, key: &NodeKey) -> Arc<NodeEntry> {
        self.nodes
            .pin()
            .get_or_insert_with(key.clone(), || Arc::new(NodeEntry::new(key.clone())))
            .clone()
    }

    /// Lifecycle state of `key`, if present.
    pub fn get_dirty_state(&self, key: &NodeKey) -> Option<NodeState> {
        self.get(key).map(|entry| entry.state())
    }

    /// Mark `key` dirty, or deleted. Returns the reverse dependencies to propagate to.
    pub fn mark_dirty(&self, key: &NodeKey, is_deletion: bool) -> Option<Vec<NodeKey>> {
        let kind = if is_deletion {
            DirtyKind::Deletion
        } else {
            DirtyKind::Dirty
        };
        self.get(key)?.mark_dirty(kind)
    }

    /// All keys.
    pub fn keys(&self) -> Vec<NodeKey> {
        self.nodes.pin().keys().cloned().collect()
    }

    /// All entries.
    pub fn entries(&self) -> Vec<Arc<NodeEntry>> {
        self.nodes.pin().values().cloned().collect()
    }

    /// Every done node with a value.
    pub fn done_values(&self) -> Vec<(NodeKey, Value)> {
        self.nodes
            .pin()
            .iter()
            .filter_map(|(key, entry)| entry.value().map(|v| (key.clone(), v)))
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.nodes.pin().len()
    }

    /// Returns true if the graph holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove `key` and unlink it from its dependencies.
    ///
    /// Dependents keep their edge to the missing key, which counts as changed when they
    /// are next checked; callers remove or dirty them as needed.
    pub fn remove(&self, key: &NodeKey) -> Option<Arc<NodeEntry>> {
        let removed = self.nodes.pin().remove(key).cloned()?;
        let (deps, _rdeps) = removed.take_edges();
        for dep in deps {
            if let Some(entry) = self.get(&dep) {
                entry.remove_rdep(key);
            }
        }
        Some(removed)
    }
}

impl WalkableGraph for InMemoryGraph {
    fn get_value(&self, key: &NodeKey) -> Option<Value> {
        self.get(key)?.value()
    }

    fn get_error(&self, key: &NodeKey) -> Option<NodeError> {
        self.get(key)?.result()?.err()
    }

    fn exists(&self, key: &NodeKey) -> bool {
        self.nodes.pin().contains_key(key)
    }

    fn direct_deps(&self, key: &NodeKey) -> Vec<NodeKey> {
        self.get(key)
            .map(|entry| entry.direct_deps().iter().cloned().collect())
            .unwrap_or_default()
    }

    fn reverse_deps(&self, key: &NodeKey) -> Vec<NodeKey> {
        self.get(key)
            .map(|entry| entry.reverse_deps())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::FunctionKind;
    use crate::value::value;
    use crate::version::Version;

    const K: FunctionKind = FunctionKind::new("K");

    fn key(name: &'static str) -> NodeKey {
        NodeKey::new(K, name)
    }

    #[test]
    fn test_create_if_absent_is_idempotent() {
        let graph = InMemoryGraph::new();
        let a = graph.create_if_absent(&key("a"));
        let b = graph.create_if_absent(&key("a"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.get_dirty_state(&key("a")), Some(NodeState::NeverBuilt));
        assert_eq!(graph.get_dirty_state(&key("b")), None);
    }

    #[test]
    fn test_mark_dirty_and_delete() {
        let graph = InMemoryGraph::new();
        let a = graph.create_if_absent(&key("a"));
        a.inject(value(1u32), Version(1));
        a.add_rdep(&key("p"));
        assert_eq!(graph.mark_dirty(&key("a"), false), Some(vec![key("p")]));
        assert_eq!(graph.get_dirty_state(&key("a")), Some(NodeState::Dirty));
        assert_eq!(graph.mark_dirty(&key("a"), true), Some(vec![key("p")]));
        assert_eq!(graph.get_dirty_state(&key("a")), Some(NodeState::Deleted));
    }

    #[test]
    fn test_remove_unlinks_edges() {
        let graph = InMemoryGraph::new();
        let parent = graph.create_if_absent(&key("parent"));
        let child = graph.create_if_absent(&key("child"));
        child.inject(value(1u32), Version(1));
        parent.add_reverse_dep_and_check_if_done(None);
        parent.set_value(
            Ok(value(2u32)),
            Version(1),
            vec![vec![key("child")]].into_iter().collect(),
        );
        child.add_rdep(&key("parent"));

        graph.remove(&key("parent"));
        assert!(child.reverse_deps().is_empty());
        assert!(!graph.exists(&key("parent")));
        assert_eq!(graph.done_values().len(), 1);
    }
}
