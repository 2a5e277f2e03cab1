//! Applying change notifications to the graph between builds.
//!
//! Invalidation only marks nodes. Nothing is recomputed until the next build requests
//! the affected keys.

use std::collections::VecDeque;

use tracing::trace;

use crate::graph::{DirtyKind, InMemoryGraph, NodeState};
use crate::key::NodeKey;
use crate::tracer::{InvalidationReason, Tracer};
use crate::value::Value;
use crate::version::Version;

/// Marks changed nodes and their transitive reverse dependencies.
pub(crate) struct Invalidator<'a> {
    graph: &'a InMemoryGraph,
    tracer: &'a dyn Tracer,
}

impl<'a> Invalidator<'a> {
    pub(crate) fn new(graph: &'a InMemoryGraph, tracer: &'a dyn Tracer) -> Self {
        Self { graph, tracer }
    }

    /// Mark `keys` changed and everything above them dirty. Keys not in the graph are
    /// ignored. Returns the number of nodes whose state changed.
    pub(crate) fn invalidate(&self, keys: impl IntoIterator<Item = NodeKey>) -> usize {
        let mut queue = VecDeque::new();
        let mut touched = 0;
        for key in keys {
            let Some(entry) = self.graph.get(&key) else {
                continue;
            };
            let before = entry.state();
            if let Some(rdeps) = entry.mark_dirty(DirtyKind::Changed) {
                queue.extend(rdeps);
            }
            if entry.state() != before {
                touched += 1;
                self.tracer.on_node_invalidated(&key, InvalidationReason::Changed);
            }
        }
        touched + self.dirty_parents(queue)
    }

    /// Install externally supplied values. Dependents of values that differ from the
    /// stored ones are dirtied. Returns the number of values that changed.
    pub(crate) fn inject(&self, values: impl IntoIterator<Item = (NodeKey, Value)>, version: Version) -> usize {
        let mut queue = VecDeque::new();
        let mut changed_count = 0;
        for (key, value) in values {
            let entry = self.graph.create_if_absent(&key);
            let (changed, old_deps) = entry.inject(value, version);
            for dep in old_deps {
                if let Some(dep_entry) = self.graph.get(&dep) {
                    dep_entry.remove_rdep(&key);
                }
            }
            if changed {
                changed_count += 1;
                self.tracer.on_node_invalidated(&key, InvalidationReason::Injected);
                queue.extend(entry.reverse_deps());
            }
        }
        self.dirty_parents(queue);
        changed_count
    }

    fn dirty_parents(&self, mut queue: VecDeque<NodeKey>) -> usize {
        let mut dirtied = 0;
        while let Some(key) = queue.pop_front() {
            let Some(entry) = self.graph.get(&key) else {
                continue;
            };
            if let Some(rdeps) = entry.mark_dirty(DirtyKind::Dirty) {
                dirtied += 1;
                trace!(%key, "dirtied");
                self.tracer.on_node_invalidated(&key, InvalidationReason::DependencyDirtied);
                queue.extend(rdeps);
            }
        }
        dirtied
    }

    /// Mark `keys` and their transitive reverse dependencies deleted, then remove them
    /// from the graph. Returns the number of removed nodes.
    pub(crate) fn delete(&self, keys: impl IntoIterator<Item = NodeKey>) -> usize {
        let mut queue: VecDeque<NodeKey> = keys.into_iter().collect();
        while let Some(key) = queue.pop_front() {
            let Some(entry) = self.graph.get(&key) else {
                continue;
            };
            if let Some(rdeps) = entry.mark_dirty(DirtyKind::Deletion) {
                self.tracer.on_node_invalidated(&key, InvalidationReason::Deleted);
                queue.extend(rdeps);
            }
        }
        self.remove_deleted()
    }

    /// Remove every entry in the deleted state.
    fn remove_deleted(&self) -> usize {
        let deleted: Vec<NodeKey> = self
            .graph
            .entries()
            .into_iter()
            .filter(|entry| entry.state() == NodeState::Deleted)
            .map(|entry| entry.key().clone())
            .collect();
        for key in &deleted {
            self.graph.remove(key);
        }
        deleted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GroupedDeps;
    use crate::key::FunctionKind;
    use crate::tracer::NoopTracer;
    use crate::value::value;

    const K: FunctionKind = FunctionKind::new("K");

    fn key(name: &'static str) -> NodeKey {
        NodeKey::new(K, name)
    }

    /// leaf <- mid <- top, all done at version 1.
    fn chain() -> InMemoryGraph {
        let graph = InMemoryGraph::new();
        graph.create_if_absent(&key("leaf")).inject(value(1u32), Version(1));
        for (name, dep) in [("mid", "leaf"), ("top", "mid")] {
            let entry = graph.create_if_absent(&key(name));
            entry.add_reverse_dep_and_check_if_done(None);
            let deps: GroupedDeps = vec![vec![key(dep)]].into_iter().collect();
            entry.set_value(Ok(value(1u32)), Version(1), deps);
            graph.get(&key(dep)).unwrap().add_rdep(&key(name));
        }
        graph
    }

    #[test]
    fn test_invalidate_dirties_transitively() {
        let graph = chain();
        let touched = Invalidator::new(&graph, &NoopTracer).invalidate(vec![key("leaf"), key("absent")]);
        assert_eq!(touched, 3);
        assert_eq!(graph.get_dirty_state(&key("leaf")), Some(NodeState::Changed));
        assert_eq!(graph.get_dirty_state(&key("mid")), Some(NodeState::Dirty));
        assert_eq!(graph.get_dirty_state(&key("top")), Some(NodeState::Dirty));
    }

    #[test]
    fn test_inject_equal_value_dirties_nothing() {
        let graph = chain();
        let invalidator = Invalidator::new(&graph, &NoopTracer);
        assert_eq!(invalidator.inject(vec![(key("leaf"), value(1u32))], Version(2)), 0);
        assert_eq!(graph.get_dirty_state(&key("mid")), Some(NodeState::Done));
        assert_eq!(invalidator.inject(vec![(key("leaf"), value(2u32))], Version(2)), 1);
        assert_eq!(graph.get_dirty_state(&key("leaf")), Some(NodeState::Done));
        assert_eq!(graph.get_dirty_state(&key("top")), Some(NodeState::Dirty));
    }

    #[test]
    fn test_delete_removes_reverse_closure() {
        let graph = chain();
        let removed = Invalidator::new(&graph, &NoopTracer).delete(vec![key("mid")]);
        assert_eq!(removed, 2);
        assert!(graph.get(&key("mid")).is_none());
        assert!(graph.get(&key("top")).is_none());
        assert!(graph.get(&key("leaf")).unwrap().reverse_deps().is_empty());
    }
}
