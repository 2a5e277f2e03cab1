use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{CycleInfo, NodeError};
use crate::graph::{InMemoryGraph, WalkableGraph};
use crate::key::NodeKey;
use crate::value::{downcast_value, NodeValue, Value};

/// Outcome of one build: the values and errors of its roots.
///
/// Roots that were abandoned (the build stopped before reaching them) appear in neither
/// map.
pub struct EvaluationResult {
    values: BTreeMap<NodeKey, Value>,
    errors: BTreeMap<NodeKey, NodeError>,
    error_info: Option<(NodeKey, NodeError)>,
    cycles: Vec<(NodeKey, CycleInfo)>,
    graph: Arc<InMemoryGraph>,
}

impl EvaluationResult {
    pub(crate) fn new(
        values: BTreeMap<NodeKey, Value>,
        errors: BTreeMap<NodeKey, NodeError>,
        error_info: Option<(NodeKey, NodeError)>,
        cycles: Vec<(NodeKey, CycleInfo)>,
        graph: Arc<InMemoryGraph>,
    ) -> Self {
        Self {
            values,
            errors,
            error_info,
            cycles,
            graph,
        }
    }

    /// Value of a root.
    pub fn get(&self, key: &NodeKey) -> Option<&Value> {
        self.values.get(key)
    }

    /// Typed value of a root.
    pub fn get_as<V: NodeValue>(&self, key: &NodeKey) -> Option<Arc<V>> {
        self.values.get(key).and_then(downcast_value::<V>)
    }

    /// Error of a root.
    pub fn get_error(&self, key: &NodeKey) -> Option<&NodeError> {
        self.errors.get(key)
    }

    /// Returns true if any root failed.
    pub fn has_error(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Every root that finished with a value, in key order.
    pub fn values(&self) -> impl Iterator<Item = (&NodeKey, &Value)> + '_ {
        self.values.iter()
    }

    /// Every root that finished with an error, in key order.
    pub fn errors(&self) -> impl Iterator<Item = (&NodeKey, &NodeError)> + '_ {
        self.errors.iter()
    }

    /// The error that stopped a build without keep-going, with the root it was
    /// attributed to. In keep-going mode this is the error of the smallest failing root.
    pub fn error_info(&self) -> Option<(&NodeKey, &NodeError)> {
        self.error_info
            .as_ref()
            .map(|(key, error)| (key, error))
            .or_else(|| self.errors.iter().next())
    }

    /// Cycles found during the build, each with the root it was reached from.
    pub fn cycles(&self) -> &[(NodeKey, CycleInfo)] {
        &self.cycles
    }

    /// The graph after the build, for queries over dependencies.
    pub fn walkable_graph(&self) -> &dyn WalkableGraph {
        self.graph.as_ref()
    }
}

impl std::fmt::Debug for EvaluationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationResult")
            .field("values", &self.values)
            .field("errors", &self.errors)
            .field("cycles", &self.cycles)
            .finish()
    }
}
