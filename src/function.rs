//! Node functions and the environment they compute in.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};

use crate::config::Interrupt;
use crate::error::{ComputeError, Failure, NodeError, Unavailable};
use crate::events::Event;
use crate::graph::{GroupedDeps, InMemoryGraph};
use crate::key::{FunctionKind, NodeKey};
use crate::value::{downcast_value, NodeValue, Value};

/// A pluggable, restartable computation for one [`FunctionKind`].
///
/// `compute` must be deterministic for a fixed set of dependency values and free of
/// side effects on build state: it is re-invoked from scratch whenever it asked for a
/// dependency that was not done yet.
///
/// # Example
///
/// ```ignore
/// use memograph::{ComputeError, Environment, NodeFunction, NodeKey, Value, value};
///
/// struct Sum;
///
/// impl NodeFunction for Sum {
///     fn compute(&self, key: &NodeKey, env: &mut Environment<'_>) -> Result<Value, ComputeError> {
///         let inputs = key.argument::<Vec<NodeKey>>().cloned().unwrap_or_default();
///         let values = env.get_all::<i64>(&inputs)?;
///         Ok(value(values.iter().map(|v| **v).sum::<i64>()))
///     }
/// }
/// ```
pub trait NodeFunction: Send + Sync + 'static {
    /// Compute the value of `key`.
    fn compute(&self, key: &NodeKey, env: &mut Environment<'_>) -> Result<Value, ComputeError>;

    /// Origin label attached to events this function emits for `key`.
    fn extract_tag(&self, _key: &NodeKey) -> Option<String> {
        None
    }

    /// Whether evaluation must hold a resource slot while computing.
    fn is_resource_heavy(&self) -> bool {
        false
    }
}

impl<F> NodeFunction for F
where
    F: Fn(&NodeKey, &mut Environment<'_>) -> Result<Value, ComputeError> + Send + Sync + 'static,
{
    fn compute(&self, key: &NodeKey, env: &mut Environment<'_>) -> Result<Value, ComputeError> {
        self(key, env)
    }
}

/// Static map from function kind to function, supplied at engine construction.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: AHashMap<FunctionKind, Arc<dyn NodeFunction>>,
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `kind` to `function`, replacing any previous binding.
    pub fn register(&mut self, kind: FunctionKind, function: impl NodeFunction) -> &mut Self {
        self.functions.insert(kind, Arc::new(function));
        self
    }

    /// Bind `kind` to a shared function.
    pub fn register_shared(&mut self, kind: FunctionKind, function: Arc<dyn NodeFunction>) -> &mut Self {
        self.functions.insert(kind, function);
        self
    }

    /// The function for `kind`.
    pub fn get(&self, kind: FunctionKind) -> Option<&Arc<dyn NodeFunction>> {
        self.functions.get(&kind)
    }

    /// Returns true if `kind` is bound.
    pub fn contains(&self, kind: FunctionKind) -> bool {
        self.functions.contains_key(&kind)
    }

    /// All bound kinds.
    pub fn kinds(&self) -> impl Iterator<Item = FunctionKind> + '_ {
        self.functions.keys().copied()
    }
}

/// A dependency value had a different type than the reader expected.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{key} holds a value of type {actual}, expected {expected}")]
pub struct ValueTypeMismatch {
    /// The dependency that was read.
    pub key: NodeKey,
    /// Type the reader asked for.
    pub expected: &'static str,
    /// Type actually stored.
    pub actual: &'static str,
}

enum Lookup {
    Value(Value),
    Error(NodeError),
    Missing,
}

/// What an invocation observed, handed back to the evaluator.
pub(crate) struct Invocation {
    pub deps: GroupedDeps,
    pub missing: Vec<NodeKey>,
    pub errored: Vec<(NodeKey, NodeError)>,
    pub caught: Vec<NodeKey>,
    pub events: Vec<Event>,
}

/// The conduit through which a node function reads its dependencies and emits events.
///
/// Every read is recorded as a dependency. A read of a dependency that is not done in
/// this build returns the unavailable marker (`None`); the function should then return
/// [`ComputeError::Unavailable`] and will be restarted once the dependency is done.
pub struct Environment<'a> {
    key: &'a NodeKey,
    graph: &'a InMemoryGraph,
    interrupt: Option<&'a Interrupt>,
    groups: GroupedDeps,
    seen: AHashSet<NodeKey>,
    missing: Vec<NodeKey>,
    errored: Vec<(NodeKey, NodeError)>,
    caught: Vec<NodeKey>,
    events: Vec<Event>,
}

impl<'a> Environment<'a> {
    pub(crate) fn new(key: &'a NodeKey, graph: &'a InMemoryGraph, interrupt: Option<&'a Interrupt>) -> Self {
        Self {
            key,
            graph,
            interrupt,
            groups: GroupedDeps::new(),
            seen: AHashSet::new(),
            missing: Vec::new(),
            errored: Vec::new(),
            caught: Vec::new(),
            events: Vec::new(),
        }
    }

    /// The key being computed.
    pub fn key(&self) -> &NodeKey {
        self.key
    }

    fn lookup(&mut self, key: &NodeKey) -> Lookup {
        match self.graph.get(key).and_then(|entry| entry.result()) {
            Some(Ok(value)) => Lookup::Value(value),
            Some(Err(error)) => Lookup::Error(error),
            None => Lookup::Missing,
        }
    }

    fn record_group(&mut self, keys: &[NodeKey]) {
        let group: Vec<NodeKey> = keys
            .iter()
            .filter(|k| self.seen.insert((*k).clone()))
            .cloned()
            .collect();
        self.groups.push_group(group);
    }

    fn read(&mut self, key: &NodeKey) -> Option<Value> {
        match self.lookup(key) {
            Lookup::Value(value) => Some(value),
            Lookup::Error(error) => {
                self.errored.push((key.clone(), error));
                None
            }
            Lookup::Missing => {
                self.missing.push(key.clone());
                None
            }
        }
    }

    /// Read a dependency. `None` means unavailable: not done yet, or failed.
    pub fn get_value(&mut self, key: &NodeKey) -> Option<Value> {
        self.record_group(std::slice::from_ref(key));
        self.read(key)
    }

    /// Read several dependencies as one group. Every key is requested even if an earlier
    /// one is unavailable, so all of them are scheduled together.
    pub fn get_values(&mut self, keys: &[NodeKey]) -> Vec<Option<Value>> {
        self.record_group(keys);
        keys.iter().map(|key| self.read(key)).collect()
    }

    /// Read a dependency and handle its failure instead of being short-circuited.
    ///
    /// Returns `None` only if the dependency is not done yet.
    pub fn get_value_or_error(&mut self, key: &NodeKey) -> Option<Result<Value, NodeError>> {
        self.record_group(std::slice::from_ref(key));
        self.caught.push(key.clone());
        match self.lookup(key) {
            Lookup::Value(value) => Some(Ok(value)),
            Lookup::Error(error) => Some(Err(error)),
            Lookup::Missing => {
                self.missing.push(key.clone());
                None
            }
        }
    }

    /// Typed read that restarts the function through `?` when unavailable.
    pub fn get<V: NodeValue>(&mut self, key: &NodeKey) -> Result<Arc<V>, ComputeError> {
        let value = self.get_value(key).ok_or(Unavailable)?;
        downcast(key, &value)
    }

    /// Typed read of a group. Requests every key, then restarts through `?` if any is
    /// unavailable.
    pub fn get_all<V: NodeValue>(&mut self, keys: &[NodeKey]) -> Result<Vec<Arc<V>>, ComputeError> {
        let values = self.get_values(keys);
        if self.values_missing() {
            return Err(ComputeError::Unavailable);
        }
        keys.iter()
            .zip(values)
            .map(|(key, value)| match value {
                Some(value) => downcast(key, &value),
                None => Err(ComputeError::Unavailable),
            })
            .collect()
    }

    /// Returns true if any read so far returned the unavailable marker.
    pub fn values_missing(&self) -> bool {
        !self.missing.is_empty() || !self.errored.is_empty()
    }

    /// Buffer an event. It is delivered once, when the node commits.
    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Buffer an info event.
    pub fn info(&mut self, message: impl Into<String>) {
        self.emit(Event::info(message));
    }

    /// Buffer a warning event.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.emit(Event::warning(message));
    }

    /// Buffer an error event.
    pub fn error(&mut self, message: impl Into<String>) {
        self.emit(Event::error(message));
    }

    /// Returns true if the build was asked to stop. Long computations should check this
    /// and bail out.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_some_and(Interrupt::is_interrupted)
    }

    pub(crate) fn finish(self) -> Invocation {
        Invocation {
            deps: self.groups,
            missing: self.missing,
            errored: self.errored,
            caught: self.caught,
            events: self.events,
        }
    }
}

fn downcast<V: NodeValue>(key: &NodeKey, value: &Value) -> Result<Arc<V>, ComputeError> {
    downcast_value::<V>(value).ok_or_else(|| {
        ComputeError::Failed(Failure::persistent(ValueTypeMismatch {
            key: key.clone(),
            expected: std::any::type_name::<V>(),
            actual: value.type_name(),
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::value;
    use crate::version::Version;

    const K: FunctionKind = FunctionKind::new("K");

    fn key(name: &'static str) -> NodeKey {
        NodeKey::new(K, name)
    }

    #[test]
    fn test_reads_record_groups_and_missing() {
        let graph = InMemoryGraph::new();
        graph.create_if_absent(&key("done")).inject(value(3u32), Version(1));
        let me = key("me");
        let mut env = Environment::new(&me, &graph, None);

        assert_eq!(env.get::<u32>(&key("done")).map(|v| *v).ok(), Some(3));
        assert!(env.get_value(&key("later")).is_none());
        let values = env.get_values(&[key("done"), key("x"), key("y")]);
        assert!(values[0].is_some() && values[1].is_none() && values[2].is_none());
        assert!(env.values_missing());

        let invocation = env.finish();
        assert_eq!(invocation.deps.group_count(), 3);
        assert_eq!(invocation.deps.group(2), &[key("x"), key("y")]);
        assert_eq!(invocation.missing, vec![key("later"), key("x"), key("y")]);
    }

    #[test]
    fn test_type_mismatch_is_failure() {
        let graph = InMemoryGraph::new();
        graph.create_if_absent(&key("s")).inject(value(String::from("x")), Version(1));
        let me = key("me");
        let mut env = Environment::new(&me, &graph, None);
        match env.get::<u32>(&key("s")) {
            Err(ComputeError::Failed(failure)) => assert!(failure.is::<ValueTypeMismatch>()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_events_buffered() {
        let graph = InMemoryGraph::new();
        let me = key("me");
        let mut env = Environment::new(&me, &graph, None);
        env.warn("w");
        env.info("i");
        assert_eq!(env.finish().events.len(), 2);
    }

    #[test]
    fn test_registry_closure_function() {
        let mut registry = FunctionRegistry::new();
        registry.register(K, |_: &NodeKey, _: &mut Environment<'_>| Ok(value(1u8)));
        assert!(registry.contains(K));
        assert_eq!(registry.kinds().count(), 1);
    }
}
