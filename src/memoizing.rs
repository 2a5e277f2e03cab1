//! The long-lived engine: a graph plus the changes queued for the next build.

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::{EngineConfig, EvaluationOptions};
use crate::differencer::Diff;
use crate::error::EvalError;
use crate::evaluator::{error_transience_key, EvaluationResult, ParallelEvaluator};
use crate::events::{EventHandler, LoggingEventHandler};
use crate::function::{FunctionRegistry, NodeFunction};
use crate::graph::InMemoryGraph;
use crate::invalidation::Invalidator;
use crate::key::{FunctionKind, NodeKey};
use crate::resource::ResourceManager;
use crate::tracer::{InvalidationReason, NoopTracer, Tracer};
use crate::value::{value, Value};
use crate::version::Version;

#[derive(Default)]
struct Pending {
    invalidated: AHashSet<NodeKey>,
    injected: AHashMap<NodeKey, Value>,
    deleted: AHashSet<NodeKey>,
}

/// Keeps the graph across builds and applies queued invalidations before each one.
///
/// Invalidation, injection and deletion only queue work; nothing is recomputed until the
/// next [`evaluate`](Self::evaluate). Builds are serialized.
///
/// # Example
///
/// ```ignore
/// let evaluator = MemoizingEvaluator::builder()
///     .function(LINE_COUNT, LineCount)
///     .functions(filesystem_functions(fs.clone()))
///     .config(EngineConfig::for_tests())
///     .build();
///
/// let options = evaluator.default_options();
/// let result = evaluator.evaluate(&[line_count_key("src/lib.rs")], &options)?;
/// ```
pub struct MemoizingEvaluator {
    graph: Arc<InMemoryGraph>,
    registry: FunctionRegistry,
    tracer: Arc<dyn Tracer>,
    event_handler: Arc<dyn EventHandler>,
    resources: ResourceManager,
    config: EngineConfig,
    version: Mutex<Version>,
    build_lock: Mutex<()>,
    pending: Mutex<Pending>,
    last_roots: Mutex<Vec<NodeKey>>,
}

impl MemoizingEvaluator {
    /// Create a builder.
    pub fn builder() -> MemoizingEvaluatorBuilder {
        MemoizingEvaluatorBuilder::new()
    }

    /// Options for a build using the configured defaults.
    pub fn default_options(&self) -> EvaluationOptions {
        self.config.evaluation_options()
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The graph, for inspection and for computing diffs.
    pub fn graph(&self) -> &Arc<InMemoryGraph> {
        &self.graph
    }

    /// Version of the most recent build, or [`Version::NEVER`].
    pub fn current_version(&self) -> Version {
        *self.version.lock()
    }

    /// Run one build: apply queued changes, then evaluate `roots`.
    pub fn evaluate(&self, roots: &[NodeKey], options: &EvaluationOptions) -> Result<EvaluationResult, EvalError> {
        let _build = self.build_lock.lock();
        let version = {
            let mut current = self.version.lock();
            *current = current.next();
            *current
        };
        self.apply_pending(version);

        let evaluator = ParallelEvaluator::new(
            self.graph.clone(),
            &self.registry,
            version,
            options,
            self.tracer.as_ref(),
            self.event_handler.as_ref(),
            &self.resources,
        );
        let result = evaluator.eval(roots);
        *self.last_roots.lock() = roots.to_vec();

        if self.config.gc_version_window > 0 {
            let removed = self.collect_stale(version, self.config.gc_version_window);
            if removed > 0 {
                debug!(removed, %version, "collected stale nodes");
            }
        }
        result
    }

    fn apply_pending(&self, version: Version) {
        let pending = std::mem::take(&mut *self.pending.lock());
        let invalidator = Invalidator::new(&self.graph, self.tracer.as_ref());
        let deleted = invalidator.delete(pending.deleted);
        let dirtied = invalidator.invalidate(pending.invalidated);
        let mut injected: Vec<(NodeKey, Value)> = pending.injected.into_iter().collect();
        injected.push((error_transience_key(), value(version)));
        let changed = invalidator.inject(injected, version);
        debug!(%version, deleted, dirtied, injected = changed, "applied pending changes");
    }

    /// Queue every key currently in the graph that matches `predicate` for recomputation.
    pub fn invalidate(&self, predicate: impl Fn(&NodeKey) -> bool) {
        let keys: Vec<NodeKey> = self.graph.keys().into_iter().filter(|k| predicate(k)).collect();
        self.pending.lock().invalidated.extend(keys);
    }

    /// Queue values to install before the next build. Later injections of the same key win.
    pub fn inject(&self, values: impl IntoIterator<Item = (NodeKey, Value)>) {
        let mut pending = self.pending.lock();
        for (key, value) in values {
            pending.invalidated.remove(&key);
            pending.injected.insert(key, value);
        }
    }

    /// Queue a differencer result.
    pub fn apply_diff(&self, diff: Diff) {
        let mut pending = self.pending.lock();
        for key in diff.changed_without_new_value {
            pending.injected.remove(&key);
            pending.invalidated.insert(key);
        }
        for (key, value) in diff.changed_with_new_value {
            pending.invalidated.remove(&key);
            pending.injected.insert(key, value);
        }
    }

    /// Queue every matching key, and everything depending on it, for removal.
    pub fn delete(&self, predicate: impl Fn(&NodeKey) -> bool) {
        let keys: Vec<NodeKey> = self.graph.keys().into_iter().filter(|k| predicate(k)).collect();
        self.pending.lock().deleted.extend(keys);
    }

    /// Remove unfinished nodes not evaluated within the last `window` builds and not
    /// reachable from the most recent roots. Returns the number of removed nodes.
    pub fn delete_dirty_older_than(&self, window: u64) -> usize {
        let _build = self.build_lock.lock();
        self.collect_stale(self.current_version(), window)
    }

    fn collect_stale(&self, current: Version, window: u64) -> usize {
        let reachable = self.reachable_from_last_roots();
        let stale: Vec<NodeKey> = self
            .graph
            .entries()
            .into_iter()
            .filter(|entry| {
                !entry.is_done()
                    && !entry.last_evaluated().is_within_window(current, window)
                    && !reachable.contains(entry.key())
            })
            .map(|entry| entry.key().clone())
            .collect();
        let invalidator = Invalidator::new(&self.graph, self.tracer.as_ref());
        invalidator.delete(stale)
    }

    fn reachable_from_last_roots(&self) -> AHashSet<NodeKey> {
        let mut reachable = AHashSet::new();
        let mut queue: VecDeque<NodeKey> = self.last_roots.lock().iter().cloned().collect();
        while let Some(key) = queue.pop_front() {
            if !reachable.insert(key.clone()) {
                continue;
            }
            if let Some(entry) = self.graph.get(&key) {
                queue.extend(entry.direct_deps().iter().cloned());
            }
        }
        reachable
    }

    /// Drop the values of matching done nodes. Dependents stay valid; an evicted node is
    /// recomputed when a later build needs it. Returns the number of evicted nodes.
    pub fn evict(&self, predicate: impl Fn(&NodeKey) -> bool) -> usize {
        let _build = self.build_lock.lock();
        let mut evicted = 0;
        for entry in self.graph.entries() {
            if predicate(entry.key()) && entry.evict() {
                self.tracer.on_node_invalidated(entry.key(), InvalidationReason::Evicted);
                evicted += 1;
            }
        }
        evicted
    }
}

/// Builder for [`MemoizingEvaluator`].
pub struct MemoizingEvaluatorBuilder {
    registry: FunctionRegistry,
    tracer: Arc<dyn Tracer>,
    event_handler: Arc<dyn EventHandler>,
    config: EngineConfig,
}

impl Default for MemoizingEvaluatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoizingEvaluatorBuilder {
    /// A builder with no functions, the logging event handler and no tracer.
    pub fn new() -> Self {
        Self {
            registry: FunctionRegistry::new(),
            tracer: Arc::new(NoopTracer),
            event_handler: Arc::new(LoggingEventHandler),
            config: EngineConfig::default(),
        }
    }

    /// Bind `kind` to `function`.
    pub fn function(mut self, kind: FunctionKind, function: impl NodeFunction) -> Self {
        self.registry.register(kind, function);
        self
    }

    /// Bind `kind` to a shared function.
    pub fn shared_function(mut self, kind: FunctionKind, function: Arc<dyn NodeFunction>) -> Self {
        self.registry.register_shared(kind, function);
        self
    }

    /// Bind several functions at once, such as
    /// [`filesystem_functions`](crate::fs::filesystem_functions).
    pub fn functions(mut self, functions: impl IntoIterator<Item = (FunctionKind, Arc<dyn NodeFunction>)>) -> Self {
        for (kind, function) in functions {
            self.registry.register_shared(kind, function);
        }
        self
    }

    /// Set the tracer.
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Set the receiver of node events.
    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = handler;
        self
    }

    /// Set the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the evaluator.
    pub fn build(self) -> MemoizingEvaluator {
        MemoizingEvaluator {
            graph: Arc::new(InMemoryGraph::new()),
            registry: self.registry,
            tracer: self.tracer,
            event_handler: self.event_handler,
            resources: ResourceManager::new(self.config.heavy_function_slots),
            config: self.config,
            version: Mutex::new(Version::NEVER),
            build_lock: Mutex::new(()),
            pending: Mutex::new(Pending::default()),
            last_roots: Mutex::new(Vec::new()),
        }
    }
}
