//! The parallel evaluator: one build over the graph.
//!
//! Ready keys run as tasks of a `rayon` scope. A node that needs a dependency which is
//! not done registers itself as a waiting parent and returns; the last dependency to
//! finish schedules it again. When a scope drains while roots are still unfinished, the
//! remaining keys are waiting on each other and the cycle reporter takes over.

mod cycle;
mod result;

pub use result::EvaluationResult;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use ahash::AHashSet;
use parking_lot::Mutex;
use rayon::{Scope, ThreadPool, ThreadPoolBuilder};
use tracing::{debug, trace, warn};

use crate::config::EvaluationOptions;
use crate::error::{ComputeError, CycleInfo, EvalError, Failure, NodeError, UnregisteredFunction};
use crate::events::{Event, EventHandler};
use crate::function::{Environment, FunctionRegistry};
use crate::graph::{CheckState, DependencyState, GroupedDeps, InMemoryGraph, NodeEntry, NodeResult, NodeState};
use crate::key::{FunctionKind, NodeKey};
use crate::resource::ResourceManager;
use crate::tracer::{ExecutionResult, Tracer};
use crate::version::Version;

/// Built-in kind whose single node is re-injected with a fresh value before every build.
///
/// Nodes that fail transiently depend on it, so they are retried by the next build.
pub const ERROR_TRANSIENCE: FunctionKind = FunctionKind::new("ERROR_TRANSIENCE");

/// The key of the [`ERROR_TRANSIENCE`] node.
pub fn error_transience_key() -> NodeKey {
    NodeKey::new(ERROR_TRANSIENCE, ())
}

/// Runs one build over a graph.
///
/// Normally driven by [`MemoizingEvaluator`](crate::MemoizingEvaluator), which applies
/// pending invalidations first and bumps the version.
pub struct ParallelEvaluator<'a> {
    graph: Arc<InMemoryGraph>,
    registry: &'a FunctionRegistry,
    version: Version,
    options: &'a EvaluationOptions,
    tracer: &'a dyn Tracer,
    event_handler: &'a dyn EventHandler,
    resources: &'a ResourceManager,
    stopping: AtomicBool,
    first_error: OnceLock<(NodeKey, NodeError)>,
    cycles: Mutex<Vec<(NodeKey, CycleInfo)>>,
}

impl<'a> ParallelEvaluator<'a> {
    /// Create an evaluator for one build at `version`.
    pub fn new(
        graph: Arc<InMemoryGraph>,
        registry: &'a FunctionRegistry,
        version: Version,
        options: &'a EvaluationOptions,
        tracer: &'a dyn Tracer,
        event_handler: &'a dyn EventHandler,
        resources: &'a ResourceManager,
    ) -> Self {
        Self {
            graph,
            registry,
            version,
            options,
            tracer,
            event_handler,
            resources,
            stopping: AtomicBool::new(false),
            first_error: OnceLock::new(),
            cycles: Mutex::new(Vec::new()),
        }
    }

    /// Evaluate `roots` until each is done, the build is aborted or it is interrupted.
    pub fn eval(&self, roots: &[NodeKey]) -> Result<EvaluationResult, EvalError> {
        let started = Instant::now();
        let mut seen = AHashSet::new();
        let roots: Vec<NodeKey> = roots
            .iter()
            .filter(|root| seen.insert((*root).clone()))
            .cloned()
            .collect();

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.options.num_workers.max(1))
            .thread_name(|i| format!("memograph-worker-{i}"))
            .build()?;

        self.tracer.on_evaluation_start(self.version, &roots);
        debug!(version = %self.version, roots = roots.len(), "evaluation started");

        pool.scope(|s| {
            for root in &roots {
                let entry = self.graph.create_if_absent(root);
                if entry.add_reverse_dep_and_check_if_done(None) == DependencyState::NeedsScheduling {
                    self.schedule(root.clone(), s);
                }
            }
        });
        let outcome = self.drive(&pool, &roots);
        let error_info = self.attribute_first_error(&roots);
        if outcome.is_err() || self.should_stop() {
            self.abandon_unfinished();
        }

        self.tracer.on_evaluation_end(self.version);
        debug!(
            version = %self.version,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "evaluation finished"
        );

        outcome?;
        if self.options.is_interrupted() {
            return Err(EvalError::Interrupted);
        }
        Ok(self.collect(&roots, error_info))
    }

    fn drive(&self, pool: &ThreadPool, roots: &[NodeKey]) -> Result<(), EvalError> {
        loop {
            if self.should_stop() {
                return Ok(());
            }
            let unfinished: Vec<NodeKey> = roots
                .iter()
                .filter(|root| !self.graph.get(root).is_some_and(|e| e.is_done()))
                .cloned()
                .collect();
            if unfinished.is_empty() {
                return Ok(());
            }
            let progressed = pool.scope(|s| self.report_cycles(&unfinished, s));
            if !progressed {
                return Err(EvalError::Stalled(unfinished));
            }
        }
    }

    fn should_stop(&self) -> bool {
        if self.options.is_interrupted() {
            self.stopping.store(true, Ordering::SeqCst);
        }
        self.stopping.load(Ordering::SeqCst)
    }

    fn schedule<'s>(&'s self, key: NodeKey, scope: &Scope<'s>) {
        scope.spawn(move |s| self.process(key, s));
    }

    fn process<'s>(&'s self, key: NodeKey, scope: &Scope<'s>) {
        if self.should_stop() {
            return;
        }
        let Some(entry) = self.graph.get(&key) else {
            return;
        };
        if self.check_dependencies(&key, &entry, scope) {
            self.run_function(&key, &entry, scope);
        }
    }

    /// Re-check the old dependency groups of a dirty node. Returns true if the function
    /// has to run.
    fn check_dependencies<'s>(&'s self, key: &NodeKey, entry: &NodeEntry, scope: &Scope<'s>) -> bool {
        loop {
            let CheckState::Checking {
                next_group,
                last_evaluated,
                old_deps,
            } = entry.check_state()
            else {
                return true;
            };
            if next_group > 0 {
                let changed = old_deps.group(next_group - 1).iter().find(|dep| {
                    self.graph.get(dep).map_or(true, |e| {
                        e.result().is_none() || e.last_changed().is_newer_than(last_evaluated)
                    })
                });
                if let Some(dep) = changed {
                    trace!(%key, %dep, "dependency changed, rebuilding");
                    entry.set_rebuilding();
                    return true;
                }
            }
            if next_group == old_deps.group_count() {
                let parents = entry.mark_clean(self.version);
                trace!(%key, "verified clean");
                self.tracer.on_node_end(key, ExecutionResult::VerifiedClean);
                self.signal_parents(parents, scope);
                return false;
            }
            let group = entry.advance_check_group();
            if !self.request(key, entry, group, scope) {
                return false;
            }
        }
    }

    /// Register `deps` as awaited by `key`, scheduling those nobody evaluates yet.
    /// Returns true if every registered dependency is already done, in which case the
    /// caller continues with `key` itself.
    fn request<'s>(&'s self, key: &NodeKey, entry: &NodeEntry, deps: Vec<NodeKey>, scope: &Scope<'s>) -> bool {
        let added = entry.register_deps(deps);
        if added.is_empty() {
            return true;
        }
        let mut ready = false;
        for dep in added {
            self.tracer.on_dependency_registered(key, &dep);
            let dep_entry = self.graph.create_if_absent(&dep);
            match dep_entry.add_reverse_dep_and_check_if_done(Some(key)) {
                DependencyState::Done => ready |= entry.signal_dep(),
                DependencyState::NeedsScheduling => self.schedule(dep, scope),
                DependencyState::AlreadyEvaluating => {}
            }
        }
        ready
    }

    fn uncaught_error(&self, entry: &NodeEntry) -> Option<(NodeKey, NodeError)> {
        entry.registered_deps().into_iter().find_map(|dep| {
            if entry.catches(&dep) {
                return None;
            }
            match self.graph.get(&dep)?.result()? {
                Err(error) => Some((dep, error)),
                Ok(_) => None,
            }
        })
    }

    fn registered_as_group(entry: &NodeEntry) -> GroupedDeps {
        std::iter::once(entry.registered_deps()).collect()
    }

    fn run_function<'s>(&'s self, key: &NodeKey, entry: &NodeEntry, scope: &Scope<'s>) {
        if entry.has_restarted() {
            if let Some((child, error)) = self.uncaught_error(entry) {
                let error = NodeError::propagated(key.clone(), child, error);
                self.commit(key, entry, Err(error), Self::registered_as_group(entry), Vec::new(), scope);
                return;
            }
        }

        let Some(function) = self.registry.get(key.kind()) else {
            let error = NodeError::Failed {
                key: key.clone(),
                failure: Failure::persistent(UnregisteredFunction(key.kind())),
            };
            self.commit(key, entry, Err(error), GroupedDeps::new(), Vec::new(), scope);
            return;
        };

        self.tracer.on_node_start(key);
        let (computed, invocation) = {
            let _slot = function.is_resource_heavy().then(|| self.resources.acquire());
            let mut env = Environment::new(key, &self.graph, self.options.interrupt.as_ref());
            let computed = function.compute(key, &mut env);
            (computed, env.finish())
        };
        if self.should_stop() {
            return;
        }

        entry.mark_caught(invocation.caught.iter().cloned());
        let uncaught = invocation
            .errored
            .into_iter()
            .find(|(dep, _)| !invocation.caught.contains(dep));

        match computed {
            Err(ComputeError::Failed(failure)) => {
                let error = NodeError::Failed {
                    key: key.clone(),
                    failure,
                };
                self.commit(key, entry, Err(error), invocation.deps, invocation.events, scope);
            }
            Ok(value) if invocation.missing.is_empty() && uncaught.is_none() => {
                self.commit(key, entry, Ok(value), invocation.deps, invocation.events, scope);
            }
            _ => {
                if let Some((child, error)) = uncaught {
                    let error = NodeError::propagated(key.clone(), child, error);
                    self.commit(key, entry, Err(error), invocation.deps, invocation.events, scope);
                } else if invocation.missing.is_empty() {
                    let error = NodeError::Failed {
                        key: key.clone(),
                        failure: Failure::persistent(anyhow::anyhow!(
                            "{key} reported missing dependencies without requesting any"
                        )),
                    };
                    self.commit(key, entry, Err(error), invocation.deps, invocation.events, scope);
                } else {
                    trace!(%key, missing = invocation.missing.len(), "restarting");
                    entry.note_restart();
                    self.tracer.on_node_end(key, ExecutionResult::Restarted);
                    if self.request(key, entry, invocation.missing, scope) {
                        self.schedule(key.clone(), scope);
                    }
                }
            }
        }
    }

    fn commit<'s>(
        &'s self,
        key: &NodeKey,
        entry: &NodeEntry,
        result: NodeResult,
        mut deps: GroupedDeps,
        events: Vec<Event>,
        scope: &Scope<'s>,
    ) {
        let failure = result.as_ref().err().cloned();
        if failure.as_ref().is_some_and(NodeError::is_transient) {
            let transience = error_transience_key();
            self.graph.create_if_absent(&transience);
            deps.push_group(vec![transience]);
        }
        let all_deps: Vec<NodeKey> = deps.iter().cloned().collect();
        let outcome = entry.set_value(result, self.version, deps);
        for dep in &all_deps {
            if let Some(dep_entry) = self.graph.get(dep) {
                dep_entry.add_rdep(key);
            }
        }
        for dep in &outcome.stale_deps {
            if let Some(dep_entry) = self.graph.get(dep) {
                dep_entry.remove_rdep(key);
            }
        }

        if !events.is_empty() {
            let tag = self.registry.get(key.kind()).and_then(|f| f.extract_tag(key));
            for event in events {
                self.event_handler.handle(&event.tagged(tag.clone()));
            }
        }

        let execution = match &failure {
            None if outcome.kept_old_value => {
                trace!(%key, "value unchanged, pruning dependents");
                ExecutionResult::Unchanged
            }
            None => ExecutionResult::Changed,
            Some(NodeError::Propagated { child, .. }) => ExecutionResult::ShortCircuited { child: child.clone() },
            Some(error) => ExecutionResult::Failed {
                message: error.to_string(),
            },
        };
        self.tracer.on_node_end(key, execution);

        if let Some(error) = failure {
            if !self.options.keep_going && !self.caught_by_any(key, &outcome.waiting_parents) {
                self.abort(key, error);
                return;
            }
        }
        self.signal_parents(outcome.waiting_parents, scope);
    }

    fn caught_by_any(&self, key: &NodeKey, parents: &[NodeKey]) -> bool {
        parents
            .iter()
            .any(|p| self.graph.get(p).is_some_and(|e| e.catches(key)))
    }

    fn abort(&self, key: &NodeKey, error: NodeError) {
        if self.first_error.set((key.clone(), error)).is_ok() {
            debug!(%key, "aborting build on first error");
        }
        self.stopping.store(true, Ordering::SeqCst);
    }

    fn signal_parents<'s>(&'s self, parents: Vec<NodeKey>, scope: &Scope<'s>) {
        for parent in parents {
            if self.graph.get(&parent).is_some_and(|e| e.signal_dep()) {
                self.schedule(parent, scope);
            }
        }
    }

    /// Commit an error to every member of the cycles blocking `unfinished` roots.
    /// Returns false if there was no cycle to break.
    fn report_cycles<'s>(&'s self, unfinished: &[NodeKey], scope: &Scope<'s>) -> bool {
        let found: Vec<(NodeKey, CycleInfo)> = unfinished
            .iter()
            .filter_map(|root| cycle::find_cycle(&self.graph, root).map(|info| (root.clone(), info)))
            .collect();
        if found.is_empty() {
            return false;
        }

        let mut members: AHashSet<NodeKey> = AHashSet::new();
        let mut committed: Vec<(NodeKey, NodeError, Vec<NodeKey>)> = Vec::new();
        for (root, info) in &found {
            warn!(%root, "{info}");
            self.tracer.on_cycle_detected(info);
            for member in info.cycle() {
                if !members.insert(member.clone()) {
                    continue;
                }
                let Some(entry) = self.graph.get(member) else {
                    continue;
                };
                let error = NodeError::Cycle(info.rotated_to(member));
                let deps = Self::registered_as_group(&entry);
                let all_deps: Vec<NodeKey> = deps.iter().cloned().collect();
                let outcome = entry.set_value(Err(error.clone()), self.version, deps);
                for dep in &all_deps {
                    if let Some(dep_entry) = self.graph.get(dep) {
                        dep_entry.add_rdep(member);
                    }
                }
                for dep in &outcome.stale_deps {
                    if let Some(dep_entry) = self.graph.get(dep) {
                        dep_entry.remove_rdep(member);
                    }
                }
                self.tracer.on_node_end(
                    member,
                    ExecutionResult::Failed {
                        message: error.to_string(),
                    },
                );
                committed.push((member.clone(), error, outcome.waiting_parents));
            }
        }
        self.cycles.lock().extend(found);

        if !self.options.keep_going {
            if let Some((member, error, _)) = committed.into_iter().next() {
                self.abort(&member, error);
            }
            return true;
        }
        for (_, _, parents) in committed {
            let outside: Vec<NodeKey> = parents.into_iter().filter(|p| !members.contains(p)).collect();
            self.signal_parents(outside, scope);
        }
        true
    }

    /// Pick the root an aborting error is reported under: the smallest root that reaches
    /// the failed node through reverse edges.
    fn attribute_first_error(&self, roots: &[NodeKey]) -> Option<(NodeKey, NodeError)> {
        let (failed, error) = self.first_error.get().cloned()?;
        let root_set: AHashSet<&NodeKey> = roots.iter().collect();
        let mut reached: Vec<NodeKey> = Vec::new();
        let mut visited: AHashSet<NodeKey> = AHashSet::new();
        let mut queue: VecDeque<NodeKey> = VecDeque::new();
        visited.insert(failed.clone());
        queue.push_back(failed.clone());
        while let Some(key) = queue.pop_front() {
            if root_set.contains(&key) {
                reached.push(key.clone());
            }
            if let Some(entry) = self.graph.get(&key) {
                for parent in entry.parents() {
                    if visited.insert(parent.clone()) {
                        queue.push_back(parent);
                    }
                }
            }
        }
        let root = reached.into_iter().min().or_else(|| roots.iter().min().cloned())?;
        if root == failed {
            Some((root, error))
        } else {
            let propagated = NodeError::propagated(root.clone(), failed, error);
            Some((root, propagated))
        }
    }

    /// Roll back every node a stopped build left in [`NodeState::Building`]. The entry
    /// state is the only record of which nodes this build claimed.
    fn abandon_unfinished(&self) {
        let mut abandoned = 0usize;
        for key in self.graph.keys() {
            let Some(entry) = self.graph.get(&key) else {
                continue;
            };
            if entry.state() != NodeState::Building {
                continue;
            }
            abandoned += 1;
            for dep in entry.abandon() {
                if let Some(dep_entry) = self.graph.get(&dep) {
                    dep_entry.remove_rdep(&key);
                }
            }
        }
        if abandoned > 0 {
            debug!(abandoned, "abandoned unfinished nodes");
        }
    }

    fn collect(&self, roots: &[NodeKey], error_info: Option<(NodeKey, NodeError)>) -> EvaluationResult {
        let mut values = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for root in roots {
            match self.graph.get(root).and_then(|e| e.result()) {
                Some(Ok(value)) => {
                    values.insert(root.clone(), value);
                }
                Some(Err(error)) => {
                    errors.insert(root.clone(), error);
                }
                None => {}
            }
        }
        let error_info = if self.options.keep_going {
            None
        } else {
            // Without keep-going exactly one error is reported.
            let info = error_info.or_else(|| errors.iter().next().map(|(k, e)| (k.clone(), e.clone())));
            errors.clear();
            if let Some((root, error)) = &info {
                errors.insert(root.clone(), error.clone());
            }
            info
        };
        let cycles = std::mem::take(&mut *self.cycles.lock());
        EvaluationResult::new(values, errors, error_info, cycles, self.graph.clone())
    }
}
