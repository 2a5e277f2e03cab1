//! Tracer trait for observing graph evaluation.
//!
//! The default [`NoopTracer`] costs nothing. Implementations can count invocations in
//! tests, forward to the `tracing` crate, or feed custom tooling.
//!
//! # Example
//!
//! ```ignore
//! use memograph::{NodeKey, Tracer};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn on_node_start(&self, key: &NodeKey) {
//!         println!("computing {key}");
//!     }
//! }
//! ```

use crate::error::CycleInfo;
use crate::key::NodeKey;
use crate::version::Version;

/// How one visit to a node ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The function produced a new value.
    Changed,
    /// The function produced a value equal to the previous one; dependents are pruned.
    Unchanged,
    /// A dirty node was verified clean without running its function.
    VerifiedClean,
    /// The function needs dependencies that are not done yet and will be restarted.
    Restarted,
    /// A dependency failed and the function was not invoked (or its result discarded).
    ShortCircuited {
        /// The failed dependency.
        child: NodeKey,
    },
    /// The node failed.
    Failed {
        /// Display form of the error.
        message: String,
    },
}

/// Reason a cached node was invalidated between builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationReason {
    /// The node itself was reported changed and must be recomputed.
    Changed,
    /// A transitive dependency changed; the node must re-check its dependencies.
    DependencyDirtied,
    /// A new value was injected.
    Injected,
    /// The node was deleted.
    Deleted,
    /// The node's value was evicted to save memory.
    Evicted,
}

/// Tracer trait for observing graph evaluation.
///
/// All methods have default empty implementations, so you only need to override the
/// events you're interested in.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` as worker threads call the tracer
/// concurrently.
pub trait Tracer: Send + Sync + 'static {
    /// Called before a build starts, after pending invalidations were applied.
    #[inline]
    fn on_evaluation_start(&self, _version: Version, _roots: &[NodeKey]) {}

    /// Called after a build finished or was abandoned.
    #[inline]
    fn on_evaluation_end(&self, _version: Version) {}

    /// Called right before a node function is invoked.
    #[inline]
    fn on_node_start(&self, _key: &NodeKey) {}

    /// Called when a visit to a node ends.
    #[inline]
    fn on_node_end(&self, _key: &NodeKey, _result: ExecutionResult) {}

    /// Called when a node starts waiting for a dependency.
    #[inline]
    fn on_dependency_registered(&self, _parent: &NodeKey, _dependency: &NodeKey) {}

    /// Called for every node an invalidation touches.
    #[inline]
    fn on_node_invalidated(&self, _key: &NodeKey, _reason: InvalidationReason) {}

    /// Called when a dependency cycle is detected.
    #[inline]
    fn on_cycle_detected(&self, _cycle: &CycleInfo) {}
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for [`MemoizingEvaluator`](crate::MemoizingEvaluator).
pub struct NoopTracer;

impl Tracer for NoopTracer {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::FunctionKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTracer {
        start_count: AtomicUsize,
        end_count: AtomicUsize,
    }

    impl Tracer for CountingTracer {
        fn on_node_start(&self, _key: &NodeKey) {
            self.start_count.fetch_add(1, Ordering::Relaxed);
        }

        fn on_node_end(&self, _key: &NodeKey, _result: ExecutionResult) {
            self.end_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_defaults_are_noops() {
        let key = NodeKey::new(FunctionKind::new("T"), 1u8);
        let tracer = NoopTracer;
        tracer.on_node_start(&key);
        tracer.on_node_end(&key, ExecutionResult::Changed);
        tracer.on_node_invalidated(&key, InvalidationReason::Changed);
    }

    #[test]
    fn test_custom_tracer_overrides() {
        let key = NodeKey::new(FunctionKind::new("T"), 1u8);
        let tracer = CountingTracer {
            start_count: AtomicUsize::new(0),
            end_count: AtomicUsize::new(0),
        };
        let dyn_tracer: &dyn Tracer = &tracer;
        dyn_tracer.on_node_start(&key);
        dyn_tracer.on_node_end(&key, ExecutionResult::Restarted);
        dyn_tracer.on_node_end(&key, ExecutionResult::Unchanged);
        assert_eq!(tracer.start_count.load(Ordering::Relaxed), 1);
        assert_eq!(tracer.end_count.load(Ordering::Relaxed), 2);
    }
}
