//! Error types for node evaluation.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::key::{FunctionKind, NodeKey};

/// Whether a failure may go away on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transience {
    /// Cleared at the start of the next build and retried.
    Transient,
    /// Stays failed until an input change invalidates the node.
    Persistent,
}

/// A failure reported by a node function.
///
/// Wraps any `Into<anyhow::Error>` together with its [`Transience`]. The inner error can
/// be recovered with [`Failure::downcast_ref`].
#[derive(Clone)]
pub struct Failure {
    transience: Transience,
    error: Arc<anyhow::Error>,
}

impl Failure {
    /// A failure that stays until an input changes.
    pub fn persistent(error: impl Into<anyhow::Error>) -> Self {
        Self {
            transience: Transience::Persistent,
            error: Arc::new(error.into()),
        }
    }

    /// A failure that is retried on the next build.
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self {
            transience: Transience::Transient,
            error: Arc::new(error.into()),
        }
    }

    /// The transience classification.
    pub fn transience(&self) -> Transience {
        self.transience
    }

    /// The wrapped error.
    pub fn error(&self) -> &Arc<anyhow::Error> {
        &self.error
    }

    /// Attempts to downcast the wrapped error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.error.downcast_ref::<E>()
    }

    /// Returns `true` if the wrapped error is of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("transience", &self.transience)
            .field("error", &format_args!("{}", self.error))
            .finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transience {
            Transience::Transient => write!(f, "{} (transient)", self.error),
            Transience::Persistent => write!(f, "{}", self.error),
        }
    }
}

/// Extension trait for turning any fallible result into a node [`Failure`].
///
/// ```ignore
/// let text = std::fs::read_to_string(path).transient()?;
/// ```
pub trait FailureExt<T> {
    /// Classify the error as persistent.
    fn persistent(self) -> Result<T, Failure>;

    /// Classify the error as transient.
    fn transient(self) -> Result<T, Failure>;
}

impl<T, E: Into<anyhow::Error>> FailureExt<T> for Result<T, E> {
    fn persistent(self) -> Result<T, Failure> {
        self.map_err(Failure::persistent)
    }

    fn transient(self) -> Result<T, Failure> {
        self.map_err(Failure::transient)
    }
}

/// Marker returned when a requested dependency is not yet available in this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Unavailable;

/// Outcome of a node function other than a value.
#[derive(Debug, Clone)]
pub enum ComputeError {
    /// Some dependency is not yet available; the function is restarted from scratch
    /// once every requested dependency is done.
    Unavailable,
    /// The computation failed.
    Failed(Failure),
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeError::Unavailable => write!(f, "dependencies unavailable"),
            ComputeError::Failed(failure) => write!(f, "{failure}"),
        }
    }
}

impl From<Unavailable> for ComputeError {
    fn from(_: Unavailable) -> Self {
        ComputeError::Unavailable
    }
}

impl From<Failure> for ComputeError {
    fn from(failure: Failure) -> Self {
        ComputeError::Failed(failure)
    }
}

/// A dependency cycle, plus the path from a root into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleInfo {
    path_to_cycle: Vec<NodeKey>,
    cycle: Vec<NodeKey>,
}

impl CycleInfo {
    /// Create cycle info.
    pub fn new(path_to_cycle: Vec<NodeKey>, cycle: Vec<NodeKey>) -> Self {
        Self {
            path_to_cycle,
            cycle,
        }
    }

    /// The keys forming the cycle, in dependency order. The last key depends on the first.
    pub fn cycle(&self) -> &[NodeKey] {
        &self.cycle
    }

    /// The keys leading from a root into the cycle, excluding the cycle itself.
    pub fn path_to_cycle(&self) -> &[NodeKey] {
        &self.path_to_cycle
    }

    /// Returns true if `key` is part of the cycle.
    pub fn contains(&self, key: &NodeKey) -> bool {
        self.cycle.contains(key)
    }

    /// The same cycle as seen from `key`, which must be a member of it.
    pub(crate) fn rotated_to(&self, key: &NodeKey) -> Self {
        let start = self.cycle.iter().position(|k| k == key).unwrap_or(0);
        let mut cycle = self.cycle[start..].to_vec();
        cycle.extend_from_slice(&self.cycle[..start]);
        Self {
            path_to_cycle: Vec::new(),
            cycle,
        }
    }
}

impl fmt::Display for CycleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dependency cycle detected: ")?;
        for key in &self.path_to_cycle {
            write!(f, "{key} -> ")?;
        }
        write!(f, "[")?;
        for (i, key) in self.cycle.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{key}")?;
        }
        if let Some(first) = self.cycle.first() {
            write!(f, " -> {first}")?;
        }
        write!(f, "]")
    }
}

/// The error state of a node, as seen by its dependents and by callers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeError {
    /// The node's own function failed.
    #[error("{key} failed: {failure}")]
    Failed {
        /// The failing node.
        key: NodeKey,
        /// What the function reported.
        failure: Failure,
    },

    /// The node is part of a dependency cycle.
    #[error("{0}")]
    Cycle(CycleInfo),

    /// A dependency failed and the node did not catch it.
    #[error("{key} depends on {child}, which failed: {cause}")]
    Propagated {
        /// The node that was short-circuited.
        key: NodeKey,
        /// The dependency whose error was propagated.
        child: NodeKey,
        /// The dependency's error.
        cause: Arc<NodeError>,
    },
}

impl NodeError {
    pub(crate) fn propagated(key: NodeKey, child: NodeKey, cause: NodeError) -> Self {
        NodeError::Propagated {
            key,
            child,
            cause: Arc::new(cause),
        }
    }

    /// Transience of the root cause. Cycles are always persistent.
    pub fn transience(&self) -> Transience {
        match self.root_cause() {
            NodeError::Failed { failure, .. } => failure.transience(),
            _ => Transience::Persistent,
        }
    }

    /// Returns true if the root cause is transient.
    pub fn is_transient(&self) -> bool {
        self.transience() == Transience::Transient
    }

    /// Follow propagated errors down to the originating error.
    pub fn root_cause(&self) -> &NodeError {
        let mut current = self;
        while let NodeError::Propagated { cause, .. } = current {
            current = cause.as_ref();
        }
        current
    }

    /// The key the root cause is attached to. Cycles report their first member.
    pub fn root_cause_key(&self) -> Option<&NodeKey> {
        match self.root_cause() {
            NodeError::Failed { key, .. } => Some(key),
            NodeError::Cycle(info) => info.cycle().first(),
            NodeError::Propagated { .. } => None,
        }
    }

    /// Cycle information if the root cause is a cycle.
    pub fn cycle_info(&self) -> Option<&CycleInfo> {
        match self.root_cause() {
            NodeError::Cycle(info) => Some(info),
            _ => None,
        }
    }

    /// The function failure if the root cause is one.
    pub fn failure(&self) -> Option<&Failure> {
        match self.root_cause() {
            NodeError::Failed { failure, .. } => Some(failure),
            _ => None,
        }
    }

    /// Attempts to downcast the root cause's failure to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.failure().and_then(|f| f.downcast_ref::<E>())
    }
}

/// A node function was requested for a kind that has no registry entry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("no node function registered for kind {0}")]
pub struct UnregisteredFunction(pub FunctionKind);

/// Errors from the engine itself, as opposed to errors of individual nodes.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// The build was interrupted before every root finished.
    #[error("evaluation interrupted")]
    Interrupted,

    /// The worker pool could not be started.
    #[error("failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Unfinished roots remained with no ready work and no detectable cycle.
    #[error("evaluation stalled with unfinished roots: {0:?}")]
    Stalled(Vec<NodeKey>),
}

#[cfg(test)]
mod tests {
    use super::*;

    const K: FunctionKind = FunctionKind::new("K");

    #[derive(Debug, thiserror::Error)]
    #[error("boom {0}")]
    struct Boom(u32);

    #[test]
    fn test_failure_downcast() {
        let failure = Failure::persistent(Boom(3));
        assert_eq!(failure.downcast_ref::<Boom>().map(|b| b.0), Some(3));
        assert!(!failure.is::<UnregisteredFunction>());
        assert_eq!(failure.to_string(), "boom 3");
        assert_eq!(Failure::transient(Boom(1)).to_string(), "boom 1 (transient)");
    }

    #[test]
    fn test_result_ext() {
        let r: Result<(), Boom> = Err(Boom(2));
        let failure = r.transient().unwrap_err();
        assert_eq!(failure.transience(), Transience::Transient);
    }

    #[test]
    fn test_root_cause_through_propagation() {
        let leaf = NodeError::Failed {
            key: NodeKey::new(K, "leaf"),
            failure: Failure::transient(Boom(1)),
        };
        let mid = NodeError::propagated(NodeKey::new(K, "mid"), NodeKey::new(K, "leaf"), leaf);
        let top = NodeError::propagated(NodeKey::new(K, "top"), NodeKey::new(K, "mid"), mid);
        assert_eq!(top.root_cause_key(), Some(&NodeKey::new(K, "leaf")));
        assert!(top.is_transient());
        assert_eq!(top.downcast_ref::<Boom>().map(|b| b.0), Some(1));
    }

    #[test]
    fn test_cycle_is_persistent_and_rotates() {
        let a = NodeKey::new(K, "a");
        let b = NodeKey::new(K, "b");
        let info = CycleInfo::new(vec![], vec![a.clone(), b.clone()]);
        let err = NodeError::Cycle(info.clone());
        assert_eq!(err.transience(), Transience::Persistent);
        assert_eq!(info.rotated_to(&b).cycle(), &[b, a]);
    }
}
