//! Memograph: an incremental, memoized, dependency-tracking computation graph.
//!
//! Each node of the graph is identified by a [`NodeKey`] and computed by the
//! [`NodeFunction`] registered for its [`FunctionKind`]. Functions read their
//! dependencies through an [`Environment`], which records every read. Between builds,
//! changes are reported as invalidations or injected values, and the next build
//! recomputes only what is affected.
//!
//! # Key Features
//!
//! - **Restartable functions**: a function that asks for a dependency that is not done
//!   returns [`ComputeError::Unavailable`] and is re-invoked once it is
//! - **Parallel evaluation**: independent nodes run concurrently on a worker pool
//! - **Change pruning**: a recomputed node whose value is unchanged keeps its old value,
//!   so its dependents are verified clean instead of recomputed
//! - **Error handling**: transient and persistent failures, keep-going builds and cycle
//!   reports with the path that led into the cycle
//! - **Filesystem support**: low-level file nodes, a differencer that turns filesystem
//!   changes into invalidations, and a recursive traversal function
//!
//! # Example
//!
//! ```ignore
//! use memograph::{value, ComputeError, EngineConfig, Environment, FunctionKind, MemoizingEvaluator, NodeKey, Value};
//!
//! const DOUBLE: FunctionKind = FunctionKind::new("DOUBLE");
//!
//! let evaluator = MemoizingEvaluator::builder()
//!     .function(DOUBLE, |key: &NodeKey, _env: &mut Environment<'_>| -> Result<Value, ComputeError> {
//!         Ok(value(key.argument::<u32>().copied().unwrap_or(0) * 2))
//!     })
//!     .config(EngineConfig::for_tests())
//!     .build();
//!
//! let key = NodeKey::new(DOUBLE, 21u32);
//! let result = evaluator.evaluate(&[key.clone()], &evaluator.default_options())?;
//! assert_eq!(*result.get_as::<u32>(&key).unwrap(), 42);
//! ```
//!
//! # Invalidation
//!
//! - [`MemoizingEvaluator::invalidate`] marks keys changed
//! - [`MemoizingEvaluator::inject`] installs externally known values
//! - [`MemoizingEvaluator::apply_diff`] queues a [`Diff`] from a [`FilesystemDiffer`]
//! - [`MemoizingEvaluator::delete`] removes keys and everything depending on them
//!
//! All of them take effect at the start of the next build.

#![warn(missing_docs)]

mod config;
pub mod differencer;
mod error;
mod evaluator;
mod events;
pub mod fs;
mod function;
pub mod graph;
mod invalidation;
mod key;
mod memoizing;
pub mod nested_set;
mod resource;
pub mod tracer;
pub mod traversal;
mod value;
mod version;

pub use config::{EngineConfig, EvaluationOptions, Interrupt, DEFAULT_NUM_WORKERS};
pub use differencer::{Diff, DiffAwareness, FilesystemDiffer, ModifiedFileSet};
pub use error::{
    ComputeError, CycleInfo, EvalError, Failure, FailureExt, NodeError, Transience, Unavailable,
    UnregisteredFunction,
};
pub use evaluator::{error_transience_key, EvaluationResult, ParallelEvaluator, ERROR_TRANSIENCE};
pub use events::{Event, EventHandler, EventKind, LoggingEventHandler, StoredEventHandler};
pub use function::{Environment, FunctionRegistry, NodeFunction, ValueTypeMismatch};
pub use graph::{InMemoryGraph, NodeState, WalkableGraph};
pub use key::{DynEq, FunctionKind, KeyArgument, NodeKey};
pub use memoizing::{MemoizingEvaluator, MemoizingEvaluatorBuilder};
pub use nested_set::{NestedSet, NestedSetBuilder, Order};
pub use resource::{ResourceGuard, ResourceManager};
pub use tracer::{ExecutionResult, InvalidationReason, NoopTracer, Tracer};
pub use value::{downcast_value, value, NodeValue, Value};
pub use version::Version;
