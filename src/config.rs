//! Engine and per-build configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Default number of evaluation workers. Most node functions are cheap, so a large pool
/// keeps I/O-bound functions from starving the rest.
pub const DEFAULT_NUM_WORKERS: usize = 200;

/// Long-lived configuration of a [`MemoizingEvaluator`](crate::MemoizingEvaluator).
///
/// Every field has a default, so partial documents deserialize:
///
/// ```
/// # use memograph::EngineConfig;
/// let config: EngineConfig = serde_json::from_str(r#"{ "num_workers": 8 }"#).unwrap();
/// assert_eq!(config.num_workers, 8);
/// assert!(!config.keep_going);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads per build.
    pub num_workers: usize,
    /// Default keep-going mode for builds.
    pub keep_going: bool,
    /// Concurrent slots for functions marked resource heavy.
    pub heavy_function_slots: usize,
    /// Builds a dirty node may stay unreachable before it is collected after a build.
    /// Zero disables automatic collection.
    pub gc_version_window: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: DEFAULT_NUM_WORKERS,
            keep_going: false,
            heavy_function_slots: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            gc_version_window: 0,
        }
    }
}

impl EngineConfig {
    /// A small configuration for constrained test environments.
    pub fn for_tests() -> Self {
        Self {
            num_workers: 4,
            heavy_function_slots: 2,
            ..Self::default()
        }
    }

    /// Options for one build using this configuration's defaults.
    pub fn evaluation_options(&self) -> EvaluationOptions {
        EvaluationOptions {
            keep_going: self.keep_going,
            num_workers: self.num_workers,
            interrupt: None,
        }
    }
}

/// A shareable interrupt flag for a running build.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// A fresh, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the build stop.
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once interrupted.
    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag so the handle can be reused.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Options for one `evaluate()` call.
#[derive(Debug, Clone)]
pub struct EvaluationOptions {
    /// Continue past errors and report every failing root.
    pub keep_going: bool,
    /// Worker threads for this build.
    pub num_workers: usize,
    /// Optional interrupt handle.
    pub interrupt: Option<Interrupt>,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        EngineConfig::default().evaluation_options()
    }
}

impl EvaluationOptions {
    /// Set keep-going mode.
    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    /// Set the worker count. Zero is treated as one.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    /// Attach an interrupt handle.
    pub fn interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(Interrupt::is_interrupted)
    }
}
