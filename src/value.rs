//! Node values.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// A memoized result of a node function.
///
/// Implemented for every `PartialEq + Debug + Send + Sync + 'static` type. Equality is
/// what change pruning compares, so it must be deterministic and cheap enough to run
/// on every rebuild.
pub trait NodeValue: Any + Debug + Send + Sync {
    /// Compare against another value of any type. Values of different types are never equal.
    fn value_eq(&self, other: &dyn NodeValue) -> bool;

    /// Get the value as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Convert into an `Arc<dyn Any>` for owned downcasting.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Type name of the concrete value, used in error messages.
    fn type_name(&self) -> &'static str;
}

impl<T: PartialEq + Debug + Send + Sync + 'static> NodeValue for T {
    fn value_eq(&self, other: &dyn NodeValue) -> bool {
        other.as_any().downcast_ref::<T>().is_some_and(|o| self == o)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A shared, type-erased node value.
pub type Value = Arc<dyn NodeValue>;

/// Wrap a concrete value.
pub fn value<T: NodeValue>(v: T) -> Value {
    Arc::new(v)
}

/// Downcast a shared value to its concrete type without copying.
pub fn downcast_value<T: NodeValue>(value: &Value) -> Option<Arc<T>> {
    Arc::clone(value).into_any().downcast::<T>().ok()
}

/// Compare two values for change pruning. Identical `Arc`s short-circuit.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    Arc::ptr_eq(a, b) || a.value_eq(b.as_ref())
}
