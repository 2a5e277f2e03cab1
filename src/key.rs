//! Node identity.

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::fmt::{self, Debug, Display};
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;

/// Object-safe equality comparison.
///
/// This trait enables comparing two trait objects for equality
/// by downcasting and comparing the concrete types.
pub trait DynEq: Any {
    /// Returns `true` if `other` is the same concrete type and equal to `self`.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Trait for types that can serve as the argument of a [`NodeKey`].
///
/// Automatically implemented for every `Hash + Eq + Debug + Send + Sync + 'static` type.
pub trait KeyArgument: DynHash + DynEq + Debug + Send + Sync {
    /// Get the argument as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Get the type name of the argument.
    fn type_name(&self) -> &'static str;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> KeyArgument for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

dyn_hash::hash_trait_object!(KeyArgument);

/// The kind of computation a key names. Each kind is bound to exactly one
/// [`NodeFunction`](crate::NodeFunction) in the registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionKind(&'static str);

impl FunctionKind {
    /// Create a function kind from its name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The name of this kind.
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl Debug for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Identity of one cacheable computation: a function kind plus an opaque argument.
///
/// Cloning is cheap; the argument is shared behind an `Arc`.
#[derive(Clone)]
pub struct NodeKey {
    kind: FunctionKind,
    argument_type: TypeId,
    argument: Arc<dyn KeyArgument>,
}

impl NodeKey {
    /// Create a new key.
    pub fn new<A: KeyArgument + 'static>(kind: FunctionKind, argument: A) -> Self {
        Self {
            kind,
            argument_type: TypeId::of::<A>(),
            argument: Arc::new(argument),
        }
    }

    /// The function kind of this key.
    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    /// Downcast the argument to its original type.
    pub fn argument<A: 'static>(&self) -> Option<&A> {
        self.argument.as_any().downcast_ref()
    }

    /// The type-erased argument.
    pub fn raw_argument(&self) -> &Arc<dyn KeyArgument> {
        &self.argument
    }

    /// Debug representation of the argument.
    pub fn debug_repr(&self) -> String {
        format!("{:?}", self.argument)
    }
}

impl Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.kind, self.argument)
    }
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

impl Hash for NodeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.argument_type.hash(state);
        self.argument.hash(state);
    }
}

impl PartialEq for NodeKey {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.argument_type == other.argument_type
            && self.argument.dyn_eq(other.argument.as_any())
    }
}

impl Eq for NodeKey {}

/// Compares formatted output against `rest` as it is written, stopping at the first
/// difference.
struct DebugComparer<'a> {
    rest: &'a str,
    ordering: Ordering,
}

impl fmt::Write for DebugComparer<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(self.rest.len());
        // `rest` holds the left-hand side.
        self.ordering = self.rest.as_bytes()[..n].cmp(&s.as_bytes()[..n]);
        if self.ordering == Ordering::Equal && s.len() > self.rest.len() {
            self.ordering = Ordering::Less;
        }
        if self.ordering != Ordering::Equal {
            return Err(fmt::Error);
        }
        self.rest = &self.rest[n..];
        Ok(())
    }
}

fn cmp_debug(left: &dyn KeyArgument, right: &dyn KeyArgument) -> Ordering {
    let left = format!("{left:?}");
    let mut comparer = DebugComparer {
        rest: &left,
        ordering: Ordering::Equal,
    };
    let _ = fmt::write(&mut comparer, format_args!("{right:?}"));
    match comparer.ordering {
        Ordering::Equal if !comparer.rest.is_empty() => Ordering::Greater,
        ordering => ordering,
    }
}

fn stable_hash(key: &NodeKey) -> u64 {
    let state = ahash::RandomState::with_seeds(0x6d65_6d6f, 0x6772_6170, 0x686b_6579, 0x6f72_6465);
    BuildHasher::hash_one(&state, key)
}

// Ordering is only used to make error attribution and reports deterministic. Keys are
// ordered by kind, then by their argument's `Debug` output; unequal keys that print the
// same fall back to a fixed-seed hash.
impl Ord for NodeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        if self == other {
            return Ordering::Equal;
        }
        self.kind
            .cmp(&other.kind)
            .then_with(|| cmp_debug(self.argument.as_ref(), other.argument.as_ref()))
            .then_with(|| self.argument.type_name().cmp(other.argument.type_name()))
            .then_with(|| stable_hash(self).cmp(&stable_hash(other)))
    }
}

impl PartialOrd for NodeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
