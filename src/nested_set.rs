//! Structurally shared, immutable aggregates.
//!
//! A [`NestedSet`] combines its own direct elements with already-built child sets by
//! reference, so a node aggregating the results of its dependencies never copies their
//! contents. Equality does not depend on iteration order: two sets are equal when they
//! hold the same direct elements and the same child sets.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use ahash::AHashSet;

/// Iteration order of a flattened [`NestedSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Order {
    /// Children before parents, left to right. No further guarantees.
    #[default]
    Stable,
    /// Postorder: each child set is emitted before the set's own direct elements.
    Compile,
    /// Topological order for link lines: a set's own elements come before its children.
    Link,
    /// Plain preorder: direct elements, then children left to right.
    NaiveLink,
}

struct Node<T> {
    direct: Vec<T>,
    transitive: Vec<NestedSet<T>>,
    fingerprint: u64,
}

/// An immutable tree of elements with shared children.
pub struct NestedSet<T> {
    order: Order,
    node: Option<Arc<Node<T>>>,
}

impl<T> Clone for NestedSet<T> {
    fn clone(&self) -> Self {
        Self {
            order: self.order,
            node: self.node.clone(),
        }
    }
}

fn fingerprint_hasher() -> ahash::RandomState {
    ahash::RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    )
}

impl<T: Hash + Eq + Clone> NestedSet<T> {
    /// The empty set.
    pub fn empty(order: Order) -> Self {
        Self { order, node: None }
    }

    /// Start building a set with the given order.
    pub fn builder(order: Order) -> NestedSetBuilder<T> {
        NestedSetBuilder::new(order)
    }

    /// A set of exactly one element.
    pub fn singleton(order: Order, element: T) -> Self {
        NestedSetBuilder::new(order).add(element).build()
    }

    /// The iteration order.
    pub fn order(&self) -> Order {
        self.order
    }

    /// Returns true if the set has no elements at any depth.
    pub fn is_empty(&self) -> bool {
        // Builders drop empty children, so a present node always holds something.
        self.node.is_none()
    }

    /// Elements added directly to this set, without children.
    pub fn direct_elements(&self) -> &[T] {
        self.node.as_ref().map_or(&[], |n| n.direct.as_slice())
    }

    /// Child sets, in insertion order.
    pub fn transitive_sets(&self) -> &[NestedSet<T>] {
        self.node.as_ref().map_or(&[], |n| n.transitive.as_slice())
    }

    /// Order-independent fingerprint of the set's contents.
    pub fn fingerprint(&self) -> u64 {
        self.node.as_ref().map_or(0, |n| n.fingerprint)
    }

    /// Returns true if both sets share the same underlying storage.
    pub fn shallow_eq(&self, other: &Self) -> bool {
        match (&self.node, &other.node) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Flatten into a list following the set's [`Order`], dropping duplicates.
    pub fn to_list(&self) -> Vec<T> {
        let Some(node) = &self.node else {
            return Vec::new();
        };
        let mut seen_nodes = AHashSet::new();
        let mut seen = AHashSet::new();
        let mut out = Vec::new();
        match self.order {
            Order::Stable | Order::Compile => {
                walk_postorder(node, &mut seen_nodes, &mut seen, &mut out)
            }
            Order::NaiveLink => walk_preorder(node, &mut seen_nodes, &mut seen, &mut out),
            Order::Link => {
                walk_reverse_postorder(node, &mut seen_nodes, &mut seen, &mut out);
                out.reverse();
            }
        }
        out
    }

    /// Number of distinct elements.
    pub fn len(&self) -> usize {
        self.to_list().len()
    }

    /// Iterate over the flattened elements.
    pub fn iter(&self) -> std::vec::IntoIter<T> {
        self.to_list().into_iter()
    }
}

fn node_id<T>(node: &Arc<Node<T>>) -> usize {
    Arc::as_ptr(node) as usize
}

fn walk_postorder<T: Hash + Eq + Clone>(
    node: &Arc<Node<T>>,
    seen_nodes: &mut AHashSet<usize>,
    seen: &mut AHashSet<T>,
    out: &mut Vec<T>,
) {
    if !seen_nodes.insert(node_id(node)) {
        return;
    }
    for child in node.transitive.iter().filter_map(|c| c.node.as_ref()) {
        walk_postorder(child, seen_nodes, seen, out);
    }
    for element in &node.direct {
        if seen.insert(element.clone()) {
            out.push(element.clone());
        }
    }
}

fn walk_preorder<T: Hash + Eq + Clone>(
    node: &Arc<Node<T>>,
    seen_nodes: &mut AHashSet<usize>,
    seen: &mut AHashSet<T>,
    out: &mut Vec<T>,
) {
    if !seen_nodes.insert(node_id(node)) {
        return;
    }
    for element in &node.direct {
        if seen.insert(element.clone()) {
            out.push(element.clone());
        }
    }
    for child in node.transitive.iter().filter_map(|c| c.node.as_ref()) {
        walk_preorder(child, seen_nodes, seen, out);
    }
}

// Right-to-left postorder; reversing the result yields the link order.
fn walk_reverse_postorder<T: Hash + Eq + Clone>(
    node: &Arc<Node<T>>,
    seen_nodes: &mut AHashSet<usize>,
    seen: &mut AHashSet<T>,
    out: &mut Vec<T>,
) {
    if !seen_nodes.insert(node_id(node)) {
        return;
    }
    for child in node.transitive.iter().rev().filter_map(|c| c.node.as_ref()) {
        walk_reverse_postorder(child, seen_nodes, seen, out);
    }
    for element in node.direct.iter().rev() {
        if seen.insert(element.clone()) {
            out.push(element.clone());
        }
    }
}

impl<T: Hash + Eq + Clone> PartialEq for NestedSet<T> {
    fn eq(&self, other: &Self) -> bool {
        if self.order != other.order {
            return false;
        }
        let (a, b) = match (&self.node, &other.node) {
            (None, None) => return true,
            (Some(a), Some(b)) => (a, b),
            _ => return false,
        };
        if Arc::ptr_eq(a, b) {
            return true;
        }
        if a.fingerprint != b.fingerprint
            || a.direct.len() != b.direct.len()
            || a.transitive.len() != b.transitive.len()
        {
            return false;
        }
        let direct: AHashSet<&T> = a.direct.iter().collect();
        if !b.direct.iter().all(|e| direct.contains(e)) {
            return false;
        }
        // Children are matched as a multiset; the fingerprint filters most candidates.
        let mut unmatched: Vec<&NestedSet<T>> = b.transitive.iter().collect();
        for child in &a.transitive {
            let Some(pos) = unmatched
                .iter()
                .position(|c| c.fingerprint() == child.fingerprint() && *c == child)
            else {
                return false;
            };
            unmatched.swap_remove(pos);
        }
        true
    }
}

impl<T: Hash + Eq + Clone> Eq for NestedSet<T> {}

impl<T: Hash + Eq + Clone> Hash for NestedSet<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.order.hash(state);
        self.fingerprint().hash(state);
    }
}

impl<T: Hash + Eq + Clone + fmt::Debug> fmt::Debug for NestedSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.to_list()).finish()
    }
}

/// Builder for [`NestedSet`].
pub struct NestedSetBuilder<T> {
    order: Order,
    direct: Vec<T>,
    transitive: Vec<NestedSet<T>>,
}

impl<T: Hash + Eq + Clone> NestedSetBuilder<T> {
    /// A new builder with the given order.
    pub fn new(order: Order) -> Self {
        Self {
            order,
            direct: Vec::new(),
            transitive: Vec::new(),
        }
    }

    /// A builder with [`Order::Stable`].
    pub fn stable_order() -> Self {
        Self::new(Order::Stable)
    }

    /// Add a direct element. Duplicates of an earlier direct element are ignored.
    pub fn add(mut self, element: T) -> Self {
        if !self.direct.contains(&element) {
            self.direct.push(element);
        }
        self
    }

    /// Add every element of an iterator as a direct element.
    pub fn add_all(mut self, elements: impl IntoIterator<Item = T>) -> Self {
        for element in elements {
            self = self.add(element);
        }
        self
    }

    /// Add a child set by reference. Empty sets are skipped.
    pub fn add_transitive(mut self, set: NestedSet<T>) -> Self {
        if !set.is_empty() && !self.transitive.iter().any(|s| s.shallow_eq(&set)) {
            self.transitive.push(set);
        }
        self
    }

    /// Finish the set.
    ///
    /// A builder holding exactly one child and no direct elements returns that child,
    /// so wrapping never adds a level.
    pub fn build(mut self) -> NestedSet<T> {
        if self.direct.is_empty() && self.transitive.is_empty() {
            return NestedSet::empty(self.order);
        }
        if self.direct.is_empty() && self.transitive.len() == 1 {
            if let Some(only) = self.transitive.pop() {
                if only.order == self.order {
                    return only;
                }
                self.transitive.push(only);
            }
        }
        let hasher = fingerprint_hasher();
        let mut fingerprint = self.direct.len() as u64;
        for element in &self.direct {
            fingerprint = fingerprint.wrapping_add(mix(hasher.hash_one(element)));
        }
        for child in &self.transitive {
            fingerprint = fingerprint.wrapping_add(mix(child.fingerprint() ^ 0x9e37_79b9_7f4a_7c15));
        }
        NestedSet {
            order: self.order,
            node: Some(Arc::new(Node {
                direct: self.direct,
                transitive: self.transitive,
                fingerprint,
            })),
        }
    }
}

// Finalizer from splitmix64, so summing fingerprints does not cancel structure.
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(order: Order, direct: &[&'static str], children: &[NestedSet<&'static str>]) -> NestedSet<&'static str> {
        let mut builder = NestedSetBuilder::new(order).add_all(direct.iter().copied());
        for child in children {
            builder = builder.add_transitive(child.clone());
        }
        builder.build()
    }

    #[test]
    fn test_stable_is_children_first() {
        let child = set(Order::Stable, &["b", "d"], &[]);
        let parent = set(Order::Stable, &["a", "c"], &[child]);
        assert_eq!(parent.to_list(), vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_link_order_diamond() {
        let d = set(Order::Link, &["d"], &[]);
        let b = set(Order::Link, &["b"], &[d.clone()]);
        let c = set(Order::Link, &["c"], &[d]);
        let a = set(Order::Link, &["a"], &[b, c]);
        assert_eq!(a.to_list(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_naive_link_preorder() {
        let child = set(Order::NaiveLink, &["b", "d"], &[]);
        let parent = set(Order::NaiveLink, &["a", "c"], &[child]);
        assert_eq!(parent.to_list(), vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn test_equality_ignores_iteration_order() {
        let x = set(Order::Stable, &["x"], &[]);
        let y = set(Order::Stable, &["y"], &[]);
        let left = set(Order::Stable, &["a", "b"], &[x.clone(), y.clone()]);
        let right = set(Order::Stable, &["b", "a"], &[y, x]);
        assert_eq!(left, right);
        assert_ne!(left, set(Order::Stable, &["a"], &[]));
    }

    #[test]
    fn test_rebuilt_children_compare_equal() {
        let first = set(Order::Stable, &["root"], &[set(Order::Stable, &["leaf"], &[])]);
        let second = set(Order::Stable, &["root"], &[set(Order::Stable, &["leaf"], &[])]);
        assert!(!first.shallow_eq(&second));
        assert_eq!(first, second);
    }

    #[test]
    fn test_single_child_is_reused() {
        let child = set(Order::Stable, &["a"], &[]);
        let wrapped = NestedSetBuilder::stable_order()
            .add_transitive(child.clone())
            .add_transitive(NestedSet::empty(Order::Stable))
            .build();
        assert!(wrapped.shallow_eq(&child));
    }

    #[test]
    fn test_shared_subtrees_deduplicated() {
        let shared = set(Order::Stable, &["s"], &[]);
        let a = set(Order::Stable, &["a"], &[shared.clone()]);
        let b = set(Order::Stable, &["b", "s"], &[shared]);
        let top = set(Order::Stable, &[], &[a, b]);
        assert_eq!(top.to_list(), vec!["s", "a", "b"]);
        assert_eq!(top.len(), 3);
    }
}
