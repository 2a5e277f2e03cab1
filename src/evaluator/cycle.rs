//! Finding the cycles that keep roots from finishing.
//!
//! When no key is ready but roots remain unfinished, every unfinished key is waiting on
//! another unfinished key. Following "registered but not done" edges from a root must
//! then run into a cycle.

use ahash::AHashSet;

use crate::error::CycleInfo;
use crate::graph::InMemoryGraph;
use crate::key::NodeKey;

/// Search from `root` for a cycle among unfinished keys.
///
/// Iterative DFS, so deep dependency chains cannot overflow the stack. Returns the first
/// cycle found with the path leading into it.
pub(crate) fn find_cycle(graph: &InMemoryGraph, root: &NodeKey) -> Option<CycleInfo> {
    let mut visited: AHashSet<NodeKey> = AHashSet::new();
    let mut on_stack: AHashSet<NodeKey> = AHashSet::new();
    let mut path: Vec<NodeKey> = Vec::new();
    let mut frames: Vec<(NodeKey, std::vec::IntoIter<NodeKey>)> = Vec::new();

    let pending = |key: &NodeKey| -> Vec<NodeKey> {
        let Some(entry) = graph.get(key) else {
            return Vec::new();
        };
        entry
            .registered_deps()
            .into_iter()
            .filter(|dep| graph.get(dep).is_some_and(|e| !e.is_done()))
            .collect()
    };

    visited.insert(root.clone());
    on_stack.insert(root.clone());
    path.push(root.clone());
    frames.push((root.clone(), pending(root).into_iter()));

    while let Some((_, children)) = frames.last_mut() {
        match children.next() {
            Some(child) => {
                if on_stack.contains(&child) {
                    let start = path.iter().position(|k| *k == child).unwrap_or(0);
                    return Some(CycleInfo::new(
                        path[..start].to_vec(),
                        path[start..].to_vec(),
                    ));
                }
                if visited.insert(child.clone()) {
                    on_stack.insert(child.clone());
                    path.push(child.clone());
                    let next = pending(&child).into_iter();
                    frames.push((child, next));
                }
            }
            None => {
                if let Some((key, _)) = frames.pop() {
                    on_stack.remove(&key);
                    path.pop();
                }
            }
        }
    }
    None
}
