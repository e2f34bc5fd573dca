//! Merkle walk over the stored part of a tree.
//!
//! The walk reads edges straight from encoded bytes, so it needs neither
//! the registry nor decoded objects, and it is iterative so tree depth is
//! not bounded by the stack.

use std::collections::{HashSet, VecDeque};
use std::sync::RwLock;

use cxo_registry::codec::references;
use cxo_store::Cxds;
use cxo_types::Hash;

use crate::error::ObjectResult;

/// Outcome of a walk from one top hash.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Walk {
    /// Reachable hashes that are not stored, in breadth-first order.
    pub missing: Vec<Hash>,
    /// Reachable hashes that are stored and were visited.
    pub present: Vec<Hash>,
    /// Subtrees skipped because they were already known to be complete.
    pub skipped: usize,
}

impl Walk {
    pub fn is_full(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Walk everything reachable from `top`.
///
/// Every present node has its edges checked, even when its parent was
/// present too. Only hashes in `known_full` (subtrees found complete by an
/// earlier walk) are not descended into.
pub fn walk(store: &dyn Cxds, known_full: &RwLock<HashSet<Hash>>, top: Hash) -> ObjectResult<Walk> {
    let mut result = Walk::default();
    if top.is_blank() {
        return Ok(result);
    }

    let mut seen: HashSet<Hash> = HashSet::new();
    let mut queue: VecDeque<Hash> = VecDeque::new();
    seen.insert(top);
    queue.push_back(top);

    while let Some(current) = queue.pop_front() {
        if known_full.read().expect("lock poisoned").contains(&current) {
            result.skipped += 1;
            continue;
        }
        let Some((bytes, _)) = store.get(&current)? else {
            result.missing.push(current);
            continue;
        };
        result.present.push(current);
        for child in references(&bytes) {
            if !child.is_blank() && seen.insert(child) {
                queue.push_back(child);
            }
        }
    }

    Ok(result)
}

/// Hashes reachable from `top` that are not stored.
pub fn missing(store: &dyn Cxds, known_full: &RwLock<HashSet<Hash>>, top: Hash) -> ObjectResult<Vec<Hash>> {
    walk(store, known_full, top).map(|w| w.missing)
}

#[cfg(test)]
mod tests {
    use cxo_registry::codec::encode_values;
    use cxo_registry::{Ref, Value};
    use cxo_store::MemoryCxds;

    use super::*;

    fn put(store: &MemoryCxds, children: &[Hash], tag: &str) -> Hash {
        let mut values = vec![Value::from(tag)];
        values.extend(children.iter().map(|h| Value::Ref(Ref::from_hash(*h))));
        store.add(&encode_values(&values).unwrap()).unwrap().0
    }

    #[test]
    fn complete_tree_has_nothing_missing() {
        let store = MemoryCxds::new();
        let a = put(&store, &[], "a");
        let b = put(&store, &[a], "b");
        let top = put(&store, &[a, b], "top");

        let w = walk(&store, &RwLock::default(), top).unwrap();
        assert!(w.is_full());
        assert_eq!(w.present, vec![top, a, b]);
    }

    #[test]
    fn absent_nodes_are_reported_once() {
        let store = MemoryCxds::new();
        let ghost = Hash::sum(b"ghost");
        let b = put(&store, &[ghost], "b");
        let top = put(&store, &[ghost, b], "top");

        assert_eq!(missing(&store, &RwLock::default(), top).unwrap(), vec![ghost]);
    }

    #[test]
    fn absent_top_is_missing() {
        let store = MemoryCxds::new();
        let top = Hash::sum(b"top");
        assert_eq!(missing(&store, &RwLock::default(), top).unwrap(), vec![top]);
        assert!(missing(&store, &RwLock::default(), Hash::blank()).unwrap().is_empty());
    }

    #[test]
    fn present_children_of_present_parents_are_still_checked() {
        let store = MemoryCxds::new();
        let ghost = Hash::sum(b"ghost");
        let mid = put(&store, &[ghost], "mid");
        let top = put(&store, &[mid], "top");
        assert_eq!(missing(&store, &RwLock::default(), top).unwrap(), vec![ghost]);
    }

    #[test]
    fn known_full_subtrees_are_skipped() {
        let store = MemoryCxds::new();
        let a = put(&store, &[], "a");
        let b = put(&store, &[a], "b");
        let top = put(&store, &[b], "top");
        let cache = RwLock::new(HashSet::from([b]));

        let w = walk(&store, &cache, top).unwrap();
        assert_eq!(w.present, vec![top]);
        assert_eq!(w.skipped, 1);
    }
}
