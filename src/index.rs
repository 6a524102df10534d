//! HashIndex: hash-ordered `(hash, index)` set used to find slots by key.
//!
//! Entries are ordered by full hash first, then by slot index, so every
//! slot whose key shares a digest sits in one contiguous run starting at
//! `lower_bound(hash)`. Lookup lands on that run and resolves collisions
//! by comparing real keys through a caller-supplied predicate; the index
//! itself never sees keys and holds no locks.
//!
//! B-tree nodes are released as entries are removed, so the index has no
//! slack capacity to hand back when the pool shrinks.

use std::collections::btree_set::{self, BTreeSet};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct IndexKey {
    hash: u64,
    index: usize,
}

#[derive(Debug, Default)]
pub(crate) struct HashIndex {
    entries: BTreeSet<IndexKey>,
}

impl HashIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// All entries with a digest `>= hash`, in order.
    fn lower_bound(&self, hash: u64) -> btree_set::Range<'_, IndexKey> {
        self.entries.range(IndexKey { hash, index: 0 }..)
    }

    /// First slot in the `hash` run for which `matches` holds.
    pub(crate) fn locate<F>(&self, hash: u64, mut matches: F) -> Option<usize>
    where
        F: FnMut(usize) -> bool,
    {
        self.lower_bound(hash)
            .take_while(|e| e.hash == hash)
            .map(|e| e.index)
            .find(|&i| matches(i))
    }

    /// Returns false if the pair was already present.
    pub(crate) fn insert(&mut self, hash: u64, index: usize) -> bool {
        self.entries.insert(IndexKey { hash, index })
    }

    /// Returns false if the pair was not present.
    pub(crate) fn remove(&mut self, hash: u64, index: usize) -> bool {
        self.entries.remove(&IndexKey { hash, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_scans_only_equal_hash_run() {
        let mut ix = HashIndex::new();
        ix.insert(10, 0);
        ix.insert(20, 1);
        ix.insert(20, 2);
        ix.insert(30, 3);

        let mut visited = Vec::new();
        let found = ix.locate(20, |i| {
            visited.push(i);
            false
        });
        assert_eq!(found, None);
        assert_eq!(visited, vec![1, 2], "only the hash-20 run is scanned, in index order");

        assert_eq!(ix.locate(20, |i| i == 2), Some(2));
        assert_eq!(ix.locate(15, |_| true), None);
        assert_eq!(ix.locate(30, |_| true), Some(3));
    }

    #[test]
    fn collisions_resolve_by_predicate() {
        let mut ix = HashIndex::new();
        for i in 0..8 {
            ix.insert(0, i);
        }
        for i in 0..8 {
            assert_eq!(ix.locate(0, |j| j == i), Some(i));
        }
    }

    #[test]
    fn insert_remove_and_len() {
        let mut ix = HashIndex::new();
        assert_eq!(ix.len(), 0);
        assert!(ix.insert(7, 3));
        assert!(!ix.insert(7, 3), "duplicate pair rejected");
        assert_eq!(ix.len(), 1);

        assert!(!ix.remove(7, 4));
        assert!(ix.remove(7, 3));
        assert_eq!(ix.len(), 0);
        assert_eq!(ix.locate(7, |_| true), None);
    }

    #[test]
    fn extreme_hashes_are_ordered() {
        let mut ix = HashIndex::new();
        ix.insert(u64::MAX, 1);
        ix.insert(0, 0);
        assert_eq!(ix.locate(u64::MAX, |_| true), Some(1));
        assert_eq!(ix.locate(0, |_| true), Some(0));
    }
}
