//! Slots: contiguous entry storage with its parallel bookkeeping tables.
//!
//! Three vectors share one index space: the entries themselves, one
//! atomic refcount per entry, and the occupation table. A slot is
//! occupied iff its occupation cell holds a keepalive `A`; the pool uses
//! that value to keep its shared core alive while the slot is live.
//!
//! Freed slots keep their contents. The next entry to claim a slot
//! overwrites it and the stale entry is handed back to the caller, which
//! drops it once no lock is held.

use crate::tokens::{AtomicCount, Count, Token};
use tracing::debug;

/// One stored entry. `hash` is the digest the index files it under.
#[derive(Debug)]
pub(crate) struct Slot<K, V> {
    pub(crate) key: K,
    pub(crate) value: V,
    pub(crate) hash: u64,
}

#[derive(Debug)]
pub(crate) struct Slots<K, V, A> {
    entries: Vec<Slot<K, V>>,
    counts: Vec<AtomicCount>,
    occupied: Vec<Option<A>>,
    /// Lowest free index, if any slot is free.
    first_free: Option<usize>,
}

/// Result of a shrink that actually released capacity.
pub(crate) struct Shrunk<K, V> {
    pub(crate) before: usize,
    pub(crate) after: usize,
    /// Free entries cut off the end; drop them outside the locks.
    pub(crate) stale: Vec<Slot<K, V>>,
}

impl<K, V, A> Slots<K, V, A> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            counts: Vec::with_capacity(capacity),
            occupied: Vec::with_capacity(capacity),
            first_free: None,
        }
    }

    /// Number of slots ever created and not shrunk away.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    #[cfg(test)]
    pub(crate) fn first_free(&self) -> Option<usize> {
        self.first_free
    }

    #[inline]
    pub(crate) fn is_occupied(&self, i: usize) -> bool {
        matches!(self.occupied.get(i), Some(Some(_)))
    }

    /// The entry at `i`. Callers only pass indices taken from the index or
    /// from a live handle, both of which point inside the table.
    #[inline]
    pub(crate) fn entry(&self, i: usize) -> &Slot<K, V> {
        &self.entries[i]
    }

    #[inline]
    pub(crate) fn key(&self, i: usize) -> &K {
        &self.entries[i].key
    }

    /// Keepalive held by `i`, if occupied.
    #[inline]
    pub(crate) fn keepalive(&self, i: usize) -> Option<&A> {
        self.occupied.get(i)?.as_ref()
    }

    /// Outstanding votes on `i`; zero for slots past the end.
    #[inline]
    pub(crate) fn count(&self, i: usize) -> usize {
        self.counts.get(i).map_or(0, AtomicCount::load)
    }

    /// Cast one vote on `i` if it is occupied.
    #[inline]
    pub(crate) fn add_ref(&self, i: usize) -> Option<Token<'static, AtomicCount>> {
        if !self.is_occupied(i) {
            return None;
        }
        Some(self.counts[i].get())
    }

    /// Return one vote on `i`. True when it was the last one.
    #[inline]
    pub(crate) fn put(&self, i: usize, vote: Token<'static, AtomicCount>) -> bool {
        self.counts[i].put(vote)
    }

    /// Store a new entry, preferring the lowest free slot over growth.
    ///
    /// Returns the slot index and, on reuse, the stale entry it replaced.
    /// The slot comes back occupied with a zero refcount.
    pub(crate) fn occupy(&mut self, entry: Slot<K, V>, keepalive: A) -> (usize, Option<Slot<K, V>>) {
        match self.first_free {
            Some(i) => {
                let stale = std::mem::replace(&mut self.entries[i], entry);
                self.counts[i].reset();
                debug_assert!(self.occupied[i].is_none(), "free hint points at a live slot");
                self.occupied[i] = Some(keepalive);
                self.advance_first_free(i + 1);
                (i, Some(stale))
            }
            None => {
                let i = self.entries.len();
                if i == self.entries.capacity() {
                    debug!(capacity = i, "slot storage full, growing");
                }
                self.entries.push(entry);
                self.counts.push(AtomicCount::new(0));
                self.occupied.push(Some(keepalive));
                (i, None)
            }
        }
    }

    /// Mark `i` free and hand back its keepalive. Contents stay in place.
    pub(crate) fn vacate(&mut self, i: usize) -> Option<A> {
        let keepalive = self.occupied.get_mut(i)?.take()?;
        if self.first_free.map_or(true, |f| i < f) {
            self.first_free = Some(i);
        }
        Some(keepalive)
    }

    fn advance_first_free(&mut self, from: usize) {
        self.first_free = self
            .occupied
            .iter()
            .skip(from)
            .position(Option::is_none)
            .map(|p| p + from);
    }

    /// Cut capacity down to the smallest power of two covering the last
    /// occupied slot, never below `min`. Returns `None` when capacity is
    /// already within that bound.
    pub(crate) fn shrink(&mut self, min: usize) -> Option<Shrunk<K, V>> {
        let need = self
            .occupied
            .iter()
            .rposition(Option::is_some)
            .map_or(1, |last| last + 1);
        let target = need.next_power_of_two().max(min);
        let before = self.entries.capacity();
        if before <= target {
            return None;
        }

        // Everything past the last occupied slot is free.
        let keep = self.len().min(target);
        let stale = self.entries.split_off(keep);
        self.counts.truncate(keep);
        self.occupied.truncate(keep);

        self.entries.shrink_to(target);
        self.counts.shrink_to(target);
        self.occupied.shrink_to(target);

        if self.first_free.is_some_and(|f| f >= keep) {
            self.first_free = None;
        }

        Some(Shrunk {
            before,
            after: self.entries.capacity(),
            stale,
        })
    }
}
