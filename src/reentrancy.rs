//! Debug-only reentrancy guard.
//!
//! Detects a thread re-entering the same pool while it is already inside
//! one of the pool's operations, for example from `K: Eq`, a key hasher,
//! or a value factory running under the pool's locks. The pool's locks
//! are not reentrant, so such a call would otherwise deadlock. In debug
//! builds it panics instead; in release builds this compiles to a
//! zero-cost no-op.

use core::marker::PhantomData;

#[cfg(debug_assertions)]
use core::sync::atomic::{AtomicUsize, Ordering};
#[cfg(debug_assertions)]
use std::cell::RefCell;

#[cfg(debug_assertions)]
static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

#[cfg(debug_assertions)]
thread_local! {
    /// Ids of the trackers this thread is currently inside.
    static INSIDE: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Per-instance reentrancy tracker. Embed this in structs to guard public
/// entry-points with `let _g = self.reentrancy.enter();`.
#[derive(Debug)]
pub struct DebugReentrancy {
    #[cfg(debug_assertions)]
    id: usize,
}

impl DebugReentrancy {
    pub fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Enter a guarded section. In debug builds, panics if the current
    /// thread is already inside this tracker.
    #[inline]
    pub fn enter(&self) -> ReentrancyGuard<'_> {
        #[cfg(debug_assertions)]
        {
            INSIDE.with(|inside| {
                let mut inside = inside.borrow_mut();
                assert!(
                    !inside.contains(&self.id),
                    "reentrancy detected: nested entry into pool from the same thread"
                );
                inside.push(self.id);
            });
            return ReentrancyGuard {
                owner: self,
                _nosend: PhantomData,
            };
        }

        #[cfg(not(debug_assertions))]
        {
            return ReentrancyGuard {
                _z: PhantomData,
                _nosend: PhantomData,
            };
        }
    }
}

impl Default for DebugReentrancy {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by `DebugReentrancy::enter`. Bound to the entering
/// thread.
pub struct ReentrancyGuard<'a> {
    #[cfg(debug_assertions)]
    owner: &'a DebugReentrancy,
    #[cfg(not(debug_assertions))]
    _z: PhantomData<&'a ()>,
    _nosend: PhantomData<*mut ()>,
}

impl<'a> Drop for ReentrancyGuard<'a> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let id = self.owner.id;
            INSIDE.with(|inside| {
                let mut inside = inside.borrow_mut();
                let pos = inside.iter().rposition(|&i| i == id);
                debug_assert!(pos.is_some());
                if let Some(pos) = pos {
                    inside.remove(pos);
                }
            });
        }
    }
}
