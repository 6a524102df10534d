//! Lifetime-tied linear tokens and counting traits.
//!
//! Tokens are zero-sized proofs that a unit was acquired from a
//! particular counter instance. Dropping a token panics; the only valid
//! way to dispose of it is to return it to the originating counter via
//! `Count::put`.
//!
//! Every live `Ref` carries exactly one token minted by the refcount of
//! its slot. That token is the handle's liveness vote.

use core::marker::PhantomData;
use core::sync::atomic::{fence, AtomicUsize, Ordering};

/// Upper bound on outstanding votes for a single slot. Crossing it aborts,
/// like `Arc` does, instead of wrapping into a false "last reference".
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// Zero-sized, linear token tied to its originating counter via lifetime.
pub struct Token<'a, C: ?Sized> {
    // Lifetime is tracked separately from the counter type to avoid
    // imposing `'a` bounds on `C` (useful for generic counters).
    _lt: PhantomData<&'a ()>,
    // `fn(&C)` keeps the token `Send + Sync` so votes can cross threads.
    _ctr: PhantomData<fn(&C)>,
}

impl<'a, C: ?Sized> Token<'a, C> {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            _lt: PhantomData,
            _ctr: PhantomData,
        }
    }
}

impl<'a, C: ?Sized> Drop for Token<'a, C> {
    fn drop(&mut self) {
        // Intentional fail-fast on misuse: token must be consumed by Count::put.
        panic!("Token dropped without Count::put");
    }
}

/// A source of counted references, enforced by linear Token flow.
pub trait Count {
    /// The token type minted by this counter.
    type Token<'a>: Sized
    where
        Self: 'a;

    /// Acquire one counted reference and return a linear token for it.
    ///
    /// We mint tokens with a 'static lifetime parameter. The token itself is
    /// still branded to this counter via its type parameter, and can be
    /// covariantly shortened when returning it via `put`.
    fn get(&self) -> Self::Token<'static>;

    /// Return (consume) a previously acquired token.
    /// Returns true if the count is now zero.
    fn put<'a>(&'a self, t: Self::Token<'a>) -> bool;
}

/// Thread-safe reference counter for one pool slot.
///
/// Increments happen under the pool's shared storage lock after the slot
/// has been checked for occupancy; decrements may race freely with each
/// other. A `put` that reports zero only *suggests* reclamation: the
/// caller must re-check under the exclusive lock, since another thread
/// may have voted again in between.
#[derive(Debug, Default)]
pub struct AtomicCount {
    count: AtomicUsize,
}

impl AtomicCount {
    pub const fn new(initial: usize) -> Self {
        Self {
            count: AtomicUsize::new(initial),
        }
    }

    /// Current number of outstanding votes.
    #[inline]
    pub fn load(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Zero the counter when its slot is handed to a new entry.
    #[inline]
    pub(crate) fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }
}

impl Count for AtomicCount {
    type Token<'a>
        = Token<'a, Self>
    where
        Self: 'a;

    #[inline]
    fn get(&self) -> Self::Token<'static> {
        let old = self.count.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            std::process::abort();
        }
        Token::<'static, Self>::new()
    }

    #[inline]
    fn put<'a>(&'a self, t: Self::Token<'a>) -> bool {
        let old = self.count.fetch_sub(1, Ordering::Release);
        debug_assert!(old > 0, "AtomicCount underflow");
        core::mem::forget(t);
        if old == 1 {
            // Pair with the Release decrements of every other voter before
            // the caller goes on to reclaim the slot.
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn get_put_tracks_count() {
        let c = AtomicCount::new(0);
        let t1 = c.get();
        let t2 = c.get();
        assert_eq!(c.load(), 2);
        assert!(!c.put(t1));
        assert_eq!(c.load(), 1);
        assert!(c.put(t2), "last put must report zero");
        assert_eq!(c.load(), 0);
    }

    #[test]
    fn reset_zeroes_counter() {
        let c = AtomicCount::new(7);
        c.reset();
        assert_eq!(c.load(), 0);
    }

    #[test]
    fn dropping_token_panics() {
        let c = AtomicCount::new(0);
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let t = c.get();
            drop(t);
        }));
        assert!(res.is_err(), "dropping a token must panic");
    }

    /// Exactly one of many concurrent `put`s observes the transition to zero.
    #[test]
    fn concurrent_puts_report_zero_once() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1_000;

        let c = Arc::new(AtomicCount::new(0));
        let mut tokens = Vec::with_capacity(THREADS);
        for _ in 0..THREADS {
            let batch: Vec<_> = (0..PER_THREAD).map(|_| c.get()).collect();
            tokens.push(batch);
        }
        assert_eq!(c.load(), THREADS * PER_THREAD);

        let zeros: usize = thread::scope(|s| {
            let handles: Vec<_> = tokens
                .into_iter()
                .map(|batch| {
                    let c = Arc::clone(&c);
                    s.spawn(move || {
                        let mut zeros = 0;
                        for t in batch {
                            if c.put(t) {
                                zeros += 1;
                            }
                        }
                        zeros
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(zeros, 1);
        assert_eq!(c.load(), 0);
    }
}
