//! flat-pool: a concurrent, key-addressed interning pool. Entries live in
//! contiguous, reusable slots and are reached through reference-counted
//! `Ref` handles; the last handle to go frees its slot for the next key.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: deduplicate expensive values by key across threads while
//!   keeping storage dense and cheap to scan.
//! - Layers:
//!   - Slots<K, V, A>: three parallel vectors (entries, atomic refcounts,
//!     occupation cells) plus a lowest-free-slot hint. Freed slots keep
//!     their contents until overwritten.
//!   - HashIndex: a hash-ordered `(hash, index)` set; lookups land on the
//!     run of equal digests and compare real keys.
//!   - FlatPool<K, V, S>: the public pool, guarding both tables with
//!     `parking_lot` read/write locks and handing out `Ref` handles.
//!
//! Constraints
//! - Shared across threads: `FlatPool` and `Ref` are `Send + Sync` when
//!   `K`, `V` and `S` are.
//! - At most one live slot per distinct key; the value factory runs at
//!   most once per insertion and only on the inserting thread.
//! - A slot is occupied iff its refcount is above zero, outside of the
//!   brief windows in which the pool holds its exclusive locks and of
//!   reclamation deferred behind a reallocation guard.
//! - Storage only grows on demand. Shrinking happens solely through
//!   `FlatPool::resize_pool`.
//!
//! Concurrency
//! - Locks are always taken index first, then storage.
//! - Lookups that hit run under shared locks only. Inserting a new key
//!   takes both exclusive locks, revalidates, builds the value, and casts
//!   the caller's vote before unlocking.
//! - Dropping a handle decrements under a shared lock; only the last
//!   handle takes the exclusive locks to reclaim, after re-checking that
//!   nobody voted again in between.
//! - Stale entries (overwritten or cut off by a resize) are dropped after
//!   every lock is released, so their `Drop` may use the pool.
//!
//! Reallocation guard
//! - Storage may move when it grows or shrinks, so entries are only read
//!   through a `ReallocGuard`, a shared hold on the storage lock.
//! - A guard does not stop reference counts from changing. Cloning and
//!   dropping handles stays allowed on the guarding thread; when that
//!   thread drops the last handle of a slot, reclamation is queued and
//!   runs once its last guard on the pool is released.
//! - Inserting, looking up, measuring or resizing the pool would wait on
//!   the guard itself, so each panics on a thread that holds one.
//!
//! Reentrancy policy
//! - User code that runs under the pool's locks (`K: Eq`, the key hasher
//!   strategy, value factories) must not call back into the same pool.
//!   Debug builds detect this with a per-pool reentrancy tracker and
//!   panic; release builds would deadlock.
//!
//! Lifetime
//! - Every occupied slot pins the pool's shared core, so handles stay
//!   valid after the `FlatPool` value itself is dropped. The core, and
//!   every stale entry still in storage, goes away with the last handle.
//!
//! Overflow semantics
//! - Exceeding `isize::MAX` handles to one entry aborts the process,
//!   matching `Arc`.

mod error;
pub mod factory;
mod flat_pool;
pub mod hash;
mod index;
mod reentrancy;
mod slots;
pub mod tokens;

// Public surface
pub use error::RefError;
pub use factory::{Args, Boxed, Fallible, Shared, ValueFactory};
pub use flat_pool::{
    EntryGuard, FlatPool, Occupancy, PoolConfig, ReallocGuard, Ref, ResourcePool,
    ResourcePoolSet, MIN_RESERVED_SIZE,
};
pub use hash::{ByMethod, DefaultHashBuilder, HashFn, KeyHasher, PoolHash};
