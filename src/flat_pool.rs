//! FlatPool: concurrent interning pool over contiguous, reusable slots.

use crate::error::RefError;
use crate::factory::ValueFactory;
use crate::hash::{DefaultHashBuilder, KeyHasher};
use crate::index::HashIndex;
use crate::reentrancy::DebugReentrancy;
use crate::slots::{Slot, Slots};
use crate::tokens::{AtomicCount, Token};
use core::borrow::Borrow;
use core::convert::Infallible;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::mem::ManuallyDrop;
use core::ops::Deref;
use core::ptr::NonNull;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::cell::RefCell;
use std::sync::Arc;
use tracing::{debug, trace};

/// Slots reserved by default, and the floor for `resize_pool`.
pub const MIN_RESERVED_SIZE: usize = 16;

/// Construction-time settings for a [`FlatPool`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PoolConfig {
    /// Slots to reserve up front; raised to [`MIN_RESERVED_SIZE`] if lower.
    pub reserve: usize,
}

impl PoolConfig {
    /// Settings reserving `reserve` slots.
    pub const fn with_reserve(reserve: usize) -> Self {
        Self { reserve }
    }

    fn effective_reserve(&self) -> usize {
        self.reserve.max(MIN_RESERVED_SIZE)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::with_reserve(MIN_RESERVED_SIZE)
    }
}

/// Snapshot of storage capacity against live entries.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Occupancy {
    pub capacity: usize,
    pub live: usize,
}

// Every occupied slot holds one of these, so the core outlives the
// `FlatPool` value for as long as any entry is live.
type Keepalive<K, V, S> = Arc<Core<K, V, S>>;
type Vote = Token<'static, AtomicCount>;
type SlotTable<K, V, S> = Slots<K, V, Keepalive<K, V, S>>;

struct Core<K, V, S> {
    hasher: S,
    // Lock order is always `index` then `slots`.
    index: RwLock<HashIndex>,
    slots: RwLock<SlotTable<K, V, S>>,
    // Slots whose last handle went away while the dropping thread held a
    // reallocation guard. Reclaimed by the next exclusive section.
    pending: Mutex<Vec<usize>>,
    reentrancy: DebugReentrancy,
}

thread_local! {
    /// Cores this thread holds a reallocation guard on, one entry per guard.
    static GUARDED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

fn holds_guard(core: usize) -> bool {
    GUARDED.with(|g| g.borrow().contains(&core))
}

fn hold_guard(core: usize) {
    GUARDED.with(|g| g.borrow_mut().push(core));
}

/// Forget one guard on `core`. True once the thread holds none.
fn unhold_guard(core: usize) -> bool {
    GUARDED.with(|g| {
        let mut g = g.borrow_mut();
        if let Some(pos) = g.iter().rposition(|&c| c == core) {
            g.swap_remove(pos);
        }
        !g.contains(&core)
    })
}

fn owner_ptr<K, V, S>(core: &Arc<Core<K, V, S>>) -> NonNull<Core<K, V, S>> {
    // SAFETY: `Arc::as_ptr` never returns null.
    unsafe { NonNull::new_unchecked(Arc::as_ptr(core).cast_mut()) }
}

impl<K, V, S> Core<K, V, S> {
    fn new(config: PoolConfig, hasher: S) -> Self {
        Self {
            hasher,
            index: RwLock::new(HashIndex::new()),
            slots: RwLock::new(Slots::with_capacity(config.effective_reserve())),
            pending: Mutex::new(Vec::new()),
            reentrancy: DebugReentrancy::new(),
        }
    }

    fn id(&self) -> usize {
        self as *const Self as usize
    }

    /// Index access and exclusive locking would wait on this thread's own
    /// reallocation guard; fail loudly instead of hanging.
    #[track_caller]
    fn assert_unguarded(&self) {
        assert!(
            !holds_guard(self.id()),
            "pool operation would block on a reallocation guard held by this thread"
        );
    }

    fn add_ref(&self, index: usize) -> Option<Vote> {
        let _g = self.reentrancy.enter();
        self.slots.read_recursive().add_ref(index)
    }

    /// Return `vote`. If it was the last one, reclaim the slot: mark it
    /// free and unlink it from the index, leaving its contents in place.
    ///
    /// If this thread holds a reallocation guard on the pool, the slot is
    /// queued instead and reclaimed when the last such guard drops.
    ///
    /// On the reclaiming path the returned `Arc` pins the core; the caller
    /// must drop it only after releasing every borrow of `self`.
    fn release_ref(&self, index: usize, vote: Vote) -> Option<Keepalive<K, V, S>> {
        let _g = self.reentrancy.enter();
        let pin = {
            let slots = self.slots.read_recursive();
            if !slots.put(index, vote) {
                return None;
            }
            // Our vote no longer keeps the slot, and with it the core, alive.
            slots.keepalive(index).cloned()
        };

        if holds_guard(self.id()) {
            self.pending.lock().push(index);
            trace!(index, "slot reclaim deferred to guard release");
            return pin;
        }

        let mut ix = self.index.write();
        let mut slots = self.slots.write();
        self.drain_pending(&mut ix, &mut slots);
        Self::reclaim(&mut ix, &mut slots, index);
        pin
    }

    /// Unlink `index` if it is occupied with no votes left. Another thread
    /// may have voted again, or reclaimed the slot and handed it to a new
    /// key, since the last decrement.
    ///
    /// Runs under both write locks. The dropped keepalive is never the
    /// last one: every caller is itself holding the core alive.
    fn reclaim(ix: &mut HashIndex, slots: &mut SlotTable<K, V, S>, index: usize) -> bool {
        if !slots.is_occupied(index) || slots.count(index) != 0 {
            return false;
        }
        let hash = slots.entry(index).hash;
        drop(slots.vacate(index));
        let unlinked = ix.remove(hash, index);
        debug_assert!(unlinked, "occupied slot missing from index");
        trace!(index, hash, "slot reclaimed");
        true
    }

    fn drain_pending(&self, ix: &mut HashIndex, slots: &mut SlotTable<K, V, S>) {
        let pending = core::mem::take(&mut *self.pending.lock());
        for index in pending {
            Self::reclaim(ix, slots, index);
        }
    }

    /// Reclaim whatever was deferred while guards were held.
    fn reclaim_pending(&self) {
        if self.pending.lock().is_empty() {
            return;
        }
        let _g = self.reentrancy.enter();
        let mut ix = self.index.write();
        let mut slots = self.slots.write();
        self.drain_pending(&mut ix, &mut slots);
    }

    fn guard(&self) -> ReallocGuard<'_, K, V, S> {
        // Only checks that we are not inside one of this pool's operations.
        let _ = self.reentrancy.enter();
        let slots = self.slots.read_recursive();
        hold_guard(self.id());
        ReallocGuard {
            core: self,
            slots: ManuallyDrop::new(slots),
        }
    }

    #[track_caller]
    fn len(&self) -> usize {
        self.assert_unguarded();
        let _g = self.reentrancy.enter();
        self.index.read().len()
    }

    #[track_caller]
    fn occupancy(&self) -> Occupancy {
        self.assert_unguarded();
        let _g = self.reentrancy.enter();
        let ix = self.index.read();
        let slots = self.slots.read_recursive();
        Occupancy {
            capacity: slots.capacity(),
            live: ix.len(),
        }
    }

    #[track_caller]
    fn resize_pool(&self) {
        self.assert_unguarded();
        let shrunk = {
            let _g = self.reentrancy.enter();
            let mut ix = self.index.write();
            let mut slots = self.slots.write();
            self.drain_pending(&mut ix, &mut slots);
            let shrunk = slots.shrink(MIN_RESERVED_SIZE);
            if let Some(s) = &shrunk {
                debug!(
                    before = s.before,
                    after = s.after,
                    live = ix.len(),
                    cut = s.stale.len(),
                    "slot storage shrunk"
                );
            }
            shrunk
        };
        // Stale entries cut off the end are dropped with no lock held.
        drop(shrunk);
    }
}

impl<K, V, S> Core<K, V, S>
where
    K: Eq,
{
    /// Two-phase acquisition: shared lookup, then exclusive revalidate and
    /// insert. The new handle's vote is cast before the exclusive locks
    /// are released, so no reclaimer can observe the fresh slot at zero.
    fn acquire<F>(this: &Arc<Self>, key: K, factory: F) -> Result<Ref<K, V, S>, F::Error>
    where
        S: KeyHasher<K>,
        F: ValueFactory<V>,
    {
        this.assert_unguarded();
        let owner = owner_ptr(this);
        let hash = this.hasher.hash_key(&key);
        let (index, vote, stale) = {
            let _g = this.reentrancy.enter();
            {
                let ix = this.index.read();
                let slots = this.slots.read_recursive();
                if let Some(i) = ix.locate(hash, |i| *slots.key(i) == key) {
                    return Ok(Ref::from_vote(owner, i, slots.add_ref(i)));
                }
            }

            let mut ix = this.index.write();
            let mut slots = this.slots.write();
            this.drain_pending(&mut ix, &mut slots);
            // Someone may have inserted the key between the two phases.
            if let Some(i) = ix.locate(hash, |i| *slots.key(i) == key) {
                return Ok(Ref::from_vote(owner, i, slots.add_ref(i)));
            }

            // Nothing is touched before the value exists.
            let value = factory.build()?;
            let (i, stale) = slots.occupy(Slot { key, value, hash }, Arc::clone(this));
            let linked = ix.insert(hash, i);
            debug_assert!(linked, "fresh slot already indexed");
            trace!(index = i, hash, reused = stale.is_some(), "slot occupied");
            (i, slots.add_ref(i), stale)
        };
        // The overwritten entry is dropped outside the locks.
        drop(stale);
        Ok(Ref::from_vote(owner, index, vote))
    }

    fn find<Q>(&self, owner: NonNull<Self>, q: &Q) -> Option<Ref<K, V, S>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
        S: KeyHasher<Q>,
    {
        self.assert_unguarded();
        let hash = self.hasher.hash_key(q);
        let _g = self.reentrancy.enter();
        let ix = self.index.read();
        let slots = self.slots.read_recursive();
        let i = ix.locate(hash, |i| {
            let k: &Q = slots.key(i).borrow();
            k == q
        })?;
        let vote = slots.add_ref(i)?;
        Some(Ref::bound(owner, i, vote))
    }

    fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
        S: KeyHasher<Q>,
    {
        self.assert_unguarded();
        let hash = self.hasher.hash_key(q);
        let _g = self.reentrancy.enter();
        let ix = self.index.read();
        let slots = self.slots.read_recursive();
        ix.locate(hash, |i| {
            let k: &Q = slots.key(i).borrow();
            k == q
        })
        .is_some()
    }
}

/// A concurrent, key-addressed interning pool.
///
/// Each distinct key maps to at most one live slot; `acquire` returns a
/// [`Ref`] to it, creating the entry on first use. Dropping the last `Ref`
/// frees the slot for reuse without destroying its contents; the stale
/// entry is dropped when a later insertion overwrites the slot, when
/// `resize_pool` cuts it off, or with the pool.
///
/// `V = ()` gives a set of interned keys, see [`FlatPool::acquire`].
pub struct FlatPool<K, V = (), S = DefaultHashBuilder> {
    core: Arc<Core<K, V, S>>,
}

/// User-facing name for a map-mode pool with the default hasher.
pub type ResourcePool<K, V> = FlatPool<K, V>;

/// User-facing name for a set-mode pool with the default hasher.
pub type ResourcePoolSet<K> = FlatPool<K>;

impl<K, V> FlatPool<K, V>
where
    K: Eq + Hash,
{
    /// Empty pool with the default hasher and [`MIN_RESERVED_SIZE`] slots.
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }

    /// Empty pool reserving at least `reserve` slots.
    pub fn with_capacity(reserve: usize) -> Self {
        Self::with_capacity_and_hasher(reserve, Default::default())
    }
}

impl<K, V> Default for FlatPool<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> FlatPool<K, V, S> {
    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots the storage can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.occupancy().capacity
    }

    /// Capacity and live count, read consistently.
    pub fn occupancy(&self) -> Occupancy {
        self.core.occupancy()
    }

    /// Release storage past the last occupied slot.
    ///
    /// Capacity drops to the smallest power of two that covers the highest
    /// occupied index, but never below [`MIN_RESERVED_SIZE`]. Nothing
    /// happens when capacity is already within that bound. The pool never
    /// calls this on its own; callers decide when, e.g. from
    /// [`occupancy`](Self::occupancy).
    pub fn resize_pool(&self) {
        self.core.resize_pool();
    }

    /// Hold off storage reallocation for the guard's lifetime.
    ///
    /// Cloning and dropping handles stays allowed on the guarding thread.
    /// A slot whose last handle it drops is reclaimed once its last guard
    /// on this pool is gone. Inserting, looking up, measuring or resizing
    /// would wait on the guard itself, so those panic on that thread.
    pub fn guard(&self) -> ReallocGuard<'_, K, V, S> {
        self.core.guard()
    }
}

impl<K, V, S> FlatPool<K, V, S>
where
    K: Eq,
    S: KeyHasher<K>,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::from_config(PoolConfig::default(), hasher)
    }

    pub fn with_capacity_and_hasher(reserve: usize, hasher: S) -> Self {
        Self::from_config(PoolConfig::with_reserve(reserve), hasher)
    }

    pub fn from_config(config: PoolConfig, hasher: S) -> Self {
        Self {
            core: Arc::new(Core::new(config, hasher)),
        }
    }

    /// Intern `key`, building its value with `factory` if the key is new.
    ///
    /// The factory runs at most once per distinct key and only when this
    /// call is the one that inserts; otherwise it is dropped unused. Which
    /// of several racing calls for a new key gets to insert is unspecified.
    pub fn acquire_with<F>(&self, key: K, factory: F) -> Ref<K, V, S>
    where
        F: ValueFactory<V, Error = Infallible>,
    {
        match Core::acquire(&self.core, key, factory) {
            Ok(r) => r,
            Err(never) => match never {},
        }
    }

    /// Like [`acquire_with`](Self::acquire_with), surfacing the factory's
    /// error. A failed build leaves the pool untouched.
    pub fn try_acquire_with<F>(&self, key: K, factory: F) -> Result<Ref<K, V, S>, F::Error>
    where
        F: ValueFactory<V>,
    {
        Core::acquire(&self.core, key, factory)
    }

    /// Look up a live entry; never inserts.
    pub fn find<Q>(&self, q: &Q) -> Option<Ref<K, V, S>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
        S: KeyHasher<Q>,
    {
        self.core.find(owner_ptr(&self.core), q)
    }

    /// Whether `q` has a live entry. Takes no reference.
    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
        S: KeyHasher<Q>,
    {
        self.core.contains_key(q)
    }
}

impl<K, S> FlatPool<K, (), S>
where
    K: Eq,
    S: KeyHasher<K>,
{
    /// Intern `key` in a set-mode pool.
    pub fn acquire(&self, key: K) -> Ref<K, (), S> {
        self.acquire_with(key, || ())
    }
}

impl<K, V, S> fmt::Debug for FlatPool<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let occ = self.occupancy();
        f.debug_struct("FlatPool")
            .field("live", &occ.live)
            .field("capacity", &occ.capacity)
            .finish()
    }
}

struct Bound<K, V, S> {
    owner: NonNull<Core<K, V, S>>,
    index: usize,
    vote: Vote,
}

/// Reference-counted handle to one pool slot.
///
/// Cloning casts another vote for the slot, moving transfers the vote,
/// and dropping returns it; the last drop frees the slot for reuse. A
/// `Ref` may also be empty, holding no slot at all.
///
/// Reading the entry requires a [`ReallocGuard`], which keeps the
/// storage from moving while the borrow lives.
pub struct Ref<K, V = (), S = DefaultHashBuilder> {
    bound: Option<Bound<K, V, S>>,
}

// SAFETY: a `Ref` only reaches its core through the core's locks and
// atomics, and may drop the core (and with it `K`, `V`, `S`) on whichever
// thread releases the last keepalive.
unsafe impl<K, V, S> Send for Ref<K, V, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Send + Sync,
{
}

// SAFETY: see `Send`; `&Ref` only permits cloning and guarded reads.
unsafe impl<K, V, S> Sync for Ref<K, V, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Send + Sync,
{
}

impl<K, V, S> Ref<K, V, S> {
    /// A handle holding no slot.
    pub const fn empty() -> Self {
        Self { bound: None }
    }

    fn bound(owner: NonNull<Core<K, V, S>>, index: usize, vote: Vote) -> Self {
        Self {
            bound: Some(Bound { owner, index, vote }),
        }
    }

    fn from_vote(owner: NonNull<Core<K, V, S>>, index: usize, vote: Option<Vote>) -> Self {
        match vote {
            Some(vote) => Self::bound(owner, index, vote),
            None => Self::empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_none()
    }

    /// Slot index, or `None` for an empty handle. Only meaningful while
    /// this handle is alive: freed slots are handed to other keys.
    pub fn index(&self) -> Option<usize> {
        self.bound.as_ref().map(|b| b.index)
    }

    /// Return this handle's vote now and leave it empty. Idempotent.
    pub fn reset(&mut self) {
        if let Some(Bound { owner, index, vote }) = self.bound.take() {
            let pin = {
                // SAFETY: until `vote` is returned, the slot is occupied and
                // its keepalive holds the core.
                let core = unsafe { owner.as_ref() };
                core.release_ref(index, vote)
            };
            // May free the core; nothing borrowed from it is live here.
            drop(pin);
        }
    }

    /// Hold off reallocation of this handle's pool. `None` if empty.
    ///
    /// The same restrictions as [`FlatPool::guard`] apply.
    pub fn guard(&self) -> Option<ReallocGuard<'_, K, V, S>> {
        let b = self.bound.as_ref()?;
        // SAFETY: `self` holds a vote, so the core is alive at least as
        // long as this borrow of `self`.
        let core = unsafe { b.owner.as_ref() };
        Some(core.guard())
    }

    /// Take a guard and expose this handle's entry through it.
    pub fn read(&self) -> Result<EntryGuard<'_, K, V, S>, RefError> {
        let index = self.index().ok_or(RefError::Empty)?;
        let guard = self.guard().ok_or(RefError::Empty)?;
        Ok(EntryGuard { guard, index })
    }

    #[inline]
    fn check_owner(&self, guard: &ReallocGuard<'_, K, V, S>) -> Result<usize, RefError> {
        let b = self.bound.as_ref().ok_or(RefError::Empty)?;
        if core::ptr::eq(b.owner.as_ptr(), guard.core) {
            Ok(b.index)
        } else {
            Err(RefError::WrongPool)
        }
    }

    /// Borrow the entry's key, validating the guard's pool.
    pub fn key<'g>(&self, guard: &'g ReallocGuard<'_, K, V, S>) -> Result<&'g K, RefError> {
        let i = self.check_owner(guard)?;
        Ok(&guard.slots.entry(i).key)
    }

    /// Borrow the entry's value, validating the guard's pool.
    pub fn value<'g>(&self, guard: &'g ReallocGuard<'_, K, V, S>) -> Result<&'g V, RefError> {
        let i = self.check_owner(guard)?;
        Ok(&guard.slots.entry(i).value)
    }

    fn ident(&self) -> Option<(NonNull<Core<K, V, S>>, usize)> {
        self.bound.as_ref().map(|b| (b.owner, b.index))
    }
}

impl<K, V, S> Default for Ref<K, V, S> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<K, V, S> Clone for Ref<K, V, S> {
    fn clone(&self) -> Self {
        match &self.bound {
            None => Self::empty(),
            Some(b) => {
                // SAFETY: our own vote keeps the slot occupied and the core alive.
                let core = unsafe { b.owner.as_ref() };
                Self::from_vote(b.owner, b.index, core.add_ref(b.index))
            }
        }
    }
}

impl<K, V, S> Drop for Ref<K, V, S> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<K, V, S> PartialEq for Ref<K, V, S> {
    fn eq(&self, other: &Self) -> bool {
        self.ident() == other.ident()
    }
}

impl<K, V, S> Eq for Ref<K, V, S> {}

impl<K, V, S> Hash for Ref<K, V, S> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ident().hash(state);
    }
}

impl<K, V, S> fmt::Debug for Ref<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bound {
            None => f.write_str("Ref(empty)"),
            Some(b) => f
                .debug_struct("Ref")
                .field("pool", &b.owner)
                .field("index", &b.index)
                .finish(),
        }
    }
}

/// Shared hold on a pool's storage: while it lives, the storage cannot
/// grow, shrink, or have slots overwritten, so borrows taken through it
/// stay valid. Reference counts of other slots may still change; a slot
/// whose last handle this thread drops is reclaimed once the thread's
/// last guard on the pool goes away.
///
/// Not `Clone` and not `Send`; it cannot leave the thread or scope that
/// took it.
pub struct ReallocGuard<'a, K, V, S = DefaultHashBuilder> {
    core: &'a Core<K, V, S>,
    slots: ManuallyDrop<RwLockReadGuard<'a, SlotTable<K, V, S>>>,
}

impl<'a, K, V, S> Drop for ReallocGuard<'a, K, V, S> {
    fn drop(&mut self) {
        // SAFETY: dropped exactly once, and never touched afterwards.
        unsafe { ManuallyDrop::drop(&mut self.slots) };
        if unhold_guard(self.core.id()) {
            // The core outlives `'a`, and the pool or handle it was borrowed
            // from still holds it, so reclaiming cannot free it.
            self.core.reclaim_pending();
        }
    }
}

impl<'a, K, V, S> fmt::Debug for ReallocGuard<'a, K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReallocGuard")
            .field("pool", &(self.core as *const Core<K, V, S>))
            .finish()
    }
}

/// One entry, read through a [`ReallocGuard`] held for its lifetime.
/// Derefs to the value.
pub struct EntryGuard<'a, K, V, S = DefaultHashBuilder> {
    guard: ReallocGuard<'a, K, V, S>,
    index: usize,
}

impl<'a, K, V, S> EntryGuard<'a, K, V, S> {
    pub fn key(&self) -> &K {
        &self.guard.slots.entry(self.index).key
    }

    pub fn value(&self) -> &V {
        &self.guard.slots.entry(self.index).value
    }
}

impl<'a, K, V, S> Deref for EntryGuard<'a, K, V, S> {
    type Target = V;

    fn deref(&self) -> &V {
        self.value()
    }
}

impl<'a, K: fmt::Debug, V: fmt::Debug, S> fmt::Debug for EntryGuard<'a, K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryGuard")
            .field("key", self.key())
            .field("value", self.value())
            .finish()
    }
}

#[cfg(test)]
impl<K, V, S> FlatPool<K, V, S> {
    /// Index and occupation table agree one-to-one, and nothing free
    /// carries votes.
    fn assert_consistent(&self) {
        let ix = self.core.index.read();
        let slots = self.core.slots.read_recursive();
        let occupied: Vec<usize> = (0..slots.len()).filter(|&i| slots.is_occupied(i)).collect();
        assert_eq!(ix.len(), occupied.len());
        for &i in &occupied {
            let hash = slots.entry(i).hash;
            assert_eq!(ix.locate(hash, |j| j == i), Some(i), "slot {i} not indexed");
        }
        for i in (0..slots.len()).filter(|&i| !slots.is_occupied(i)) {
            assert_eq!(slots.count(i), 0, "free slot {i} holds votes");
        }
        if let Some(f) = slots.first_free() {
            assert!(!slots.is_occupied(f));
            assert!((0..f).all(|i| slots.is_occupied(i)), "hint is not the lowest free slot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::hash::BuildHasher;

    /// Sends every key to the same digest.
    #[derive(Clone, Default)]
    struct ConstBuildHasher;

    struct ConstHasher;

    impl Hasher for ConstHasher {
        fn write(&mut self, _bytes: &[u8]) {}
        fn finish(&self) -> u64 {
            0
        }
    }

    impl BuildHasher for ConstBuildHasher {
        type Hasher = ConstHasher;
        fn build_hasher(&self) -> ConstHasher {
            ConstHasher
        }
    }

    #[test]
    fn collisions_resolve_by_key() {
        let pool: FlatPool<String, usize, ConstBuildHasher> = FlatPool::with_hasher(ConstBuildHasher);
        let refs: Vec<_> = (0..10)
            .map(|i| pool.acquire_with(format!("k{i}"), move || i))
            .collect();
        assert_eq!(pool.len(), 10);
        pool.assert_consistent();

        for i in 0..10 {
            let r = pool.find(format!("k{i}").as_str()).expect("live");
            assert_eq!(r, refs[i]);
            assert_eq!(*r.read().unwrap(), i);
        }
        assert!(pool.find("k10").is_none());

        drop(refs);
        assert!(pool.is_empty());
        pool.assert_consistent();
    }

    #[test]
    fn reclaim_and_reuse_keep_tables_in_step() {
        let pool: FlatPool<u32> = FlatPool::new();
        let mut refs: Vec<_> = (0..20).map(|k| pool.acquire(k)).collect();
        pool.assert_consistent();

        for r in refs.iter_mut().skip(5).step_by(3) {
            r.reset();
        }
        pool.assert_consistent();

        let fresh: Vec<_> = (100..104).map(|k| pool.acquire(k)).collect();
        pool.assert_consistent();
        let reused: Vec<usize> = fresh.iter().filter_map(Ref::index).collect();
        assert_eq!(reused, vec![5, 8, 11, 14], "lowest free slots are taken first");
    }

    #[test]
    fn failed_build_leaves_pool_untouched() {
        let pool: FlatPool<u32, String> = FlatPool::new();
        let _a = pool.acquire_with(1, || "one".to_string());
        let before = pool.occupancy();

        let err = pool
            .try_acquire_with(2, crate::factory::Fallible(|| Err::<String, _>("boom")))
            .unwrap_err();
        assert_eq!(err, "boom");
        assert_eq!(pool.occupancy(), before);
        assert!(!pool.contains_key(&2));
        pool.assert_consistent();
    }

    #[test]
    fn core_outlives_pool_while_refs_live() {
        let pool: FlatPool<String, Vec<u8>> = FlatPool::new();
        let r = pool.acquire_with("blob".to_string(), || vec![1, 2, 3]);
        let weak = Arc::downgrade(&pool.core);
        drop(pool);

        assert!(weak.upgrade().is_some(), "live entry pins the core");
        assert_eq!(&*r.read().unwrap(), &[1, 2, 3]);
        drop(r);
        assert!(weak.upgrade().is_none(), "last handle frees the core");
    }

    #[test]
    fn empty_pool_frees_core_on_drop() {
        let pool: FlatPool<u64> = FlatPool::new();
        drop(pool.acquire(1));
        let weak = Arc::downgrade(&pool.core);
        drop(pool);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn guard_allows_votes_that_are_not_last() {
        let pool: FlatPool<u32> = FlatPool::new();
        let a = pool.acquire(1);
        let b = pool.acquire(2);
        let g = pool.guard();
        // Cloning and non-final drops only need the shared lock.
        let b2 = b.clone();
        drop(b2);
        assert_eq!(a.key(&g), Ok(&1));
        assert_eq!(b.key(&g), Ok(&2));
    }

    #[test]
    fn last_drop_under_guard_is_queued() {
        let pool: FlatPool<u32> = FlatPool::new();
        let a = pool.acquire(1);
        let b = pool.acquire(2);
        let ib = b.index().unwrap();
        {
            let _g = a.guard();
            drop(b);
            assert_eq!(*pool.core.pending.lock(), vec![ib]);
            let slots = pool.core.slots.read_recursive();
            assert!(slots.is_occupied(ib), "queued slot stays occupied");
            assert_eq!(slots.count(ib), 0);
        }
        assert!(pool.core.pending.lock().is_empty());
        pool.assert_consistent();
        assert_eq!(pool.len(), 1);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn factory_reentering_pool_panics_in_debug() {
        let pool: FlatPool<u32, u32> = FlatPool::new();
        let one = pool.acquire_with(1, || 10);

        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pool.acquire_with(2, || pool.find(&1).map_or(0, |_| 20))
        }));
        assert!(res.is_err(), "a factory calling back into the pool must panic");

        // Locks were released during unwinding and nothing was inserted.
        assert!(!pool.contains_key(&2));
        assert_eq!(pool.find(&1), Some(one));
        pool.assert_consistent();
    }
}
