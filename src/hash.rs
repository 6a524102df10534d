//! Key hashing strategies.
//!
//! The pool orders its index by a full-width `u64` digest of each key.
//! Where that digest comes from is chosen by the pool's `S` type
//! parameter, so the choice is fixed at compile time per key type:
//!
//! 1. any [`BuildHasher`] over `K: Hash` (the std mechanism, and the
//!    default via [`DefaultHashBuilder`]);
//! 2. [`HashFn`], a free function `fn(&K) -> u64`;
//! 3. [`ByMethod`], which asks the key itself through [`PoolHash`].
//!
//! Whatever the strategy, equal keys must produce equal digests. When a
//! pool is queried with a borrowed form `Q` of its key, `S` must hash `Q`
//! exactly as it hashes the owning `K`.

use core::fmt;
use core::hash::{BuildHasher, Hash};

/// Default strategy: hashbrown's fixed-seed builder, deterministic for the
/// lifetime of the process.
pub type DefaultHashBuilder = hashbrown::hash_map::DefaultHashBuilder;

/// Produces the digest the pool's index is ordered by.
pub trait KeyHasher<K: ?Sized> {
    fn hash_key(&self, key: &K) -> u64;
}

impl<K, B> KeyHasher<K> for B
where
    K: ?Sized + Hash,
    B: BuildHasher,
{
    #[inline]
    fn hash_key(&self, key: &K) -> u64 {
        self.hash_one(key)
    }
}

/// Hash keys through a plain function.
pub struct HashFn<K: ?Sized>(pub fn(&K) -> u64);

impl<K: ?Sized> KeyHasher<K> for HashFn<K> {
    #[inline]
    fn hash_key(&self, key: &K) -> u64 {
        (self.0)(key)
    }
}

impl<K: ?Sized> Clone for HashFn<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: ?Sized> Copy for HashFn<K> {}

impl<K: ?Sized> fmt::Debug for HashFn<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HashFn").finish()
    }
}

/// Keys that know their own pool digest.
pub trait PoolHash {
    fn pool_hash(&self) -> u64;
}

/// Hash keys through their [`PoolHash`] implementation.
#[derive(Copy, Clone, Debug, Default)]
pub struct ByMethod;

impl<K: ?Sized + PoolHash> KeyHasher<K> for ByMethod {
    #[inline]
    fn hash_key(&self, key: &K) -> u64 {
        key.pool_hash()
    }
}
