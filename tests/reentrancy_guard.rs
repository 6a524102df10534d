#![cfg(test)]

use flat_pool::{FlatPool, Ref};

// A factory runs under the pool's exclusive locks; calling back into the
// same pool from it would deadlock, so debug builds panic instead.
#[cfg(debug_assertions)]
#[test]
fn factory_reentry_panics_in_debug() {
    let pool: FlatPool<u32, usize> = FlatPool::new();
    let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pool.acquire_with(1, || pool.len())
    }));
    assert!(res.is_err(), "expected reentrancy to panic in debug builds");

    // Nothing was inserted and the locks were released on unwind.
    assert!(pool.is_empty());
    let r = pool.acquire_with(1, || 7);
    assert_eq!(*r.read().unwrap(), 7);
}

// Other pools are independent.
#[test]
fn factory_may_use_another_pool() {
    let names: FlatPool<u32, String> = FlatPool::new();
    let lengths: FlatPool<u32, usize> = FlatPool::new();
    let n = names.acquire_with(3, || "three".to_string());
    let l = lengths.acquire_with(3, || {
        let name = names.find(&3).expect("live");
        let len = name.read().unwrap().len();
        len
    });
    assert_eq!(*l.read().unwrap(), 5);
    drop(n);
}

struct Node(Vec<Ref<u32, Node>>);

// Stale values are dropped outside the pool's locks, so a value holding a
// handle into the same pool may be overwritten safely.
#[test]
fn stale_value_may_hold_handle_into_same_pool() {
    let pool: FlatPool<u32, Node> = FlatPool::new();
    let leaf = pool.acquire_with(0, || Node(Vec::new()));
    // Cloning inside the factory would re-enter the pool.
    let child = leaf.clone();
    let parent = pool.acquire_with(1, move || Node(vec![child]));
    drop(parent);
    drop(leaf);
    assert!(pool.contains_key(&0), "freed parent still holds the leaf");

    // Reusing slot 1 drops the stale parent, releasing the leaf.
    let r = pool.acquire_with(2, || Node(Vec::new()));
    assert_eq!(r.index(), Some(1));
    assert!(!pool.contains_key(&0));
    assert_eq!(pool.len(), 1);
}
