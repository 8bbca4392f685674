//! Integration tests for the handle-based object pool

use std::cell::RefCell;
use std::rc::Rc;

use arenakit::allocator::{AtomicPoolAllocator, PoolConfig};
use arenakit::assert::{panicking_assert_handler, scoped_assert_handler};
use arenakit::{AtomicLinkedPool, Handle};
use pretty_assertions::assert_eq;

#[test]
fn test_reacquired_slot_gets_next_generation() {
    let pool: AtomicLinkedPool<'_, i32> = AtomicLinkedPool::new(8).unwrap();
    let handles: Vec<Handle> = (0..8).map(|_| pool.acquire()).collect();

    let third = handles[3];
    let (slot, generation) = pool.handle_parts(third).unwrap();
    pool.release(third);

    let again = pool.acquire();
    assert_eq!(pool.handle_parts(again), Some((slot, generation + 1)));
    assert!(!pool.is_alive(third));
    assert!(pool.is_alive(again));
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "stale linked pool handle")]
fn test_get_with_stale_handle_asserts() {
    let _guard = scoped_assert_handler(panicking_assert_handler);
    let pool: AtomicLinkedPool<'_, i32> = AtomicLinkedPool::new(8).unwrap();
    let handles: Vec<Handle> = (0..8).map(|_| pool.acquire()).collect();
    pool.release(handles[3]);
    let _reused = pool.acquire();

    let _ = unsafe { pool.get(handles[3]) };
}

#[test]
#[should_panic(expected = "stale linked pool handle")]
fn test_get_mut_with_stale_handle_asserts_in_every_build() {
    let _guard = scoped_assert_handler(panicking_assert_handler);
    let mut pool: AtomicLinkedPool<'_, i32> = AtomicLinkedPool::new(2).unwrap();
    let h = pool.acquire();
    pool.release(h);
    pool.acquire();
    *pool.get_mut(h) = 1;
}

#[test]
fn test_release_inside_iteration_is_safe() {
    let pool: AtomicLinkedPool<'_, u32> = AtomicLinkedPool::new(64).unwrap();
    for i in 0..64 {
        pool.acquire_with(i);
    }

    let mut visited = Vec::new();
    pool.iterate_allocated_nodes(|h| {
        let value = unsafe { *pool.get(h) };
        visited.push(value);
        if value % 2 == 0 {
            pool.release(h);
        }
    });

    assert_eq!(visited, (0..64).collect::<Vec<_>>());
    assert_eq!(pool.live_count(), 32);

    let mut remaining = Vec::new();
    pool.iterate_allocated_nodes(|h| remaining.push(unsafe { *pool.get(h) }));
    assert_eq!(remaining, (0..64).filter(|v| v % 2 == 1).collect::<Vec<_>>());
}

#[test]
fn test_iteration_order_is_by_slot_after_churn() {
    let pool: AtomicLinkedPool<'_, usize, false> = AtomicLinkedPool::new(1000).unwrap();
    let handles: Vec<Handle> = (0..1000).map(|i| pool.acquire_with(i)).collect();
    for h in handles.iter().rev().step_by(7) {
        pool.release(*h);
    }
    // Refill some released slots; they come back in LIFO order
    for _ in 0..50 {
        pool.acquire_with(usize::MAX);
    }

    let mut slots = Vec::new();
    pool.iterate_allocated_nodes(|h| slots.push(pool.handle_parts(h).unwrap().0));
    assert!(slots.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(slots.len(), pool.live_count());
}

#[test]
fn test_release_all_and_destroy_drop_values() {
    let log = Rc::new(RefCell::new(Vec::new()));
    struct Noisy(u32, Rc<RefCell<Vec<u32>>>);
    impl Drop for Noisy {
        fn drop(&mut self) {
            self.1.borrow_mut().push(self.0);
        }
    }

    let mut pool: AtomicLinkedPool<'_, Noisy> = AtomicLinkedPool::new(8).unwrap();
    let stale: Vec<Handle> = (0..4).map(|i| pool.acquire_with(Noisy(i, log.clone()))).collect();
    pool.release_all();
    assert_eq!(*log.borrow(), vec![0, 1, 2, 3]);
    assert!(stale.iter().all(|h| !pool.is_alive(*h)));

    pool.acquire_with(Noisy(10, log.clone()));
    pool.acquire_with(Noisy(11, log.clone()));
    drop(pool);
    let mut dropped = log.borrow().clone();
    dropped.sort_unstable();
    assert_eq!(dropped, vec![0, 1, 2, 3, 10, 11]);
}

#[test]
fn test_pool_storage_can_come_from_another_allocator() {
    let backing = AtomicPoolAllocator::with_config(4096, 64, 4, PoolConfig::production()).unwrap();
    let pool: AtomicLinkedPool<'_, [u64; 4]> = AtomicLinkedPool::with_backing(16, &backing).unwrap();
    assert!(backing.allocated_blocks() >= 2);

    let h = pool.acquire_with([1, 2, 3, 4]);
    assert_eq!(unsafe { pool.get(h) }.iter().sum::<u64>(), 10);
    drop(pool);
    assert!(backing.is_empty());
}
