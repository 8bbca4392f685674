//! Integration tests for the growing virtual arenas
#![cfg(feature = "virtual")]

use std::cell::RefCell;
use std::ptr::NonNull;

use arenakit::MemoryResult;
use arenakit::allocator::{Allocator, VirtualConfig, VirtualLinearAllocator, VirtualStackAllocator};
use arenakit::platform::{self, OsVirtualMemory, VirtualMemory};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// OS backend that records every commit size
#[derive(Default)]
struct RecordingVm {
    commits: RefCell<Vec<usize>>,
    released: RefCell<bool>,
}

impl VirtualMemory for RecordingVm {
    fn page_size(&self) -> usize {
        OsVirtualMemory.page_size()
    }

    fn reserve(&self, size: usize) -> MemoryResult<NonNull<u8>> {
        OsVirtualMemory.reserve(size)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> MemoryResult<()> {
        *self.released.borrow_mut() = true;
        unsafe { OsVirtualMemory.release(ptr, size) }
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> MemoryResult<()> {
        self.commits.borrow_mut().push(size);
        unsafe { OsVirtualMemory.commit(ptr, size) }
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) -> MemoryResult<()> {
        unsafe { OsVirtualMemory.decommit(ptr, size) }
    }
}

#[test]
fn test_linear_commits_one_chunk_per_step() {
    let vm = RecordingVm::default();
    let arena = VirtualLinearAllocator::with_backend(&vm, VirtualConfig::new(MIB, 64 * KIB)).unwrap();
    assert_eq!(arena.physical_size_bytes(), 0);

    arena.alloc(10, 8);
    assert_eq!(*vm.commits.borrow(), vec![64 * KIB]);
    assert_eq!(arena.physical_size_bytes() % (64 * KIB), 0);

    arena.alloc(100_000, 8);
    assert_eq!(*vm.commits.borrow(), vec![64 * KIB, 64 * KIB]);
    assert_eq!(arena.physical_size_bytes(), 128 * KIB);
}

#[test]
fn test_commits_never_smaller_than_chunk() {
    let vm = RecordingVm::default();
    let arena = VirtualLinearAllocator::with_backend(&vm, VirtualConfig::new(4 * MIB, 64 * KIB)).unwrap();
    for i in 0..500 {
        arena.alloc(1 + (i * 613) % 9000, 16);
        assert_eq!(arena.physical_size_bytes() % arena.chunk_size_bytes(), 0);
    }
    assert!(vm.commits.borrow().iter().all(|&c| c >= 64 * KIB && c % (64 * KIB) == 0));
}

#[test]
fn test_destroy_releases_reservation_once() {
    let vm = RecordingVm::default();
    {
        let mut arena =
            VirtualStackAllocator::with_backend(&vm, VirtualConfig::new(MIB, 64 * KIB)).unwrap();
        let p = arena.alloc(1000, 8);
        unsafe { arena.free(p.as_ptr()) };
        arena.destroy();
        assert!(*vm.released.borrow());
        *vm.released.borrow_mut() = false;
    }
    // Drop after destroy must not release again
    assert!(!*vm.released.borrow());
}

#[test]
fn test_stack_round_trip_across_chunks() {
    let arena = VirtualStackAllocator::with_config(VirtualConfig::debug()).unwrap();
    let mut live = Vec::new();
    for i in 0..64u8 {
        let size = 1500 + usize::from(i) * 10;
        let p = arena.alloc(size, 32);
        assert_eq!(p.as_ptr() as usize % 32, 0);
        unsafe { p.as_ptr().write_bytes(i, size) };
        live.push((p, size, i));
    }
    assert_eq!(arena.depth(), 64);
    while let Some((p, size, tag)) = live.pop() {
        unsafe {
            assert!((0..size).all(|k| *p.as_ptr().add(k) == tag));
            arena.free(p.as_ptr());
        }
    }
    assert_eq!(arena.allocated_size(), 0);
    arena.decommit_idle_memory();
    assert_eq!(arena.physical_size_bytes(), 0);
}

#[test]
fn test_prefaulted_production_arena() {
    let config = VirtualConfig::new(8 * MIB, 2 * MIB).with_prefault(true);
    let arena = VirtualLinearAllocator::with_config(config).unwrap();
    let p = arena.alloc(3 * MIB, 4096);
    unsafe { p.as_ptr().add(3 * MIB - 1).write(7) };
    assert_eq!(arena.physical_size_bytes(), 4 * MIB);
}

#[test]
fn test_free_functions_round_trip() {
    let page = platform::page_size();
    assert!(page.is_power_of_two());
    let base = platform::reserve_virtual_memory(4 * page);
    unsafe {
        platform::commit_physical_memory(base, 2 * page);
        platform::prefault_memory(base, 2 * page);
        base.as_ptr().add(2 * page - 1).write(0xEE);
        platform::decommit_physical_memory(base, 2 * page);
        platform::free_virtual_memory(base, 4 * page);
    }
}

#[test]
fn test_linear_reset_and_decommit_with_tracing_installed() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::TRACE)
        .try_init();

    let mut arena = VirtualLinearAllocator::new(MIB, 64 * KIB).unwrap();
    arena.alloc(200 * KIB, 64);
    assert_eq!(arena.physical_size_bytes(), 256 * KIB);

    arena.reset();
    assert_eq!(arena.allocated_size(), 0);
    // Reset keeps the commit; decommit hands it back
    assert_eq!(arena.physical_size_bytes(), 256 * KIB);
    arena.decommit_idle_memory();
    assert_eq!(arena.physical_size_bytes(), 0);

    assert!(arena.try_alloc(2 * MIB, 8).is_err());
    arena.destroy();
}
