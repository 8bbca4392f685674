//! Main pool allocator implementation
//!
//! # Safety
//!
//! Thread-safe fixed-block pool built on [`VersionedFreeList`]:
//! - Blocks live in one contiguous buffer from the backing allocator
//! - Next links live in a parallel `AtomicI32` array, never in the blocks
//! - The list head is a versioned index swapped with CAS (ABA-safe)
//!
//! ## Invariants
//!
//! - All blocks are aligned to `block_align` and `block_size` apart
//! - A block is either on the free list or marked allocated in `links`
//! - Freed pointers are validated (bounds + block boundary) before reuse
//! - `free_count` tracks free blocks for O(1) queries

use core::ptr::{self, NonNull};
use core::slice;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

#[cfg(feature = "logging")]
use tracing::debug;

use super::{PoolConfig, PoolStats};
use crate::allocator::free_list::{ALLOCATED, VersionedFreeList};
use crate::allocator::traits::check_align;
use crate::allocator::{AllocError, AllocResult, Allocator, system_allocator};
use crate::error::MemoryError;
use crate::utils::{align_up, atomic_max};
use crate::{mem_assert, mem_fatal};

/// Lock-free pool allocator for fixed-size blocks
///
/// Any number of threads may allocate and free concurrently. Requests
/// larger than the block size or more aligned than the block alignment are
/// refused.
///
/// # Memory Layout
/// ```text
/// blocks: [Block0][Block1][Block2][Block3]...[BlockN]
/// links:  [  1   ][ -2   ][  3   ][ -1   ]...
///          ^head                             (-2: handed out, -1: end)
/// ```
pub struct AtomicPoolAllocator<'a> {
    backing: &'a (dyn Allocator + Sync),
    blocks: NonNull<u8>,
    links: NonNull<AtomicI32>,

    /// Stride between blocks
    block_size: usize,
    block_align: usize,
    block_count: usize,

    free_list: VersionedFreeList,
    free_count: AtomicUsize,

    config: PoolConfig,

    total_allocs: AtomicU32,
    total_deallocs: AtomicU32,
    peak_usage: AtomicUsize,
}

impl AtomicPoolAllocator<'static> {
    /// `block_count` blocks of `block_size` bytes from the system allocator
    ///
    /// # Errors
    /// See [`AtomicPoolAllocator::with_backing`].
    pub fn new(block_size: usize, block_align: usize, block_count: usize) -> AllocResult<Self> {
        Self::with_config(block_size, block_align, block_count, PoolConfig::default())
    }

    /// # Errors
    /// See [`AtomicPoolAllocator::with_backing`].
    pub fn with_config(
        block_size: usize,
        block_align: usize,
        block_count: usize,
        config: PoolConfig,
    ) -> AllocResult<Self> {
        Self::with_backing(block_size, block_align, block_count, system_allocator(), config)
    }

    /// Pool sized and aligned for `T`
    ///
    /// # Errors
    /// See [`AtomicPoolAllocator::with_backing`].
    pub fn for_type<T>(block_count: usize) -> AllocResult<Self> {
        Self::new(size_of::<T>().max(1), align_of::<T>(), block_count)
    }
}

impl<'a> AtomicPoolAllocator<'a> {
    /// Creates a pool whose storage comes from `backing`
    ///
    /// # Errors
    /// Returns an error if:
    /// - `block_size` or `block_count` is zero, or `block_count` does not
    ///   fit a slot index
    /// - `block_align` is not a power of 2
    /// - the total size overflows or `backing` cannot provide it
    pub fn with_backing(
        block_size: usize,
        block_align: usize,
        block_count: usize,
        backing: &'a (dyn Allocator + Sync),
        config: PoolConfig,
    ) -> AllocResult<Self> {
        check_align(block_align)?;
        if block_size == 0 {
            return Err(AllocError::invalid_layout("block size must not be zero"));
        }
        if block_count == 0 || block_count > i32::MAX as usize {
            return Err(MemoryError::invalid_config(&format!(
                "block count {block_count} must be between 1 and {}",
                i32::MAX
            )));
        }

        let stride = align_up(block_size, block_align);
        let total_size = stride
            .checked_mul(block_count)
            .ok_or_else(|| AllocError::size_overflow("pool block storage"))?;
        let links_size = block_count
            .checked_mul(size_of::<AtomicI32>())
            .ok_or_else(|| AllocError::size_overflow("pool link storage"))?;

        let blocks = backing.try_alloc(total_size, block_align)?;
        let links = match backing.try_alloc(links_size, align_of::<AtomicI32>()) {
            Ok(links) => links.cast::<AtomicI32>(),
            Err(e) => {
                // SAFETY: blocks was just allocated by backing
                unsafe { backing.free(blocks.as_ptr()) };
                return Err(e);
            }
        };
        // SAFETY: Initialising the link array.
        // - links has room for block_count AtomicI32 (allocated above)
        // - AtomicI32 has the same layout as i32
        unsafe {
            for i in 0..block_count {
                links.add(i).write(AtomicI32::new(ALLOCATED));
            }
        }
        if let Some(pattern) = config.alloc_pattern {
            // SAFETY: blocks spans total_size bytes
            unsafe { ptr::write_bytes(blocks.as_ptr(), pattern, total_size) };
        }

        let pool = Self {
            backing,
            blocks,
            links,
            block_size: stride,
            block_align,
            block_count,
            free_list: VersionedFreeList::new(config.use_backoff),
            free_count: AtomicUsize::new(block_count),
            config,
            total_allocs: AtomicU32::new(0),
            total_deallocs: AtomicU32::new(0),
            peak_usage: AtomicUsize::new(0),
        };
        pool.free_list.rebuild(pool.links());

        #[cfg(feature = "logging")]
        debug!(block_size = stride, block_align, block_count, "atomic pool initialized");

        Ok(pool)
    }

    #[inline]
    fn links(&self) -> &[AtomicI32] {
        // SAFETY: links holds block_count initialised atomics for the
        // lifetime of the pool
        unsafe { slice::from_raw_parts(self.links.as_ptr(), self.block_count) }
    }

    /// Returns the stride of each block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the alignment of each block
    pub fn block_align(&self) -> usize {
        self.block_align
    }

    /// Returns the total number of blocks in the pool
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Returns the total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.block_size * self.block_count
    }

    /// Returns the number of free blocks (exact in absence of races)
    pub fn free_blocks(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    /// Returns the number of allocated blocks
    pub fn allocated_blocks(&self) -> usize {
        // The counter trails the list, so a racing pop and push can push it
        // one past the block count for a moment.
        self.block_count.saturating_sub(self.free_blocks())
    }

    /// Bytes handed out right now
    pub fn used_memory(&self) -> usize {
        self.allocated_blocks() * self.block_size
    }

    /// Checks if the pool is full (no free blocks)
    pub fn is_full(&self) -> bool {
        self.free_blocks() == 0
    }

    /// Checks if the pool is empty (all blocks free)
    pub fn is_empty(&self) -> bool {
        self.allocated_blocks() == 0
    }

    /// Checks if a pointer belongs to this pool
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let start = self.blocks.as_ptr() as usize;
        addr >= start && addr < start + self.capacity()
    }

    /// Put every block back on the free list.
    pub fn reset(&mut self) {
        for link in self.links() {
            link.store(ALLOCATED, Ordering::Relaxed);
        }
        self.free_list.rebuild(self.links());
        self.free_count.store(self.block_count, Ordering::Relaxed);
        if self.config.track_stats {
            self.total_allocs.store(0, Ordering::Relaxed);
            self.total_deallocs.store(0, Ordering::Relaxed);
            self.peak_usage.store(0, Ordering::Relaxed);
        }
    }

    /// Get statistics (if tracking is enabled)
    pub fn stats(&self) -> Option<PoolStats> {
        if !self.config.track_stats {
            return None;
        }

        Some(PoolStats {
            total_allocs: self.total_allocs.load(Ordering::Relaxed),
            total_deallocs: self.total_deallocs.load(Ordering::Relaxed),
            peak_usage: self.peak_usage.load(Ordering::Relaxed),
            current_usage: self.used_memory(),
            block_size: self.block_size,
            block_count: self.block_count,
            free_blocks: self.free_blocks(),
        })
    }

    /// Index of the block at `ptr`, faulting on foreign or interior pointers
    fn index_of(&self, ptr: *mut u8) -> usize {
        mem_assert!(
            self.contains(ptr),
            "pointer {ptr:p} does not belong to this atomic pool"
        );
        let offset = ptr as usize - self.blocks.as_ptr() as usize;
        mem_assert!(
            offset.is_multiple_of(self.block_size),
            "pointer {ptr:p} is not at a block boundary"
        );
        offset / self.block_size
    }

    fn block(&self, index: usize) -> NonNull<u8> {
        // SAFETY: index < block_count keeps the block inside the buffer
        unsafe { self.blocks.add(index * self.block_size) }
    }
}

impl core::fmt::Debug for AtomicPoolAllocator<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AtomicPoolAllocator")
            .field("block_size", &self.block_size)
            .field("block_align", &self.block_align)
            .field("block_count", &self.block_count)
            .field("free_blocks", &self.free_blocks())
            .finish()
    }
}

// SAFETY: AtomicPoolAllocator hands out each block to one owner at a time.
// - a block is removed from the free list by a CAS before it is returned
// - the versioned head makes a stale CAS fail instead of double-popping
// - frees are validated and claimed through the ALLOCATED link marker
unsafe impl Allocator for AtomicPoolAllocator<'_> {
    fn name(&self) -> &str {
        "atomic_pool"
    }

    fn try_alloc(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        check_align(align)?;
        if size > self.block_size {
            return Err(AllocError::allocation_too_large(size, self.block_size));
        }
        if align > self.block_align {
            return Err(AllocError::invalid_alignment(align));
        }

        let index = self
            .free_list
            .pop(self.links())
            .ok_or_else(|| AllocError::pool_exhausted("atomic_pool", self.block_count))?;
        self.free_count.fetch_sub(1, Ordering::Relaxed);

        if self.config.track_stats {
            self.total_allocs.fetch_add(1, Ordering::Relaxed);
            atomic_max(&self.peak_usage, self.used_memory());
        }

        let block = self.block(index);
        if let Some(pattern) = self.config.alloc_pattern {
            // SAFETY: the block was just popped, this thread owns it
            unsafe { ptr::write_bytes(block.as_ptr(), pattern, self.block_size) };
        }
        Ok(block)
    }

    fn alloc(&self, size: usize, align: usize) -> NonNull<u8> {
        match self.try_alloc(size, align) {
            Ok(ptr) => ptr,
            Err(MemoryError::PoolExhausted { capacity, .. }) => {
                mem_fatal!("atomic pool full: all {capacity} blocks are in use")
            }
            Err(e) => mem_fatal!("atomic_pool cannot allocate {size} bytes (align {align}): {e}"),
        }
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let index = self.index_of(ptr);
        mem_assert!(
            self.free_list.mark_released(self.links(), index),
            "atomic pool double free of block {index}"
        );
        if let Some(pattern) = self.config.dealloc_pattern {
            // SAFETY: the block is claimed but not yet published
            unsafe { ptr::write_bytes(ptr, pattern, self.block_size) };
        }
        self.free_list.push_released(self.links(), index);
        self.free_count.fetch_add(1, Ordering::Relaxed);

        if self.config.track_stats {
            self.total_deallocs.fetch_add(1, Ordering::Relaxed);
        }
    }

    unsafe fn try_realloc(
        &self,
        ptr: *mut u8,
        _old_size: usize,
        new_size: usize,
        align: usize,
    ) -> AllocResult<NonNull<u8>> {
        if ptr.is_null() {
            return self.try_alloc(new_size, align);
        }
        check_align(align)?;
        // Every block already spans block_size bytes; the only valid resize
        // is one that still fits.
        if new_size > self.block_size {
            return Err(AllocError::allocation_too_large(new_size, self.block_size));
        }
        if align > self.block_align {
            return Err(AllocError::invalid_alignment(align));
        }
        let _ = self.index_of(ptr);
        // SAFETY: ptr is non-null (checked above)
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    unsafe fn allocation_size(&self, ptr: *const u8) -> Option<usize> {
        self.contains(ptr).then_some(self.block_size)
    }

    /// Walks the free list. Only meaningful while no other thread uses the
    /// pool.
    fn validate_heap(&self) -> bool {
        let links = self.links();
        let mut free = 0;
        let mut corrupt = false;
        let clean = self.free_list.walk(links, |i| {
            free += 1;
            if links[i].load(Ordering::Relaxed) == ALLOCATED {
                corrupt = true;
            }
        });
        if !clean || corrupt {
            mem_fatal!("atomic pool free list is corrupted");
        }
        let allocated = links
            .iter()
            .filter(|l| l.load(Ordering::Relaxed) == ALLOCATED)
            .count();
        if free + allocated != self.block_count || free != self.free_blocks() {
            mem_fatal!(
                "atomic pool accounting mismatch: {free} free + {allocated} allocated of {}",
                self.block_count
            );
        }
        true
    }
}

impl Drop for AtomicPoolAllocator<'_> {
    fn drop(&mut self) {
        // SAFETY: both arrays came from backing in with_backing and nothing
        // can reach them once the pool is gone
        unsafe {
            self.backing.free(self.links.as_ptr().cast::<u8>());
            self.backing.free(self.blocks.as_ptr());
        }

        #[cfg(feature = "logging")]
        debug!(block_count = self.block_count, "atomic pool destroyed");
    }
}

// SAFETY: AtomicPoolAllocator is Send because:
// - the block and link buffers are owned by the pool
// - backing is a shared reference to a Sync allocator
// - all mutable state is atomic
unsafe impl Send for AtomicPoolAllocator<'_> {}

// SAFETY: AtomicPoolAllocator is Sync because:
// - the free list head and every link are atomics with AcqRel/Acquire CAS
// - a block is owned by exactly one caller between alloc and free
// - counters are atomic
unsafe impl Sync for AtomicPoolAllocator<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert::{panicking_assert_handler, scoped_assert_handler};

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(AtomicPoolAllocator::new(0, 8, 4).is_err());
        assert!(AtomicPoolAllocator::new(64, 3, 4).is_err());
        assert!(AtomicPoolAllocator::new(64, 8, 0).is_err());
    }

    #[test]
    fn test_alloc_free_cycle() {
        let pool = AtomicPoolAllocator::with_config(64, 16, 4, PoolConfig::debug()).unwrap();
        let blocks: Vec<_> = (0..4).map(|_| pool.alloc(64, 16)).collect();
        assert!(pool.is_full());
        for b in &blocks {
            assert_eq!(b.as_ptr() as usize % 16, 0);
            assert_eq!(unsafe { *b.as_ptr() }, 0xBB);
        }
        assert!(pool.try_alloc(8, 8).is_err());
        for b in &blocks {
            unsafe { pool.free(b.as_ptr()) };
        }
        assert!(pool.is_empty());
        assert!(pool.validate_heap());

        let stats = pool.stats().unwrap();
        assert_eq!(stats.total_allocs, 4);
        assert_eq!(stats.total_deallocs, 4);
        assert_eq!(stats.peak_usage, 4 * 64);
        assert_eq!(stats.current_usage, 0);
    }

    #[test]
    fn test_oversized_and_overaligned_requests_are_refused() {
        let pool = AtomicPoolAllocator::new(32, 8, 2).unwrap();
        assert!(matches!(
            pool.try_alloc(33, 8),
            Err(MemoryError::ExceedsMaxSize { .. })
        ));
        assert!(matches!(
            pool.try_alloc(16, 64),
            Err(MemoryError::InvalidAlignment { .. })
        ));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_realloc_within_block() {
        let pool = AtomicPoolAllocator::new(64, 8, 2).unwrap();
        let p = pool.alloc(8, 8);
        unsafe {
            assert_eq!(pool.realloc(p.as_ptr(), 8, 64, 8), p);
            assert!(pool.try_realloc(p.as_ptr(), 64, 65, 8).is_err());
            assert_eq!(pool.allocation_size(p.as_ptr()), Some(64));
        }
    }

    #[test]
    fn test_reset_returns_every_block() {
        let mut pool = AtomicPoolAllocator::with_config(16, 8, 3, PoolConfig::production()).unwrap();
        pool.alloc(16, 8);
        pool.alloc(16, 8);
        pool.reset();
        assert!(pool.is_empty());
        assert!(pool.validate_heap());
        assert!(pool.stats().is_none());
    }

    #[test]
    #[should_panic(expected = "pool full")]
    fn test_alloc_when_full_faults() {
        let _guard = scoped_assert_handler(panicking_assert_handler);
        let pool = AtomicPoolAllocator::new(16, 8, 1).unwrap();
        pool.alloc(16, 8);
        pool.alloc(16, 8);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_faults() {
        let _guard = scoped_assert_handler(panicking_assert_handler);
        let pool = AtomicPoolAllocator::new(16, 8, 2).unwrap();
        let p = pool.alloc(16, 8);
        unsafe {
            pool.free(p.as_ptr());
            pool.free(p.as_ptr());
        }
    }

    #[test]
    #[should_panic(expected = "block boundary")]
    fn test_interior_pointer_free_faults() {
        let _guard = scoped_assert_handler(panicking_assert_handler);
        let pool = AtomicPoolAllocator::new(16, 8, 2).unwrap();
        let p = pool.alloc(16, 8);
        unsafe { pool.free(p.as_ptr().add(4)) };
    }
}
