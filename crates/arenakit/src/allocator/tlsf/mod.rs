//! Two-Level Segregated Fit allocator over caller-provided pools
//!
//! O(1) allocate, free and reallocate with one word of overhead per block.
//! The bookkeeping lives at the front of the first buffer handed to
//! [`TlsfAllocator::new`]; further discontiguous buffers can be registered
//! with [`TlsfAllocator::add_pool`].

mod control;

use core::cell::{Cell, RefCell};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

#[cfg(feature = "logging")]
use tracing::debug;

use self::control::{
    ALIGN_SIZE, BLOCK_SIZE_MAX, BLOCK_SIZE_MIN, Block, Control, POOL_OVERHEAD, adjust_request_size,
};
use super::traits::check_align;
use super::{AllocError, AllocResult, Allocator};
use crate::error::{MemoryError, MemoryResult};
use crate::utils::{align_up, is_aligned};
use crate::{mem_assert, mem_fatal};

/// Snapshot of how a TLSF heap is carved up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapUsage {
    /// Payload bytes held by live blocks
    pub used_bytes: usize,
    /// Payload bytes sitting in free blocks
    pub free_bytes: usize,
    /// Registered pools
    pub pools: usize,
}

/// General-purpose allocator with bounded-time operations
///
/// Not thread-safe; wrap it in `SyncedTlsfAllocator` to share it.
pub struct TlsfAllocator<'a> {
    control: NonNull<Control>,
    pools: RefCell<Vec<NonNull<u8>>>,
    live: Cell<usize>,
    _pools: PhantomData<&'a mut [u8]>,
}

impl<'a> TlsfAllocator<'a> {
    /// Smallest buffer [`TlsfAllocator::new`] accepts
    pub const MIN_BUFFER_SIZE: usize =
        size_of::<Control>() + align_of::<Control>() + POOL_OVERHEAD + BLOCK_SIZE_MIN;

    /// Place the allocator at the front of `buffer` and manage the rest.
    ///
    /// # Errors
    /// `InvalidConfig` when `buffer` is smaller than
    /// [`TlsfAllocator::MIN_BUFFER_SIZE`].
    pub fn new(buffer: &'a mut [u8]) -> MemoryResult<Self> {
        let len = buffer.len();
        if len < Self::MIN_BUFFER_SIZE {
            return Err(MemoryError::invalid_config(&format!(
                "tlsf buffer of {len} bytes is below the minimum of {}",
                Self::MIN_BUFFER_SIZE
            )));
        }
        let start = buffer.as_mut_ptr();
        let skip = align_up(start as usize, align_of::<Control>()) - start as usize;
        // SAFETY: Placing the control block.
        // - skip < align_of::<Control>() and len covers Control plus that slack
        // - the pointer is aligned for Control after skipping
        let control = unsafe {
            let at = start.add(skip).cast::<Control>();
            at.write(Control::new());
            NonNull::new_unchecked(at)
        };
        let pool_offset = skip + size_of::<Control>();

        let tlsf = Self {
            control,
            pools: RefCell::new(Vec::new()),
            live: Cell::new(0),
            _pools: PhantomData,
        };
        // SAFETY: the rest of the buffer is borrowed for 'a and unused
        unsafe { tlsf.register_pool(start.add(pool_offset), len - pool_offset)? };

        #[cfg(feature = "logging")]
        debug!(buffer = len, "tlsf allocator initialized");
        Ok(tlsf)
    }

    /// Register another buffer to allocate from.
    ///
    /// # Errors
    /// `InvalidConfig` when the buffer is too small for a single block or
    /// larger than the biggest block size class.
    pub fn add_pool(&self, pool: &'a mut [u8]) -> MemoryResult<()> {
        // SAFETY: pool is borrowed for 'a and handed over entirely
        unsafe { self.register_pool(pool.as_mut_ptr(), pool.len()) }
    }

    /// # Safety
    /// `mem..mem + len` must stay valid and otherwise unused for `'a`.
    unsafe fn register_pool(&self, mem: *mut u8, len: usize) -> MemoryResult<()> {
        let skip = align_up(mem as usize, ALIGN_SIZE) - mem as usize;
        let usable = len.saturating_sub(skip);
        let block_bytes = usable.saturating_sub(POOL_OVERHEAD) & !(ALIGN_SIZE - 1);
        if block_bytes < BLOCK_SIZE_MIN || block_bytes > BLOCK_SIZE_MAX {
            return Err(MemoryError::invalid_config(&format!(
                "tlsf pool of {len} bytes must hold between {} and {} bytes of blocks",
                BLOCK_SIZE_MIN, BLOCK_SIZE_MAX
            )));
        }
        // SAFETY: Formatting the pool.
        // - skip < ALIGN_SIZE <= len, so the aligned start is inside the pool
        // - usable bytes from there are exclusively ours (caller contract)
        unsafe {
            let aligned = mem.add(skip);
            (*self.control.as_ptr()).add_pool(aligned, usable);
            self.pools
                .borrow_mut()
                .push(NonNull::new_unchecked(aligned));
        }

        #[cfg(feature = "logging")]
        debug!(bytes = block_bytes, "tlsf pool added");
        Ok(())
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.live.get()
    }

    /// Walk every pool and tally used and free payload bytes.
    pub fn usage(&self) -> HeapUsage {
        let pools = self.pools.borrow();
        let mut usage = HeapUsage {
            pools: pools.len(),
            ..HeapUsage::default()
        };
        for pool in pools.iter() {
            // SAFETY: every registered pool was formatted by add_pool
            match unsafe { Control::walk_pool(pool.as_ptr()) } {
                Ok((used, free)) => {
                    usage.used_bytes += used;
                    usage.free_bytes += free;
                }
                Err(reason) => mem_fatal!("tlsf heap corrupted: {reason}"),
            }
        }
        usage
    }

    #[allow(clippy::mut_from_ref)]
    #[inline]
    fn control(&self) -> &mut Control {
        // SAFETY: Exclusive access to the control block.
        // - TlsfAllocator is !Sync, so only one thread reaches this
        // - no method holds the returned reference across another call
        unsafe { &mut *self.control.as_ptr() }
    }

    fn request_error(size: usize, align: usize) -> AllocError {
        if adjust_request_size(size, ALIGN_SIZE).is_none() {
            AllocError::allocation_too_large(size, BLOCK_SIZE_MAX)
        } else {
            AllocError::allocation_failed(size, align)
        }
    }
}

impl core::fmt::Debug for TlsfAllocator<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TlsfAllocator")
            .field("pools", &self.pools.borrow().len())
            .field("live", &self.live.get())
            .finish()
    }
}

// SAFETY: the allocator owns no thread-bound state; the pools it manages
// are plain memory borrowed for 'a.
unsafe impl Send for TlsfAllocator<'_> {}

// SAFETY: TlsfAllocator hands out disjoint blocks.
// - a block leaves the free lists before it is returned
// - split remainders and merges never touch a used block's payload
// - every pool is exclusively borrowed for 'a
unsafe impl Allocator for TlsfAllocator<'_> {
    fn name(&self) -> &str {
        "tlsf"
    }

    fn try_alloc(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        check_align(align)?;
        let control = self.control();
        // SAFETY: the control block only ever sees pools formatted by add_pool
        let ptr = unsafe {
            if align <= ALIGN_SIZE {
                control.malloc(size)
            } else {
                control.memalign(align, size)
            }
        };
        let ptr = ptr
            .and_then(NonNull::new)
            .ok_or_else(|| Self::request_error(size, align))?;
        self.live.set(self.live.get() + 1);
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: ptr is a block of this allocator (caller contract)
        let released = unsafe { self.control().free(ptr) };
        mem_assert!(released, "tlsf double free of {ptr:p}");
        self.live.set(self.live.get() - 1);
    }

    unsafe fn try_realloc(
        &self,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> AllocResult<NonNull<u8>> {
        if ptr.is_null() {
            return self.try_alloc(new_size, align);
        }
        check_align(align)?;
        if is_aligned(ptr as usize, align) {
            // SAFETY: ptr is a live block (caller contract)
            if let Some(resized) = unsafe { self.control().realloc_in_place(ptr, new_size) } {
                // SAFETY: resized == ptr, which is non-null
                return Ok(unsafe { NonNull::new_unchecked(resized) });
            }
        }
        let moved = self.try_alloc(new_size, align)?;
        // SAFETY: moved is a fresh block disjoint from ptr
        unsafe {
            ptr::copy_nonoverlapping(ptr, moved.as_ptr(), old_size.min(new_size));
            self.free(ptr);
        }
        Ok(moved)
    }

    unsafe fn allocation_size(&self, ptr: *const u8) -> Option<usize> {
        // SAFETY: ptr is a live block, its header sits right before it
        Some(unsafe { Block::from_ptr(ptr.cast_mut()).size() })
    }

    fn validate_heap(&self) -> bool {
        // SAFETY: the control block is only reachable through self
        if let Err(reason) = unsafe { self.control().check() } {
            mem_fatal!("tlsf heap corrupted: {reason}");
        }
        let _ = self.usage();
        true
    }
}
