use core::cell::Cell;
use core::ptr::{self, NonNull};

#[cfg(feature = "logging")]
use tracing::debug;

use super::{VirtualConfig, VirtualRegion};
use crate::allocator::header::StackHeader;
use crate::allocator::traits::check_align;
use crate::allocator::{AllocError, AllocResult, Allocator};
use crate::error::MemoryResult;
use crate::platform::{OsVirtualMemory, VirtualMemory};
use crate::{mem_assert, mem_debug_assert};

/// LIFO allocator over a growing virtual reservation
///
/// Allocations carry the same header as [`crate::allocator::StackAllocator`]
/// and must be freed in reverse order.
pub struct VirtualStackAllocator<V: VirtualMemory = OsVirtualMemory> {
    region: VirtualRegion<V>,
    head: Cell<usize>,
    last_alloc_id: Cell<u32>,
}

impl VirtualStackAllocator {
    /// Reserve `max_size_bytes` and commit in `chunk_size_bytes` steps.
    ///
    /// # Errors
    /// `InvalidConfig` when the chunk size is not a power of two.
    pub fn new(max_size_bytes: usize, chunk_size_bytes: usize) -> MemoryResult<Self> {
        Self::with_config(VirtualConfig::new(max_size_bytes, chunk_size_bytes))
    }

    /// # Errors
    /// `InvalidConfig` when `config` does not validate.
    pub fn with_config(config: VirtualConfig) -> MemoryResult<Self> {
        Self::with_backend(OsVirtualMemory, config)
    }
}

impl<V: VirtualMemory> VirtualStackAllocator<V> {
    /// # Errors
    /// `InvalidConfig` when `config` does not validate.
    pub fn with_backend(vm: V, config: VirtualConfig) -> MemoryResult<Self> {
        let region = VirtualRegion::reserve(vm, &config)?;

        #[cfg(feature = "logging")]
        debug!(
            max_size_bytes = region.reserved(),
            chunk_size_bytes = region.chunk(),
            "virtual stack allocator initialized"
        );

        Ok(Self {
            region,
            head: Cell::new(0),
            last_alloc_id: Cell::new(0),
        })
    }

    /// Drop every allocation at once. Committed memory is kept.
    pub fn reset(&mut self) {
        self.head.set(0);
        self.last_alloc_id.set(0);
    }

    /// Return committed chunks past the current head to the OS.
    pub fn decommit_idle_memory(&self) {
        self.region.decommit_beyond(self.head.get());
    }

    /// Release the whole reservation. Any further allocation is fatal.
    pub fn destroy(&mut self) {
        self.region.release();
        self.reset();

        #[cfg(feature = "logging")]
        debug!("virtual stack allocator destroyed");
    }

    pub fn physical_size_bytes(&self) -> usize {
        self.region.committed()
    }

    pub fn virtual_size_bytes(&self) -> usize {
        self.region.reserved()
    }

    pub fn chunk_size_bytes(&self) -> usize {
        self.region.chunk()
    }

    pub fn allocated_size(&self) -> usize {
        self.head.get()
    }

    /// Number of outstanding allocations
    pub fn depth(&self) -> u32 {
        self.last_alloc_id.get()
    }

    pub fn backend(&self) -> &V {
        self.region.vm()
    }

    fn offset_of(&self, ptr: *const u8) -> usize {
        ptr as usize - self.region.base().as_ptr() as usize
    }

    /// # Safety
    /// `ptr` must be a payload handed out by this allocator.
    unsafe fn header_of(&self, ptr: *mut u8) -> StackHeader {
        let begin = self.region.base().as_ptr() as usize;
        let addr = ptr as usize;
        mem_assert!(
            addr >= begin + StackHeader::SIZE && addr <= begin + self.head.get(),
            "pointer {ptr:p} was not allocated by this virtual stack allocator"
        );
        // SAFETY: caller contract, header precedes every payload
        unsafe { StackHeader::read_before(ptr) }
    }

    /// Payload offset and end for a block whose header starts at `start`.
    /// Commits through the end; the head does not move.
    fn carve(&self, start: usize, size: usize, align: usize) -> AllocResult<(usize, usize)> {
        let begin = self.region.base().as_ptr() as usize;
        let payload = StackHeader::payload_addr(begin + start, align)
            .ok_or_else(|| AllocError::invalid_alignment(align))?;
        let offset = payload - begin;
        let end = offset
            .checked_add(size)
            .ok_or_else(|| AllocError::size_overflow("virtual stack allocation"))?;
        self.region.grow_to(end)?;
        Ok((offset, end))
    }

    /// Write the header for a carved block and make it the top.
    ///
    /// # Safety
    /// `start`, `offset` and `end` must come from [`Self::carve`].
    unsafe fn stamp(&self, start: usize, offset: usize, end: usize, alloc_id: u32) -> NonNull<u8> {
        // SAFETY: Writing the header.
        // - offset >= start + SIZE, so the header lies in start..offset
        // - carve committed everything up to end
        let ptr = unsafe {
            let ptr = self.region.base().add(offset);
            StackHeader::write_before(
                ptr.as_ptr(),
                StackHeader {
                    padding: (offset - start) as u32,
                    alloc_id,
                },
            );
            ptr
        };
        self.head.set(end);
        ptr
    }
}

impl<V: VirtualMemory> core::fmt::Debug for VirtualStackAllocator<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtualStackAllocator")
            .field("allocated", &self.head.get())
            .field("depth", &self.last_alloc_id.get())
            .field("physical", &self.region.committed())
            .field("virtual", &self.region.reserved())
            .finish()
    }
}

// SAFETY: VirtualStackAllocator hands out disjoint, committed ranges.
// - blocks are laid out in increasing address order
// - frees only rewind past the most recent block
// - grow_to commits through the end of a block before it is returned
unsafe impl<V: VirtualMemory> Allocator for VirtualStackAllocator<V> {
    fn name(&self) -> &str {
        "virtual_stack"
    }

    fn try_alloc(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        check_align(align)?;
        let start = self.head.get();
        let (offset, end) = self.carve(start, size, align)?;
        let alloc_id = self.last_alloc_id.get() + 1;
        // SAFETY: offset and end were just carved from start
        let ptr = unsafe { self.stamp(start, offset, end, alloc_id) };
        self.last_alloc_id.set(alloc_id);
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: caller contract
        let header = unsafe { self.header_of(ptr) };
        mem_assert!(
            header.alloc_id == self.last_alloc_id.get(),
            "virtual stack allocator freed out of order: allocation #{} is not the most recent (#{})",
            header.alloc_id,
            self.last_alloc_id.get()
        );
        self.last_alloc_id.set(header.alloc_id - 1);
        self.head.set(self.offset_of(ptr) - header.padding as usize);
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
        // SAFETY: caller contract
        let header = unsafe { self.header_of(ptr) };
        let is_top = header.alloc_id == self.last_alloc_id.get();

        if is_top {
            let start = self.offset_of(ptr) - header.padding as usize;
            if (ptr as usize).is_multiple_of(align) {
                let end = self
                    .offset_of(ptr)
                    .checked_add(new_size)
                    .ok_or_else(|| AllocError::size_overflow("virtual stack allocation"))?;
                self.region.grow_to(end)?;
                self.head.set(end);
                // SAFETY: ptr is non-null (checked above)
                return Ok(unsafe { NonNull::new_unchecked(ptr) });
            }
            // Alignment grew: re-carve from the block's original start. The
            // ranges may overlap, and the header goes in after the move so it
            // cannot clobber bytes still to be copied.
            let (offset, end) = self.carve(start, new_size, align)?;
            // SAFETY: both ranges lie inside committed memory
            unsafe {
                let dst = self.region.base().add(offset);
                ptr::copy(ptr, dst.as_ptr(), old_size.min(new_size));
                return Ok(self.stamp(start, offset, end, header.alloc_id));
            }
        }

        mem_debug_assert!(
            is_top,
            "virtual stack allocator reallocated allocation #{} which is not the most recent (#{})",
            header.alloc_id,
            self.last_alloc_id.get()
        );
        let new_ptr = self.try_alloc(new_size, align)?;
        // SAFETY: the new block lies past every live allocation
        unsafe { ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), old_size.min(new_size)) };
        Ok(new_ptr)
    }

    unsafe fn allocation_size(&self, ptr: *const u8) -> Option<usize> {
        // SAFETY: caller contract
        let header = unsafe { StackHeader::read_before(ptr) };
        (header.alloc_id == self.last_alloc_id.get()).then(|| self.head.get() - self.offset_of(ptr))
    }
}
