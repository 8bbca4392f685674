use core::cell::Cell;
use core::ptr::{self, NonNull};

#[cfg(feature = "logging")]
use tracing::debug;

use super::{VirtualConfig, VirtualRegion};
use crate::allocator::traits::check_align;
use crate::allocator::{AllocError, AllocResult, Allocator};
use crate::error::MemoryResult;
use crate::platform::{OsVirtualMemory, VirtualMemory};
use crate::utils::checked_align_up;

/// Bump allocator over a growing virtual reservation
///
/// # Memory Layout
/// ```text
/// [allocated.....][free, committed][reserved, not committed.........]
/// ^base           ^head            ^physical end                    ^virtual end
/// ```
pub struct VirtualLinearAllocator<V: VirtualMemory = OsVirtualMemory> {
    region: VirtualRegion<V>,
    head: Cell<usize>,
    /// Offset of the most recent allocation, resizable in place
    last: Cell<Option<usize>>,
}

impl VirtualLinearAllocator {
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

impl<V: VirtualMemory> VirtualLinearAllocator<V> {
    /// Same as [`VirtualLinearAllocator::with_config`] on a custom backend.
    ///
    /// # Errors
    /// `InvalidConfig` when `config` does not validate.
    pub fn with_backend(vm: V, config: VirtualConfig) -> MemoryResult<Self> {
        let region = VirtualRegion::reserve(vm, &config)?;

        #[cfg(feature = "logging")]
        debug!(
            max_size_bytes = region.reserved(),
            chunk_size_bytes = region.chunk(),
            "virtual linear allocator initialized"
        );

        Ok(Self {
            region,
            head: Cell::new(0),
            last: Cell::new(None),
        })
    }

    /// Rewind to the start. Committed memory is kept for reuse.
    pub fn reset(&mut self) {
        self.head.set(0);
        self.last.set(None);
    }

    /// Return committed chunks past the current head to the OS.
    pub fn decommit_idle_memory(&self) {
        self.region.decommit_beyond(self.head.get());
    }

    /// Release the whole reservation. Any further allocation is fatal.
    pub fn destroy(&mut self) {
        self.region.release();
        self.head.set(0);
        self.last.set(None);

        #[cfg(feature = "logging")]
        debug!("virtual linear allocator destroyed");
    }

    /// Committed bytes, always a multiple of the chunk size
    pub fn physical_size_bytes(&self) -> usize {
        self.region.committed()
    }

    /// Reserved bytes
    pub fn virtual_size_bytes(&self) -> usize {
        self.region.reserved()
    }

    /// Effective commit granularity
    pub fn chunk_size_bytes(&self) -> usize {
        self.region.chunk()
    }

    /// Bytes consumed so far, padding included
    pub fn allocated_size(&self) -> usize {
        self.head.get()
    }

    /// The virtual-memory backend
    pub fn backend(&self) -> &V {
        self.region.vm()
    }
}

impl<V: VirtualMemory> core::fmt::Debug for VirtualLinearAllocator<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtualLinearAllocator")
            .field("allocated", &self.head.get())
            .field("physical", &self.region.committed())
            .field("virtual", &self.region.reserved())
            .finish()
    }
}

// SAFETY: VirtualLinearAllocator hands out disjoint, committed ranges.
// - allocations start at or after the previous head
// - grow_to commits through the end of a block before it is returned
// - chunks are only decommitted past the head
unsafe impl<V: VirtualMemory> Allocator for VirtualLinearAllocator<V> {
    fn name(&self) -> &str {
        "virtual_linear"
    }

    fn try_alloc(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        check_align(align)?;
        let base = self.region.base();
        let begin = base.as_ptr() as usize;
        let offset = checked_align_up(begin + self.head.get(), align)
            .map(|aligned| aligned - begin)
            .ok_or_else(|| AllocError::size_overflow("virtual linear alignment"))?;
        let end = offset
            .checked_add(size)
            .ok_or_else(|| AllocError::size_overflow("virtual linear allocation"))?;
        self.region.grow_to(end)?;

        self.head.set(end);
        self.last.set(Some(offset));
        // SAFETY: offset <= end <= reserved, inside the reservation
        Ok(unsafe { base.add(offset) })
    }

    unsafe fn free(&self, _ptr: *mut u8) {}

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
        let base = self.region.base();
        let offset = ptr as usize - base.as_ptr() as usize;
        if self.last.get() == Some(offset) && (ptr as usize).is_multiple_of(align) {
            let end = offset
                .checked_add(new_size)
                .ok_or_else(|| AllocError::size_overflow("virtual linear allocation"))?;
            self.region.grow_to(end)?;
            self.head.set(end);
            // SAFETY: ptr is non-null (checked above)
            return Ok(unsafe { NonNull::new_unchecked(ptr) });
        }

        let moved = self.try_alloc(new_size, align)?;
        // SAFETY: moved lies past every earlier allocation
        unsafe { ptr::copy_nonoverlapping(ptr, moved.as_ptr(), old_size.min(new_size)) };
        Ok(moved)
    }

    unsafe fn allocation_size(&self, ptr: *const u8) -> Option<usize> {
        let offset = ptr as usize - self.region.base().as_ptr() as usize;
        (self.last.get() == Some(offset)).then(|| self.head.get() - offset)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::CountingVm;
    use super::*;
    use crate::assert::{panicking_assert_handler, scoped_assert_handler};

    const KIB: usize = 1024;
    const MIB: usize = 1024 * KIB;

    #[test]
    fn test_commits_one_chunk_per_boundary_crossed() {
        let alloc =
            VirtualLinearAllocator::with_backend(CountingVm::default(), VirtualConfig::new(MIB, 64 * KIB))
                .unwrap();
        assert_eq!(alloc.physical_size_bytes(), 0);

        alloc.alloc(10, 8);
        assert_eq!(*alloc.backend().commits.borrow(), vec![64 * KIB]);

        alloc.alloc(100_000, 8);
        assert_eq!(*alloc.backend().commits.borrow(), vec![64 * KIB, 64 * KIB]);
        assert_eq!(alloc.physical_size_bytes(), 128 * KIB);
        assert_eq!(alloc.physical_size_bytes() % alloc.chunk_size_bytes(), 0);
    }

    #[test]
    fn test_committed_memory_is_writable() {
        let alloc = VirtualLinearAllocator::new(MIB, 64 * KIB).unwrap();
        let p = alloc.alloc(200 * KIB, 64);
        assert_eq!(p.as_ptr() as usize % 64, 0);
        unsafe {
            p.as_ptr().write_bytes(0xAB, 200 * KIB);
            assert_eq!(*p.as_ptr().add(200 * KIB - 1), 0xAB);
        }
    }

    #[test]
    fn test_exhausting_reservation_is_an_error() {
        let alloc = VirtualLinearAllocator::new(MIB, 64 * KIB).unwrap();
        alloc.alloc(MIB - 16, 8);
        let err = alloc.try_alloc(32, 8).unwrap_err();
        assert_eq!(err.code(), "MEM:ARENA:EXHAUSTED");
    }

    #[test]
    fn test_realloc_last_grows_in_place() {
        let alloc = VirtualLinearAllocator::new(MIB, 64 * KIB).unwrap();
        let p = alloc.alloc(100, 8);
        unsafe {
            let grown = alloc.realloc(p.as_ptr(), 100, 150 * KIB, 8);
            assert_eq!(grown, p);
            assert_eq!(alloc.allocation_size(grown.as_ptr()), Some(150 * KIB));
        }
        assert_eq!(alloc.physical_size_bytes(), 192 * KIB);
    }

    #[test]
    fn test_decommit_idle_memory_keeps_frontier() {
        let mut alloc =
            VirtualLinearAllocator::with_backend(CountingVm::default(), VirtualConfig::new(MIB, 64 * KIB))
                .unwrap();
        alloc.alloc(300 * KIB, 8);
        alloc.reset();
        alloc.alloc(10, 8);
        alloc.decommit_idle_memory();
        assert_eq!(alloc.physical_size_bytes(), 64 * KIB);
        assert_eq!(*alloc.backend().decommits.borrow(), vec![256 * KIB]);
    }

    #[test]
    #[should_panic(expected = "after destroy")]
    fn test_alloc_after_destroy_faults() {
        let _guard = scoped_assert_handler(panicking_assert_handler);
        let mut alloc = VirtualLinearAllocator::new(MIB, 64 * KIB).unwrap();
        alloc.destroy();
        let _ = alloc.try_alloc(8, 8);
    }
}
