//! Process-wide default allocator
//!
//! Wraps the platform heap (`std::alloc::System`). Blocks carry a small
//! header just in front of the payload recording the payload size and the
//! layout used for the underlying call, so `free` needs only the pointer.
//!
//! [`system_allocator`] hands out a `'static` instance. It is a zero-sized
//! constant with no destructor, so it stays usable while statics are torn
//! down at process exit.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use std::alloc::System;

use super::traits::check_align;
use super::{AllocError, AllocResult, Allocator};
use crate::utils::align_up;

#[repr(C)]
#[derive(Clone, Copy)]
struct BlockHeader {
    /// Requested payload size
    size: usize,
    /// Offset from the underlying block start to the payload
    offset: usize,
    /// Alignment passed to the platform allocator
    align: usize,
}

const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Wrapper for the system's default allocator
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAllocator;

static SYSTEM_ALLOCATOR: SystemAllocator = SystemAllocator;

/// The process-wide default allocator.
#[inline]
pub fn system_allocator() -> &'static SystemAllocator {
    &SYSTEM_ALLOCATOR
}

impl SystemAllocator {
    /// Creates a new SystemAllocator
    #[inline]
    pub const fn new() -> Self {
        Self
    }

    fn block_layout(size: usize, align: usize) -> AllocResult<(Layout, usize)> {
        let block_align = align.max(align_of::<BlockHeader>());
        let offset = align_up(HEADER_SIZE, block_align);
        let total = size
            .checked_add(offset)
            .ok_or_else(|| AllocError::size_overflow("system allocation size"))?;
        let layout = Layout::from_size_align(total, block_align)
            .map_err(|_| AllocError::invalid_layout("system allocation layout"))?;
        Ok((layout, offset))
    }

    /// # Safety
    /// `ptr` must be a live payload pointer from this allocator.
    unsafe fn header_of(ptr: *const u8) -> *mut BlockHeader {
        // SAFETY: every payload is preceded by a header (offset >= HEADER_SIZE)
        unsafe { ptr.sub(HEADER_SIZE).cast::<BlockHeader>().cast_mut() }
    }
}

// SAFETY: SystemAllocator delegates to the platform heap.
// - Layout is built from (size + header, max(align, header align))
// - the payload sits at an offset that is a multiple of the block alignment
// - the header records everything needed to rebuild the layout on free
unsafe impl Allocator for SystemAllocator {
    fn name(&self) -> &str {
        "system"
    }

    fn try_alloc(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        check_align(align)?;
        let (layout, offset) = Self::block_layout(size, align)?;
        // SAFETY: layout has non-zero size (offset >= HEADER_SIZE)
        let base = unsafe { System.alloc(layout) };
        if base.is_null() {
            return Err(AllocError::allocation_failed(size, align));
        }
        // SAFETY: Writing the header in front of the payload.
        // - base..base + layout.size() is freshly allocated
        // - offset >= HEADER_SIZE, so the header fits before the payload
        // - payload - HEADER_SIZE is aligned for BlockHeader because both
        //   offset and HEADER_SIZE are multiples of its alignment
        unsafe {
            let payload = base.add(offset);
            Self::header_of(payload).write(BlockHeader {
                size,
                offset,
                align: layout.align(),
            });
            Ok(NonNull::new_unchecked(payload))
        }
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: ptr is a live payload (caller contract), so its header is
        // valid and describes the original layout.
        unsafe {
            let header = Self::header_of(ptr).read();
            let layout =
                Layout::from_size_align_unchecked(header.size + header.offset, header.align);
            System.dealloc(ptr.sub(header.offset), layout);
        }
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
        // SAFETY: ptr is a live payload, header describes its block
        let header = unsafe { Self::header_of(ptr).read() };
        if align > header.align {
            // The platform realloc keeps the old alignment; move instead.
            let new_ptr = self.try_alloc(new_size, align)?;
            // SAFETY: disjoint blocks, copy bounded by both sizes
            unsafe {
                core::ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), old_size.min(new_size));
                self.free(ptr);
            }
            return Ok(new_ptr);
        }

        let new_total = new_size
            .checked_add(header.offset)
            .ok_or_else(|| AllocError::size_overflow("system reallocation size"))?;
        // SAFETY: Growing or shrinking the underlying block.
        // - base and layout are exactly what try_alloc passed to System
        // - new_total is non-zero
        // - on success the payload moves with the block at the same offset
        unsafe {
            let base = ptr.sub(header.offset);
            let layout = Layout::from_size_align_unchecked(header.size + header.offset, header.align);
            let new_base = System.realloc(base, layout, new_total);
            if new_base.is_null() {
                return Err(AllocError::allocation_failed(new_size, align));
            }
            let payload = new_base.add(header.offset);
            (*Self::header_of(payload)).size = new_size;
            Ok(NonNull::new_unchecked(payload))
        }
    }

    unsafe fn allocation_size(&self, ptr: *const u8) -> Option<usize> {
        // SAFETY: ptr is a live payload (caller contract)
        Some(unsafe { Self::header_of(ptr).read().size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_allocation() {
        let allocator = system_allocator();
        let ptr = allocator.alloc(64, 8);
        unsafe {
            ptr.as_ptr().write_bytes(0x5A, 64);
            assert_eq!(allocator.allocation_size(ptr.as_ptr()), Some(64));
            allocator.free(ptr.as_ptr());
        }
    }

    #[test]
    fn test_over_aligned_allocation() {
        let allocator = SystemAllocator::new();
        for align in [16, 64, 256, 4096] {
            let ptr = allocator.alloc(24, align);
            assert_eq!(ptr.as_ptr() as usize % align, 0);
            unsafe { allocator.free(ptr.as_ptr()) };
        }
    }

    #[test]
    fn test_zero_sized_allocation_is_freeable() {
        let allocator = SystemAllocator::new();
        let ptr = allocator.alloc(0, 8);
        unsafe {
            assert_eq!(allocator.allocation_size(ptr.as_ptr()), Some(0));
            allocator.free(ptr.as_ptr());
        }
    }

    #[test]
    fn test_free_null_is_noop() {
        unsafe { system_allocator().free(core::ptr::null_mut()) };
    }

    #[test]
    fn test_realloc_preserves_contents() {
        let allocator = SystemAllocator::new();
        unsafe {
            let ptr = allocator.alloc(16, 8);
            for i in 0..16u8 {
                ptr.as_ptr().add(i as usize).write(i);
            }
            let grown = allocator.realloc(ptr.as_ptr(), 16, 4096, 8);
            for i in 0..16u8 {
                assert_eq!(*grown.as_ptr().add(i as usize), i);
            }
            assert_eq!(allocator.allocation_size(grown.as_ptr()), Some(4096));

            // Raising alignment forces a move
            let moved = allocator.realloc(grown.as_ptr(), 4096, 32, 512);
            assert_eq!(moved.as_ptr() as usize % 512, 0);
            assert_eq!(*moved.as_ptr().add(15), 15);
            allocator.free(moved.as_ptr());
        }
    }

    #[test]
    fn test_rejects_bad_alignment() {
        let err = SystemAllocator::new().try_alloc(8, 3).unwrap_err();
        assert!(matches!(err, AllocError::InvalidAlignment { alignment: 3 }));
    }

    #[test]
    fn test_validate_heap_unsupported() {
        assert!(!system_allocator().validate_heap());
    }
}
