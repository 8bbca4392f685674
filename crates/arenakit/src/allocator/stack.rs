//! LIFO allocator over a borrowed buffer
//!
//! Same bump strategy as [`super::LinearAllocator`], but every allocation is
//! preceded by a [`StackHeader`] carrying its padding and a monotonically
//! increasing id. Only the most recent allocation may be freed or resized in
//! place.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use super::header::StackHeader;
use super::traits::check_align;
use super::{AllocError, AllocResult, Allocator};
use crate::{mem_assert, mem_debug_assert};

/// Stack allocator with LIFO deallocation
///
/// # Memory Layout
/// ```text
/// [hdr|A.....][pad|hdr|B.....][free space.......]
/// ^begin                      ^head             ^end
/// ```
pub struct StackAllocator<'a> {
    begin: NonNull<u8>,
    capacity: usize,
    head: Cell<usize>,
    last_alloc_id: Cell<u32>,
    _buffer: PhantomData<&'a mut [u8]>,
}

impl<'a> StackAllocator<'a> {
    /// Stack-allocate out of `buffer`.
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            capacity: buffer.len(),
            begin: NonNull::from(buffer).cast(),
            head: Cell::new(0),
            last_alloc_id: Cell::new(0),
            _buffer: PhantomData,
        }
    }

    /// Drop every allocation at once.
    pub fn reset(&mut self) {
        self.head.set(0);
        self.last_alloc_id.set(0);
    }

    /// Bytes consumed so far, headers and padding included
    pub fn allocated_size(&self) -> usize {
        self.head.get()
    }

    /// Total buffer size
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of outstanding allocations
    pub fn depth(&self) -> u32 {
        self.last_alloc_id.get()
    }

    /// Check if a pointer lies inside the buffer
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let begin = self.begin.as_ptr() as usize;
        addr >= begin && addr <= begin + self.capacity
    }

    fn offset_of(&self, ptr: *const u8) -> usize {
        ptr as usize - self.begin.as_ptr() as usize
    }

    /// Header of the allocation at `ptr`, asserting it belongs here.
    ///
    /// # Safety
    /// `ptr` must be a payload handed out by this allocator.
    unsafe fn header_of(&self, ptr: *mut u8) -> StackHeader {
        mem_assert!(
            self.contains(ptr) && self.offset_of(ptr) >= StackHeader::SIZE,
            "pointer {ptr:p} was not allocated by this stack allocator"
        );
        // SAFETY: caller contract, header precedes every payload
        unsafe { StackHeader::read_before(ptr) }
    }
}

impl core::fmt::Debug for StackAllocator<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StackAllocator")
            .field("capacity", &self.capacity)
            .field("allocated", &self.head.get())
            .field("depth", &self.last_alloc_id.get())
            .finish()
    }
}

// SAFETY: the buffer is exclusively borrowed for 'a; nothing ties the
// allocator to the thread that created it.
unsafe impl Send for StackAllocator<'_> {}

// SAFETY: StackAllocator hands out disjoint slices of its buffer.
// - allocations are laid out in increasing address order
// - frees only ever rewind past the most recent allocation
// - bounds are checked against capacity before the head moves
unsafe impl Allocator for StackAllocator<'_> {
    fn name(&self) -> &str {
        "stack"
    }

    fn try_alloc(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        check_align(align)?;
        let begin = self.begin.as_ptr() as usize;
        let head = self.head.get();
        let payload = StackHeader::payload_addr(begin + head, align)
            .ok_or_else(|| AllocError::invalid_alignment(align))?;
        let offset = payload - begin;
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= self.capacity)
            .ok_or_else(|| AllocError::arena_exhausted("stack", size, self.capacity - head))?;

        let alloc_id = self.last_alloc_id.get() + 1;
        // SAFETY: Writing the header and handing out the payload.
        // - offset >= head + SIZE, so the header lies in head..offset
        // - end <= capacity keeps the payload inside the buffer
        let ptr = unsafe {
            let ptr = self.begin.add(offset);
            StackHeader::write_before(
                ptr.as_ptr(),
                StackHeader {
                    padding: (offset - head) as u32,
                    alloc_id,
                },
            );
            ptr
        };
        self.last_alloc_id.set(alloc_id);
        self.head.set(end);
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
            "stack allocator freed out of order: allocation #{} is not the most recent (#{})",
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

        if is_top && (ptr as usize).is_multiple_of(align) {
            let offset = self.offset_of(ptr);
            let end = offset
                .checked_add(new_size)
                .filter(|&end| end <= self.capacity)
                .ok_or_else(|| {
                    AllocError::arena_exhausted("stack", new_size, self.capacity - offset)
                })?;
            self.head.set(end);
            // SAFETY: ptr is non-null (checked above)
            return Ok(unsafe { NonNull::new_unchecked(ptr) });
        }

        if is_top {
            // Alignment grew: slide the top block to a suitably aligned spot
            // starting from where it was originally carved out.
            let begin = self.begin.as_ptr() as usize;
            let start = self.offset_of(ptr) - header.padding as usize;
            let payload = StackHeader::payload_addr(begin + start, align)
                .ok_or_else(|| AllocError::invalid_alignment(align))?;
            let offset = payload - begin;
            let end = offset
                .checked_add(new_size)
                .filter(|&end| end <= self.capacity)
                .ok_or_else(|| AllocError::arena_exhausted("stack", new_size, self.capacity - start))?;
            // SAFETY: Moving the payload, then rewriting its header.
            // - source and destination may overlap, hence `copy`
            // - the header is written after the move so it cannot clobber
            //   payload bytes that are still to be copied
            // - end <= capacity keeps the block in the buffer
            unsafe {
                let new_ptr = self.begin.add(offset);
                ptr::copy(ptr, new_ptr.as_ptr(), old_size.min(new_size));
                StackHeader::write_before(
                    new_ptr.as_ptr(),
                    StackHeader {
                        padding: (offset - start) as u32,
                        alloc_id: header.alloc_id,
                    },
                );
                self.head.set(end);
                return Ok(new_ptr);
            }
        }

        mem_debug_assert!(
            is_top,
            "stack allocator reallocated allocation #{} which is not the most recent (#{})",
            header.alloc_id,
            self.last_alloc_id.get()
        );
        // Release builds copy into a new top block. The old block cannot be
        // freed out of order and stays in place until reset.
        let new_ptr = self.try_alloc(new_size, align)?;
        // SAFETY: the new block lies past every live allocation
        unsafe {
            ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), old_size.min(new_size));
        }
        Ok(new_ptr)
    }

    unsafe fn allocation_size(&self, ptr: *const u8) -> Option<usize> {
        // SAFETY: caller contract
        let header = unsafe { StackHeader::read_before(ptr) };
        (header.alloc_id == self.last_alloc_id.get()).then(|| self.head.get() - self.offset_of(ptr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assert::{panicking_assert_handler, scoped_assert_handler};

    #[test]
    fn test_lifo_free_returns_head_to_start() {
        let mut buf = [0u8; 512];
        let alloc = StackAllocator::new(&mut buf);
        let a = alloc.alloc(40, 8);
        let b = alloc.alloc(24, 16);
        assert_eq!(alloc.depth(), 2);
        unsafe {
            alloc.free(b.as_ptr());
            alloc.free(a.as_ptr());
        }
        assert_eq!(alloc.allocated_size(), 0);
        assert_eq!(alloc.depth(), 0);
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn test_out_of_order_free_faults() {
        let _guard = scoped_assert_handler(panicking_assert_handler);
        let mut buf = [0u8; 512];
        let alloc = StackAllocator::new(&mut buf);
        let a = alloc.alloc(40, 8);
        let _b = alloc.alloc(40, 8);
        unsafe { alloc.free(a.as_ptr()) };
    }

    #[test]
    fn test_realloc_top_in_place() {
        let mut buf = [0u8; 512];
        let alloc = StackAllocator::new(&mut buf);
        let a = alloc.alloc(16, 8);
        unsafe {
            a.as_ptr().write_bytes(0x11, 16);
            let grown = alloc.realloc(a.as_ptr(), 16, 200, 8);
            assert_eq!(grown, a);
            assert_eq!(alloc.allocation_size(grown.as_ptr()), Some(200));
            let shrunk = alloc.realloc(grown.as_ptr(), 200, 8, 8);
            assert_eq!(shrunk, a);
            assert_eq!(*shrunk.as_ptr().add(7), 0x11);
            alloc.free(shrunk.as_ptr());
        }
        assert_eq!(alloc.allocated_size(), 0);
    }

    #[test]
    fn test_realloc_top_with_larger_alignment_moves_and_stays_freeable() {
        let mut buf = [0u8; 1024];
        let alloc = StackAllocator::new(&mut buf);
        let a = alloc.alloc(8, 1);
        unsafe {
            a.as_ptr().write_bytes(0x22, 8);
            let moved = alloc.realloc(a.as_ptr(), 8, 8, 256);
            assert_eq!(moved.as_ptr() as usize % 256, 0);
            assert_eq!(*moved.as_ptr(), 0x22);
            assert_eq!(alloc.depth(), 1);
            alloc.free(moved.as_ptr());
        }
        assert_eq!(alloc.allocated_size(), 0);
    }

    #[test]
    fn test_realloc_past_end_is_an_error() {
        let mut buf = [0u8; 128];
        let alloc = StackAllocator::new(&mut buf);
        let a = alloc.alloc(16, 8);
        let err = unsafe { alloc.try_realloc(a.as_ptr(), 16, 4096, 8) }.unwrap_err();
        assert_eq!(err.code(), "MEM:ARENA:EXHAUSTED");
    }

    #[test]
    #[should_panic(expected = "not the most recent")]
    #[cfg(debug_assertions)]
    fn test_realloc_non_top_faults_in_debug() {
        let _guard = scoped_assert_handler(panicking_assert_handler);
        let mut buf = [0u8; 512];
        let alloc = StackAllocator::new(&mut buf);
        let a = alloc.alloc(16, 8);
        let _b = alloc.alloc(16, 8);
        let _ = unsafe { alloc.try_realloc(a.as_ptr(), 16, 32, 8) };
    }
}
