//! Bump allocator over a borrowed buffer
//!
//! Allocation aligns the head up and advances it. Individual frees are
//! no-ops; the whole buffer is reclaimed at once by [`LinearAllocator::reset`].

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::NonNull;

use super::traits::check_align;
use super::{AllocError, AllocResult, Allocator};
use crate::utils::checked_align_up;

/// Linear (bump) allocator
///
/// # Memory Layout
/// ```text
/// [allocated][padding][allocated][free space.........]
/// ^begin                         ^head               ^end
/// ```
pub struct LinearAllocator<'a> {
    begin: NonNull<u8>,
    capacity: usize,
    head: Cell<usize>,
    _buffer: PhantomData<&'a mut [u8]>,
}

impl<'a> LinearAllocator<'a> {
    /// Bump-allocate out of `buffer`.
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            capacity: buffer.len(),
            begin: NonNull::from(buffer).cast(),
            head: Cell::new(0),
            _buffer: PhantomData,
        }
    }

    /// Reclaim everything at once.
    ///
    /// Taking `&mut self` guarantees no shared borrow of the allocator is
    /// alive; raw pointers handed out earlier must not be used again.
    pub fn reset(&mut self) {
        self.head.set(0);
    }

    /// Bytes consumed so far, padding included
    pub fn allocated_size(&self) -> usize {
        self.head.get()
    }

    /// Total buffer size
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes left after the head
    pub fn available(&self) -> usize {
        self.capacity - self.head.get()
    }

    /// Check if a pointer lies inside the buffer
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let begin = self.begin.as_ptr() as usize;
        addr >= begin && addr < begin + self.capacity
    }
}

impl core::fmt::Debug for LinearAllocator<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LinearAllocator")
            .field("capacity", &self.capacity)
            .field("allocated", &self.head.get())
            .finish()
    }
}

// SAFETY: the buffer is exclusively borrowed for 'a; nothing ties the
// allocator to the thread that created it.
unsafe impl Send for LinearAllocator<'_> {}

// SAFETY: LinearAllocator hands out disjoint slices of its buffer.
// - every allocation starts at or after the previous head
// - the head only moves forward until reset, which needs &mut self
// - bounds are checked against capacity before the head moves
unsafe impl Allocator for LinearAllocator<'_> {
    fn name(&self) -> &str {
        "linear"
    }

    fn try_alloc(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        check_align(align)?;
        let begin = self.begin.as_ptr() as usize;
        let head = self.head.get();
        let offset = checked_align_up(begin + head, align)
            .map(|aligned| aligned - begin)
            .ok_or_else(|| AllocError::size_overflow("linear alignment"))?;
        let end = offset
            .checked_add(size)
            .filter(|&end| end <= self.capacity)
            .ok_or_else(|| AllocError::arena_exhausted("linear", size, self.capacity - head))?;

        self.head.set(end);
        // SAFETY: offset <= end <= capacity keeps the pointer in the buffer
        Ok(unsafe { self.begin.add(offset) })
    }

    unsafe fn free(&self, _ptr: *mut u8) {}
}
