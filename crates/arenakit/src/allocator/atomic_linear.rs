//! Lock-free bump allocator
//!
//! The head moves forward through a compare-exchange loop. A request that
//! does not fit leaves the head where it was, so a failed `try_alloc`
//! wastes nothing and smaller requests can still succeed afterwards.

use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::traits::check_align;
use super::{AllocError, AllocResult, Allocator};
use crate::utils::checked_align_up;

/// Bump allocator safe to share between threads
pub struct AtomicLinearAllocator<'a> {
    begin: NonNull<u8>,
    capacity: usize,
    head: AtomicUsize,
    _buffer: PhantomData<&'a mut [u8]>,
}

impl<'a> AtomicLinearAllocator<'a> {
    /// Bump-allocate out of `buffer` from any number of threads.
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            capacity: buffer.len(),
            begin: NonNull::from(buffer).cast(),
            head: AtomicUsize::new(0),
            _buffer: PhantomData,
        }
    }

    /// Reclaim everything. `&mut self` rules out in-flight allocations.
    pub fn reset(&mut self) {
        *self.head.get_mut() = 0;
    }

    /// Bytes consumed so far, padding included
    pub fn allocated_size(&self) -> usize {
        self.head.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.capacity - self.allocated_size()
    }
}

impl core::fmt::Debug for AtomicLinearAllocator<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AtomicLinearAllocator")
            .field("capacity", &self.capacity)
            .field("allocated", &self.allocated_size())
            .finish()
    }
}

// SAFETY: the buffer is exclusively borrowed for 'a and every byte of it
// is handed out at most once, through an atomic bump.
unsafe impl Send for AtomicLinearAllocator<'_> {}
// SAFETY: as above; the head is the only shared mutable state
unsafe impl Sync for AtomicLinearAllocator<'_> {}

// SAFETY: AtomicLinearAllocator hands out disjoint slices of its buffer.
// - a block is only handed out after the CAS moved the head past it
// - the head only moves forward until reset, which needs &mut self
// - the head never passes the capacity
unsafe impl Allocator for AtomicLinearAllocator<'_> {
    fn name(&self) -> &str {
        "atomic_linear"
    }

    fn try_alloc(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        check_align(align)?;
        let begin = self.begin.as_ptr() as usize;
        // Relaxed: the CAS on the head alone keeps ranges disjoint
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let offset = checked_align_up(begin + head, align)
                .map(|aligned| aligned - begin)
                .ok_or_else(|| AllocError::size_overflow("atomic linear alignment"))?;
            let end = offset.checked_add(size).filter(|&end| end <= self.capacity).ok_or_else(
                || AllocError::arena_exhausted("atomic_linear", size, self.capacity - head),
            )?;
            match self.head.compare_exchange_weak(head, end, Ordering::Relaxed, Ordering::Relaxed) {
                // SAFETY: offset <= end <= capacity
                Ok(_) => return Ok(unsafe { self.begin.add(offset) }),
                Err(actual) => head = actual,
            }
        }
    }

    unsafe fn free(&self, _ptr: *mut u8) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[repr(align(16))]
    struct Aligned([u8; 256]);

    #[test]
    fn test_only_alignment_padding_is_consumed() {
        let mut buf = Aligned([0u8; 256]);
        let alloc = AtomicLinearAllocator::new(&mut buf.0);
        let a = alloc.alloc(10, 1);
        let b = alloc.alloc(16, 16);
        assert_eq!(b.as_ptr() as usize % 16, 0);
        assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + 16);
        assert_eq!(alloc.allocated_size(), 32);
    }

    #[test]
    fn test_failed_request_leaves_the_head_in_place() {
        let mut buf = [0u8; 64];
        let alloc = AtomicLinearAllocator::new(&mut buf);
        alloc.alloc(40, 1);
        assert!(alloc.try_alloc(32, 1).is_err());
        assert_eq!(alloc.allocated_size(), 40);
        // The 24 bytes behind the head are still usable
        assert!(alloc.try_alloc(24, 1).is_ok());
        assert_eq!(alloc.available(), 0);
    }

    #[test]
    fn test_exhaustion_and_reset() {
        let mut buf = [0u8; 64];
        let mut alloc = AtomicLinearAllocator::new(&mut buf);
        alloc.alloc(48, 1);
        assert!(alloc.try_alloc(32, 1).is_err());
        alloc.reset();
        assert_eq!(alloc.allocated_size(), 0);
        assert!(alloc.try_alloc(32, 1).is_ok());
    }

    #[test]
    fn test_concurrent_allocations_are_disjoint() {
        let mut buf = vec![0u8; 64 * 1024];
        let alloc = AtomicLinearAllocator::new(&mut buf);
        let seen = Mutex::new(HashSet::new());

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let mut mine = Vec::new();
                    for _ in 0..100 {
                        let p = alloc.alloc(24, 8);
                        assert_eq!(p.as_ptr() as usize % 8, 0);
                        mine.push(p.as_ptr() as usize);
                    }
                    let mut seen = seen.lock().unwrap();
                    for addr in mine {
                        assert!(seen.insert(addr));
                    }
                });
            }
        });

        let addrs: Vec<usize> = {
            let mut v: Vec<usize> = seen.into_inner().unwrap().into_iter().collect();
            v.sort_unstable();
            v
        };
        assert_eq!(addrs.len(), 800);
        assert!(addrs.windows(2).all(|w| w[1] - w[0] >= 24));
    }
}
