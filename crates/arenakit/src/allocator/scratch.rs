//! Ring allocator for short-lived scratch memory
//!
//! Allocations are carved out of a fixed ring in order. Each slot starts
//! with a [`ScratchHeader`] holding the slot length and a free bit. Freeing
//! sets the bit and advances the tail over every consecutive free slot, so
//! memory is reclaimed in allocation order without any free-list
//! bookkeeping. When the ring has no room the request goes to an optional
//! backing allocator.
//!
//! # Ring states
//! ```text
//! tail <= head:  [....free....|tail  used  |head ....free....]
//! head <  tail:  [  used  |head ...free... |tail    used     ]
//! ```
//! `head == tail` means the ring is empty. The head never catches up with
//! the tail from behind, so a full ring is never mistaken for an empty one.
//!
//! # Backing allocator precondition
//!
//! Pointers outside the ring are assumed to come from the backing
//! allocator. The backing allocator must therefore never return an address
//! inside the ring's byte range.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::NonNull;

#[cfg(feature = "logging")]
use tracing::{debug, warn};

use super::header::ScratchHeader;
use super::traits::check_align;
use super::{AllocError, AllocResult, Allocator};
use crate::utils::{align_down, align_up};
use crate::{mem_assert, mem_fatal};

/// Scratch allocator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchConfig {
    /// Byte written over a payload when it is freed
    pub fill_pattern: Option<u8>,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            fill_pattern: if cfg!(debug_assertions) { Some(0xDD) } else { None },
        }
    }
}

impl ScratchConfig {
    /// Production configuration - no fill
    pub fn production() -> Self {
        Self { fill_pattern: None }
    }

    /// Debug configuration - poison freed payloads
    pub fn debug() -> Self {
        Self {
            fill_pattern: Some(0xDD),
        }
    }
}

/// Where a new slot would go and how the head moves if it is taken.
#[derive(Debug, Clone, Copy)]
struct Placement {
    slot: usize,
    payload: usize,
    next_head: usize,
    wrapped: bool,
}

/// Wrap-around bump allocator with lazy tail reclamation
pub struct ScratchAllocator<'a> {
    begin: NonNull<u8>,
    capacity: usize,
    head: Cell<usize>,
    tail: Cell<usize>,
    backing: Option<&'a dyn Allocator>,
    config: ScratchConfig,
    fallbacks: Cell<usize>,
    _buffer: PhantomData<&'a mut [u8]>,
}

impl<'a> ScratchAllocator<'a> {
    /// Ring over `buffer` with no fallback; exhaustion is an error.
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self::with_config(buffer, None, ScratchConfig::default())
    }

    /// Ring over `buffer` that spills to `backing` when full.
    pub fn with_backing(buffer: &'a mut [u8], backing: &'a dyn Allocator) -> Self {
        Self::with_config(buffer, Some(backing), ScratchConfig::default())
    }

    pub fn with_config(
        buffer: &'a mut [u8],
        backing: Option<&'a dyn Allocator>,
        config: ScratchConfig,
    ) -> Self {
        // Headers are u32 words: start on a word boundary and keep the
        // capacity a whole number of words.
        let raw = NonNull::from(buffer);
        let len = raw.len();
        let start = raw.cast::<u8>();
        let skip = align_up(start.as_ptr() as usize, ScratchHeader::SIZE) - start.as_ptr() as usize;
        let capacity = align_down(len.saturating_sub(skip), ScratchHeader::SIZE);
        mem_assert!(
            capacity < ScratchHeader::FREE_BIT as usize,
            "scratch ring of {capacity} bytes cannot be described by its headers"
        );

        #[cfg(feature = "logging")]
        debug!(capacity, has_backing = backing.is_some(), "scratch allocator initialized");

        Self {
            // SAFETY: skip < 4 and, when capacity > 0, skip < len
            begin: unsafe { start.add(skip.min(len)) },
            capacity,
            head: Cell::new(0),
            tail: Cell::new(0),
            backing,
            config,
            fallbacks: Cell::new(0),
            _buffer: PhantomData,
        }
    }

    /// True when every ring allocation has been freed
    pub fn is_empty(&self) -> bool {
        self.head.get() == self.tail.get()
    }

    /// Check if a pointer lies inside the ring
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let begin = self.begin.as_ptr() as usize;
        addr >= begin && addr < begin + self.capacity
    }

    /// Usable ring size in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of requests served by the backing allocator
    pub fn fallback_count(&self) -> usize {
        self.fallbacks.get()
    }

    fn addr(&self, offset: usize) -> usize {
        self.begin.as_ptr() as usize + offset
    }

    /// # Safety
    /// `offset <= capacity`
    unsafe fn at(&self, offset: usize) -> *mut u8 {
        // SAFETY: caller contract
        unsafe { self.begin.as_ptr().add(offset) }
    }

    /// Slot starting at `slot` for `size` bytes aligned to `align`. The
    /// payload always starts strictly inside the ring.
    fn slot_at(&self, slot: usize, size: usize, align: usize) -> Option<(usize, usize)> {
        let payload = align_up(self.addr(slot) + ScratchHeader::SIZE, align) - self.addr(0);
        let end = payload.checked_add(size)?;
        (payload < self.capacity && end <= self.capacity).then_some((payload, end))
    }

    fn place(&self, size: usize, align: usize) -> Option<Placement> {
        let head = self.head.get();
        let tail = self.tail.get();

        if head >= tail {
            // Room between head and the end of the ring
            if let Some((payload, end)) = self.slot_at(head, size, align) {
                // A slot ending too close to the end absorbs the slack so
                // the next header always has room.
                let next_head = if self.capacity - end < ScratchHeader::SIZE { 0 } else { end };
                if next_head != 0 || tail > 0 {
                    return Some(Placement {
                        slot: head,
                        payload,
                        next_head,
                        wrapped: false,
                    });
                }
            }
            // Wrap to the start; must stop short of the tail.
            let (payload, end) = self.slot_at(0, size, align)?;
            return (end < tail).then_some(Placement {
                slot: 0,
                payload,
                next_head: end,
                wrapped: head != 0,
            });
        }

        // Wrapped: room between head and tail only
        let (payload, end) = self.slot_at(head, size, align)?;
        (end < tail).then_some(Placement {
            slot: head,
            payload,
            next_head: end,
            wrapped: false,
        })
    }

    fn fallback(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        let Some(backing) = self.backing else {
            return Err(AllocError::arena_exhausted("scratch", size, 0));
        };

        #[cfg(feature = "logging")]
        warn!(
            size,
            align,
            backing = backing.name(),
            "scratch ring exhausted, falling back to backing allocator"
        );

        let ptr = backing.try_alloc(size, align)?;
        mem_assert!(
            !self.contains(ptr.as_ptr()),
            "backing allocator returned {:p} inside the scratch ring",
            ptr.as_ptr()
        );
        self.fallbacks.set(self.fallbacks.get() + 1);
        Ok(ptr)
    }

    /// Move the tail past every freed slot at the front of the ring.
    fn reclaim(&self) {
        let head = self.head.get();
        let mut tail = self.tail.get();
        while tail != head {
            // SAFETY: tail always points at a slot header inside the ring
            let header = unsafe { ScratchHeader::read(self.at(tail)) };
            if !header.is_free() {
                break;
            }
            tail += header.slot_len();
            if tail >= self.capacity {
                tail = 0;
            }
        }
        if tail == head {
            // Empty: restart at the front so the next run has the whole ring.
            self.head.set(0);
            tail = 0;
        }
        self.tail.set(tail);
    }
}

impl core::fmt::Debug for ScratchAllocator<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScratchAllocator")
            .field("capacity", &self.capacity)
            .field("head", &self.head.get())
            .field("tail", &self.tail.get())
            .field("fallbacks", &self.fallbacks.get())
            .finish()
    }
}

// SAFETY: ScratchAllocator hands out disjoint slots of its ring.
// - a slot is only placed in space between head and tail that no live
//   slot covers
// - the head never reaches the tail from behind
// - slots are reclaimed only after they have been freed
unsafe impl Allocator for ScratchAllocator<'_> {
    fn name(&self) -> &str {
        "scratch"
    }

    fn try_alloc(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        check_align(align)?;
        let align = align.max(ScratchHeader::SIZE);
        let Some(rounded) = size.checked_add(ScratchHeader::SIZE - 1) else {
            return self.fallback(size, align);
        };
        // Zero-size requests still take a word so the payload stays inside
        // the ring and never aliases the next slot's header.
        let rounded = align_down(rounded, ScratchHeader::SIZE).max(ScratchHeader::SIZE);

        let Some(placement) = self.place(rounded, align) else {
            return self.fallback(size, align);
        };

        let slot_end = if placement.next_head == 0 { self.capacity } else { placement.next_head };
        // SAFETY: Writing headers inside the ring.
        // - place() only returns slots ending at or before capacity
        // - a wrap header goes at the old head, which always has room for
        //   one header word
        // - every offset is a multiple of the header size
        unsafe {
            if placement.wrapped {
                let head = self.head.get();
                ScratchHeader::write(
                    self.at(head),
                    ScratchHeader::free((self.capacity - head) as u32),
                );
            }
            let slot = self.at(placement.slot);
            let payload = self.at(placement.payload);
            ScratchHeader::write(slot, ScratchHeader::used((slot_end - placement.slot) as u32));
            ScratchHeader::write_padding(slot, payload);
            self.head.set(placement.next_head);
            Ok(NonNull::new_unchecked(payload))
        }
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if !self.contains(ptr) {
            match self.backing {
                // SAFETY: out-of-ring pointers came from the backing allocator
                Some(backing) => unsafe { backing.free(ptr) },
                None => mem_fatal!("pointer {ptr:p} was not allocated by this scratch allocator"),
            }
            return;
        }

        // SAFETY: ptr is a live payload inside the ring, so a header
        // followed by pad words precedes it.
        unsafe {
            let slot = ScratchHeader::find_from_payload(ptr);
            let header = ScratchHeader::read(slot);
            mem_assert!(!header.is_free(), "double free of scratch allocation {ptr:p}");

            if let Some(pattern) = self.config.fill_pattern {
                let slot_end = slot.add(header.slot_len());
                ptr.write_bytes(pattern, slot_end as usize - ptr as usize);
            }
            ScratchHeader::write(slot, header.mark_free());
        }
        self.reclaim();
    }

    unsafe fn allocation_size(&self, ptr: *const u8) -> Option<usize> {
        if !self.contains(ptr) {
            // SAFETY: forwarded to the allocator that produced ptr
            return self.backing.and_then(|b| unsafe { b.allocation_size(ptr) });
        }
        // SAFETY: ptr is a live ring payload
        unsafe {
            let slot = ScratchHeader::find_from_payload(ptr.cast_mut());
            let header = ScratchHeader::read(slot);
            Some(slot as usize + header.slot_len() - ptr as usize)
        }
    }
}
