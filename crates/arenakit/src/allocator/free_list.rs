//! Lock-free free list over slot indices
//!
//! The list head is a [`VersionedIndex`] packed into one `AtomicU64`. Every
//! successful CAS bumps the version, so a head that was popped and pushed
//! back by another thread in between no longer compares equal: this is what
//! keeps the list ABA-safe.
//!
//! Next links live in a side array of `AtomicI32` owned by the caller rather
//! than inside the slots, so a slot's bytes belong to whoever holds it. A
//! popped slot's link is set to [`ALLOCATED`], which lets `release` detect a
//! double free with a single atomic exchange.

use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use crate::utils::Backoff;

/// Link value terminating the list
pub(crate) const END: i32 = -1;
/// Link value of a slot that is currently handed out
pub(crate) const ALLOCATED: i32 = -2;

/// List head: slot index plus a version bumped on every write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VersionedIndex {
    pub index: i32,
    pub version: u32,
}

impl VersionedIndex {
    #[inline]
    pub const fn pack(self) -> u64 {
        ((self.version as u64) << 32) | (self.index as u32 as u64)
    }

    #[inline]
    pub const fn unpack(raw: u64) -> Self {
        Self {
            index: raw as u32 as i32,
            version: (raw >> 32) as u32,
        }
    }

    #[inline]
    const fn successor(self, index: i32) -> Self {
        Self {
            index,
            version: self.version.wrapping_add(1),
        }
    }
}

/// Versioned Treiber stack of slot indices
#[derive(Debug)]
pub(crate) struct VersionedFreeList {
    head: AtomicU64,
    use_backoff: bool,
}

impl VersionedFreeList {
    pub fn new(use_backoff: bool) -> Self {
        Self {
            head: AtomicU64::new(
                VersionedIndex {
                    index: END,
                    version: 0,
                }
                .pack(),
            ),
            use_backoff,
        }
    }

    #[inline]
    fn load(&self) -> VersionedIndex {
        VersionedIndex::unpack(self.head.load(Ordering::Acquire))
    }

    /// Link every slot in ascending order. Needs the owner quiesced.
    pub fn rebuild(&self, links: &[AtomicI32]) {
        let count = links.len();
        for (i, link) in links.iter().enumerate() {
            let next = if i + 1 < count { (i + 1) as i32 } else { END };
            link.store(next, Ordering::Relaxed);
        }
        let first = if count == 0 { END } else { 0 };
        let head = self.load().successor(first);
        self.head.store(head.pack(), Ordering::Release);
    }

    /// Take a free slot, or `None` when the list is empty.
    pub fn pop(&self, links: &[AtomicI32]) -> Option<usize> {
        let mut backoff = self.use_backoff.then(Backoff::new);
        let mut current = self.load();
        loop {
            if current.index < 0 {
                return None;
            }
            let index = current.index as usize;
            // Relaxed: a stale link is caught by the CAS below since any
            // intervening pop or push changed the version.
            let next = links[index].load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                current.pack(),
                current.successor(next).pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    links[index].store(ALLOCATED, Ordering::Relaxed);
                    return Some(index);
                }
                Err(actual) => {
                    current = VersionedIndex::unpack(actual);
                    if let Some(b) = backoff.as_mut() {
                        b.spin();
                    }
                }
            }
        }
    }

    /// Claim the right to push `index` back. Fails when the slot is not
    /// currently handed out, i.e. on a double free.
    pub fn mark_released(&self, links: &[AtomicI32], index: usize) -> bool {
        links[index]
            .compare_exchange(ALLOCATED, END, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Push a slot claimed through [`Self::mark_released`].
    pub fn push_released(&self, links: &[AtomicI32], index: usize) {
        let mut backoff = self.use_backoff.then(Backoff::new);
        let mut current = self.load();
        loop {
            // Nobody else can see this slot until the CAS publishes it.
            links[index].store(current.index, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                current.pack(),
                current.successor(index as i32).pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    current = VersionedIndex::unpack(actual);
                    if let Some(b) = backoff.as_mut() {
                        b.spin();
                    }
                }
            }
        }
    }

    /// Visit the free slots from the head. Only meaningful while no other
    /// thread pops or pushes. The walk stops after `links.len()` steps, or
    /// at the first link that is not a valid slot index, and reports
    /// whether it ended cleanly.
    pub fn walk(&self, links: &[AtomicI32], mut f: impl FnMut(usize)) -> bool {
        let mut index = self.load().index;
        let mut steps = 0;
        while index >= 0 {
            let i = index as usize;
            if i >= links.len() || steps == links.len() {
                return false;
            }
            f(i);
            steps += 1;
            index = links[i].load(Ordering::Relaxed);
        }
        index == END
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn links(n: usize) -> Vec<AtomicI32> {
        (0..n).map(|_| AtomicI32::new(0)).collect()
    }

    #[test]
    fn test_pack_round_trip_keeps_sign() {
        let v = VersionedIndex {
            index: END,
            version: u32::MAX,
        };
        assert_eq!(VersionedIndex::unpack(v.pack()), v);
        let v = VersionedIndex {
            index: 12345,
            version: 7,
        };
        assert_eq!(VersionedIndex::unpack(v.pack()), v);
    }

    #[test]
    fn test_pops_ascending_then_lifo() {
        let links = links(4);
        let list = VersionedFreeList::new(false);
        list.rebuild(&links);
        assert_eq!(list.pop(&links), Some(0));
        assert_eq!(list.pop(&links), Some(1));
        assert!(list.mark_released(&links, 0));
        list.push_released(&links, 0);
        assert_eq!(list.pop(&links), Some(0));
        assert_eq!(list.pop(&links), Some(2));
        assert_eq!(list.pop(&links), Some(3));
        assert_eq!(list.pop(&links), None);
    }

    #[test]
    fn test_every_write_bumps_version() {
        let links = links(2);
        let list = VersionedFreeList::new(false);
        list.rebuild(&links);
        let before = list.load();
        let i = list.pop(&links).unwrap();
        assert!(list.mark_released(&links, i));
        list.push_released(&links, i);
        let after = list.load();
        // same index at the head, different state
        assert_eq!(before.index, after.index);
        assert_eq!(after.version, before.version.wrapping_add(2));
    }

    #[test]
    fn test_double_release_is_refused() {
        let links = links(2);
        let list = VersionedFreeList::new(false);
        list.rebuild(&links);
        let i = list.pop(&links).unwrap();
        assert!(list.mark_released(&links, i));
        assert!(!list.mark_released(&links, i));
        // never handed out
        assert!(!list.mark_released(&links, 1));
    }

    #[test]
    fn test_walk_visits_free_slots() {
        let links = links(5);
        let list = VersionedFreeList::new(true);
        list.rebuild(&links);
        list.pop(&links);
        list.pop(&links);
        let mut seen = Vec::new();
        assert!(list.walk(&links, |i| seen.push(i)));
        assert_eq!(seen, vec![2, 3, 4]);
    }

    #[test]
    fn test_concurrent_pop_push_never_shares_a_slot() {
        use std::sync::atomic::AtomicBool;

        const SLOTS: usize = 64;
        let links = links(SLOTS);
        let owned: Vec<AtomicBool> = (0..SLOTS).map(|_| AtomicBool::new(false)).collect();
        let list = VersionedFreeList::new(true);
        list.rebuild(&links);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        if let Some(i) = list.pop(&links) {
                            assert!(!owned[i].swap(true, Ordering::AcqRel));
                            owned[i].store(false, Ordering::Release);
                            assert!(list.mark_released(&links, i));
                            list.push_released(&links, i);
                        }
                    }
                });
            }
        });

        let mut count = 0;
        assert!(list.walk(&links, |_| count += 1));
        assert_eq!(count, SLOTS);
    }
}
