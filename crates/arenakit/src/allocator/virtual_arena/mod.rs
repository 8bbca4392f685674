//! Arenas that grow into a reserved range of address space
//!
//! Construction reserves `max_size_bytes` of address space and commits
//! nothing. Allocation commits whole chunks on demand, so the OS is asked
//! for memory once per `chunk_size_bytes` rather than once per request.
//! Idle chunks past the allocation frontier can be handed back with
//! `decommit_idle_memory` while the reservation stays in place.

mod linear;
mod stack;

pub use linear::VirtualLinearAllocator;
pub use stack::VirtualStackAllocator;

use core::cell::Cell;
use core::ptr::NonNull;

#[cfg(feature = "logging")]
use tracing::{debug, trace};

use crate::error::{MemoryError, MemoryResult};
use crate::mem_fatal;
use crate::platform::VirtualMemory;
use crate::utils::{align_up, checked_align_up, is_power_of_two};

/// Configuration for the virtual arenas
#[derive(Debug, Clone)]
pub struct VirtualConfig {
    /// Address space reserved up front; allocations never go past it
    pub max_size_bytes: usize,

    /// Commit granularity. Must be a power of two; raised to the page size
    /// when smaller.
    pub chunk_size_bytes: usize,

    /// Touch freshly committed pages so first use does not fault
    pub prefault: bool,
}

impl Default for VirtualConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 64 * 1024 * 1024,
            chunk_size_bytes: 64 * 1024,
            prefault: false,
        }
    }
}

impl VirtualConfig {
    /// Reserve `max_size_bytes`, commit in `chunk_size_bytes` steps.
    pub fn new(max_size_bytes: usize, chunk_size_bytes: usize) -> Self {
        Self {
            max_size_bytes,
            chunk_size_bytes,
            ..Self::default()
        }
    }

    /// Large chunks, prefaulted: fewer syscalls and no page faults on the
    /// hot path
    pub fn production() -> Self {
        Self {
            max_size_bytes: 1024 * 1024 * 1024,
            chunk_size_bytes: 2 * 1024 * 1024,
            prefault: true,
        }
    }

    /// Small chunks so commit behaviour shows up early
    pub fn debug() -> Self {
        Self {
            max_size_bytes: 16 * 1024 * 1024,
            chunk_size_bytes: 4096,
            prefault: false,
        }
    }

    /// Enable or disable prefaulting.
    #[must_use]
    pub fn with_prefault(mut self, prefault: bool) -> Self {
        self.prefault = prefault;
        self
    }

    /// Check the configuration before any address space is reserved.
    ///
    /// # Errors
    /// `InvalidConfig` for a non-power-of-two chunk or an empty reservation.
    pub fn validate(&self) -> MemoryResult<()> {
        if !is_power_of_two(self.chunk_size_bytes) {
            return Err(MemoryError::invalid_config(&format!(
                "chunk size {} is not a power of two",
                self.chunk_size_bytes
            )));
        }
        if self.max_size_bytes == 0 {
            return Err(MemoryError::invalid_config("virtual reservation must not be empty"));
        }
        Ok(())
    }
}

/// Reserved range plus the committed prefix of it
pub(crate) struct VirtualRegion<V: VirtualMemory> {
    vm: V,
    base: Option<NonNull<u8>>,
    reserved: usize,
    chunk: usize,
    committed: Cell<usize>,
    prefault: bool,
}

impl<V: VirtualMemory> VirtualRegion<V> {
    pub(crate) fn reserve(vm: V, config: &VirtualConfig) -> MemoryResult<Self> {
        config.validate()?;
        let chunk = config.chunk_size_bytes.max(vm.page_size());
        let reserved = checked_align_up(config.max_size_bytes, chunk)
            .ok_or_else(|| MemoryError::size_overflow("virtual reservation"))?;
        let base = match vm.reserve(reserved) {
            Ok(base) => base,
            Err(e) => mem_fatal!("{e}"),
        };

        #[cfg(feature = "logging")]
        debug!(reserved, chunk, "virtual region reserved");

        Ok(Self {
            vm,
            base: Some(base),
            reserved,
            chunk,
            committed: Cell::new(0),
            prefault: config.prefault,
        })
    }

    /// Start of the reservation. Fatal after `release`.
    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        match self.base {
            Some(base) => base,
            None => mem_fatal!("virtual arena used after destroy"),
        }
    }

    #[inline]
    pub(crate) fn reserved(&self) -> usize {
        self.reserved
    }

    #[inline]
    pub(crate) fn chunk(&self) -> usize {
        self.chunk
    }

    #[inline]
    pub(crate) fn committed(&self) -> usize {
        self.committed.get()
    }

    #[inline]
    pub(crate) fn vm(&self) -> &V {
        &self.vm
    }

    /// Make sure `0..required_end` is committed, in whole chunks and with a
    /// single commit call.
    ///
    /// # Errors
    /// `ArenaExhausted` when `required_end` lies past the reservation.
    pub(crate) fn grow_to(&self, required_end: usize) -> MemoryResult<()> {
        let committed = self.committed.get();
        if required_end <= committed {
            return Ok(());
        }
        if required_end > self.reserved {
            return Err(MemoryError::arena_exhausted(
                "virtual",
                required_end - committed,
                self.reserved - committed,
            ));
        }
        let new_committed = align_up(required_end, self.chunk);
        let grow = new_committed - committed;
        // SAFETY: Committing the next chunks of the reservation.
        // - committed and new_committed are chunk multiples <= reserved
        // - chunk is at least one page, so the range is page aligned
        unsafe {
            let at = self.base().add(committed);
            if let Err(e) = self.vm.commit(at, grow) {
                mem_fatal!("{e}");
            }
            if self.prefault {
                self.vm.prefault(at, grow);
            }
        }
        self.committed.set(new_committed);

        #[cfg(feature = "logging")]
        trace!(grow, committed = new_committed, "virtual region committed");
        Ok(())
    }

    /// Decommit every chunk wholly past `frontier`.
    pub(crate) fn decommit_beyond(&self, frontier: usize) {
        let keep = align_up(frontier, self.chunk);
        let committed = self.committed.get();
        if keep >= committed {
            return;
        }
        // SAFETY: keep..committed is committed, chunk aligned and holds no
        // live allocation (everything live is below frontier)
        unsafe {
            if let Err(e) = self.vm.decommit(self.base().add(keep), committed - keep) {
                mem_fatal!("{e}");
            }
        }
        self.committed.set(keep);

        #[cfg(feature = "logging")]
        trace!(released = committed - keep, committed = keep, "virtual region decommitted");
    }

    /// Give the whole reservation back. Idempotent.
    pub(crate) fn release(&mut self) {
        if let Some(base) = self.base.take() {
            // SAFETY: base/reserved are exactly what reserve returned, and
            // the owning arena is being destroyed
            if let Err(e) = unsafe { self.vm.release(base, self.reserved) } {
                mem_fatal!("{e}");
            }
            self.committed.set(0);

            #[cfg(feature = "logging")]
            debug!(reserved = self.reserved, "virtual region released");
        }
    }

    pub(crate) fn is_released(&self) -> bool {
        self.base.is_none()
    }
}

impl<V: VirtualMemory> Drop for VirtualRegion<V> {
    fn drop(&mut self) {
        self.release();
    }
}

// SAFETY: the region owns its reservation outright; nothing about it is
// tied to the thread that created it.
unsafe impl<V: VirtualMemory + Send> Send for VirtualRegion<V> {}


#[cfg(test)]
mod tests {
    use super::testing::CountingVm;
    use super::*;

    #[test]
    fn test_config_rejects_non_power_of_two_chunk() {
        let err = VirtualConfig::new(1 << 20, 3000).validate().unwrap_err();
        assert_eq!(err.code(), "MEM:CONFIG:INVALID");
        assert!(VirtualConfig::new(0, 4096).validate().is_err());
        assert!(VirtualConfig::production().validate().is_ok());
        assert!(VirtualConfig::debug().validate().is_ok());
    }

    #[test]
    fn test_region_commits_whole_chunks_once() {
        let region = VirtualRegion::reserve(CountingVm::default(), &VirtualConfig::new(1 << 20, 1 << 16)).unwrap();
        region.grow_to(10).unwrap();
        region.grow_to(1 << 16).unwrap();
        region.grow_to((1 << 16) + 1).unwrap();
        assert_eq!(*region.vm().commits.borrow(), vec![1 << 16, 1 << 16]);
        assert_eq!(region.committed(), 2 << 16);
    }

    #[test]
    fn test_region_refuses_to_grow_past_reservation() {
        let region = VirtualRegion::reserve(CountingVm::default(), &VirtualConfig::new(1 << 20, 1 << 16)).unwrap();
        let err = region.grow_to((1 << 20) + 1).unwrap_err();
        assert_eq!(err.code(), "MEM:ARENA:EXHAUSTED");
        assert_eq!(region.committed(), 0);
    }

    #[test]
    fn test_small_chunk_is_raised_to_page_size() {
        let region = VirtualRegion::reserve(CountingVm::default(), &VirtualConfig::new(1 << 20, 16)).unwrap();
        assert_eq!(region.chunk(), region.vm().page_size());
    }

    #[test]
    fn test_decommit_beyond_keeps_frontier_chunk() {
        let region = VirtualRegion::reserve(CountingVm::default(), &VirtualConfig::new(1 << 20, 1 << 16)).unwrap();
        region.grow_to(5 << 16).unwrap();
        region.decommit_beyond((1 << 16) + 100);
        assert_eq!(region.committed(), 2 << 16);
        assert_eq!(*region.vm().decommits.borrow(), vec![3 << 16]);
        // nothing left to give back
        region.decommit_beyond(2 << 16);
        assert_eq!(region.vm().decommits.borrow().len(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut region = VirtualRegion::reserve(CountingVm::default(), &VirtualConfig::new(1 << 20, 1 << 16)).unwrap();
        region.grow_to(100).unwrap();
        region.release();
        assert!(region.is_released());
        region.release();
    }
}
