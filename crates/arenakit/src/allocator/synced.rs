//! Lock adapters for single-threaded allocators
//!
//! [`Synced`] wraps any [`Allocator`] in a `lock_api` mutex and forwards every
//! call under the lock, turning a `!Sync` allocator into one that can be
//! shared through `&(dyn Allocator + Sync)`. The raw mutex is a type
//! parameter: [`MutexSynced`] parks waiting threads (parking_lot) and
//! [`SpinSynced`] spins (spin), which suits short critical sections such as
//! a TLSF lookup.

use core::ptr::NonNull;

use parking_lot::lock_api::{Mutex, MutexGuard, RawMutex};

use super::{AllocResult, Allocator};
#[cfg(feature = "virtual")]
use super::VirtualLinearAllocator;
use super::TlsfAllocator;

/// `A` behind a mutex of kind `R`
pub struct Synced<R: RawMutex, A> {
    name: String,
    inner: Mutex<R, A>,
}

/// Blocking mutex from parking_lot
pub type MutexSynced<A> = Synced<parking_lot::RawMutex, A>;

/// Spinning mutex from spin
pub type SpinSynced<A> = Synced<spin::mutex::SpinMutex<()>, A>;

/// TLSF heap shared between threads
pub type SyncedTlsfAllocator<'a> = SpinSynced<TlsfAllocator<'a>>;

/// Growing virtual arena shared between threads
#[cfg(feature = "virtual")]
pub type SyncedVirtualLinearAllocator = MutexSynced<VirtualLinearAllocator>;

impl<R: RawMutex, A: Allocator> Synced<R, A> {
    pub fn new(inner: A) -> Self {
        Self {
            name: format!("synced_{}", inner.name()),
            inner: Mutex::new(inner),
        }
    }

    /// Exclusive access to the wrapped allocator, e.g. to `reset` it
    pub fn lock(&self) -> MutexGuard<'_, R, A> {
        self.inner.lock()
    }

    /// Direct access without locking; `&mut self` proves exclusivity.
    pub fn get_mut(&mut self) -> &mut A {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> A {
        self.inner.into_inner()
    }
}

impl<R: RawMutex, A> core::fmt::Debug for Synced<R, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Synced")
            .field("name", &self.name)
            .field("locked", &self.inner.is_locked())
            .finish()
    }
}

// SAFETY: Synced forwards to `A` while holding the lock.
// - the wrapped allocator's guarantees hold unchanged
// - no two calls reach `A` at the same time
unsafe impl<R: RawMutex, A: Allocator> Allocator for Synced<R, A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_alloc(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        self.inner.lock().try_alloc(size, align)
    }

    fn alloc(&self, size: usize, align: usize) -> NonNull<u8> {
        self.inner.lock().alloc(size, align)
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: forwarded caller contract
        unsafe { self.inner.lock().free(ptr) }
    }

    unsafe fn try_realloc(
        &self,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> AllocResult<NonNull<u8>> {
        // SAFETY: forwarded caller contract
        unsafe { self.inner.lock().try_realloc(ptr, old_size, new_size, align) }
    }

    unsafe fn realloc(
        &self,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> NonNull<u8> {
        // SAFETY: forwarded caller contract
        unsafe { self.inner.lock().realloc(ptr, old_size, new_size, align) }
    }

    unsafe fn allocation_size(&self, ptr: *const u8) -> Option<usize> {
        // SAFETY: forwarded caller contract
        unsafe { self.inner.lock().allocation_size(ptr) }
    }

    fn validate_heap(&self) -> bool {
        self.inner.lock().validate_heap()
    }
}
