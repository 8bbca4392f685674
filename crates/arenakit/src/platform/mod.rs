//! Virtual-memory primitives
//!
//! Reserve a range of address space, then commit and decommit physical pages
//! inside it. One implementation per target OS sits behind the
//! [`VirtualMemory`] trait and is picked at build time as
//! [`OsVirtualMemory`].
//!
//! The trait surfaces OS failures as [`MemoryError::Platform`]. The free
//! functions at the bottom of this module are the process-level contract
//! used by the growing arenas: any platform failure is fatal.
//!
//! # Safety
//!
//! Callers of the `unsafe` methods must ensure:
//! 1. **Range**: `ptr..ptr + size` lies inside a range returned by `reserve`
//! 2. **Alignment**: `ptr` and `size` are multiples of [`VirtualMemory::page_size`]
//! 3. **Lifecycle**: a reservation is released exactly once
//! 4. **Access**: decommitted pages are not touched until committed again

use core::ptr::NonNull;

use crate::error::{MemoryError, MemoryResult};
use crate::mem_fatal;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::OsVirtualMemory;
    } else if #[cfg(windows)] {
        mod windows;
        pub use windows::OsVirtualMemory;
    } else {
        compile_error!("virtual memory support requires a unix or windows target");
    }
}

/// Page-granular reserve/commit interface over the OS.
pub trait VirtualMemory {
    /// Size of one OS page in bytes. Always a power of two.
    fn page_size(&self) -> usize;

    /// Reserve `size` bytes of address space without committing any pages.
    fn reserve(&self, size: usize) -> MemoryResult<NonNull<u8>>;

    /// Give a whole reservation back to the OS.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must be exactly a previous `reserve` result. Nothing
    /// inside the range may be used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> MemoryResult<()>;

    /// Back `ptr..ptr + size` with readable and writable physical pages.
    ///
    /// # Safety
    ///
    /// See the module-level contract.
    unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> MemoryResult<()>;

    /// Return the physical pages of `ptr..ptr + size` to the OS while keeping
    /// the address range reserved.
    ///
    /// # Safety
    ///
    /// See the module-level contract. Contents are lost.
    unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) -> MemoryResult<()>;

    /// Touch every page of a committed range so later accesses do not fault.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + size` must be committed.
    unsafe fn prefault(&self, ptr: NonNull<u8>, size: usize) {
        let page = self.page_size();
        let mut offset = 0;
        while offset < size {
            // SAFETY: Touching one byte per committed page.
            // - offset < size keeps the address inside the committed range
            // - volatile read/write pair preserves the existing byte
            unsafe {
                let p = ptr.as_ptr().add(offset);
                p.write_volatile(p.read_volatile());
            }
            offset += page;
        }
    }
}

impl<V: VirtualMemory + ?Sized> VirtualMemory for &V {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn reserve(&self, size: usize) -> MemoryResult<NonNull<u8>> {
        (**self).reserve(size)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> MemoryResult<()> {
        // SAFETY: forwarded contract
        unsafe { (**self).release(ptr, size) }
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> MemoryResult<()> {
        // SAFETY: forwarded contract
        unsafe { (**self).commit(ptr, size) }
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) -> MemoryResult<()> {
        // SAFETY: forwarded contract
        unsafe { (**self).decommit(ptr, size) }
    }

    unsafe fn prefault(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded contract
        unsafe { (**self).prefault(ptr, size) }
    }
}

fn platform_failure(error: &MemoryError) -> ! {
    mem_fatal!("{error}")
}

/// Reserve address space or abort.
pub fn reserve_virtual_memory(size: usize) -> NonNull<u8> {
    OsVirtualMemory
        .reserve(size)
        .unwrap_or_else(|e| platform_failure(&e))
}

/// Release a reservation or abort.
///
/// # Safety
///
/// See [`VirtualMemory::release`].
pub unsafe fn free_virtual_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: forwarded contract
    if let Err(e) = unsafe { OsVirtualMemory.release(ptr, size) } {
        platform_failure(&e);
    }
}

/// Commit pages or abort.
///
/// # Safety
///
/// See [`VirtualMemory::commit`].
pub unsafe fn commit_physical_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: forwarded contract
    if let Err(e) = unsafe { OsVirtualMemory.commit(ptr, size) } {
        platform_failure(&e);
    }
}

/// Decommit pages or abort.
///
/// # Safety
///
/// See [`VirtualMemory::decommit`].
pub unsafe fn decommit_physical_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: forwarded contract
    if let Err(e) = unsafe { OsVirtualMemory.decommit(ptr, size) } {
        platform_failure(&e);
    }
}

/// Touch committed pages.
///
/// # Safety
///
/// See [`VirtualMemory::prefault`].
pub unsafe fn prefault_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: forwarded contract
    unsafe { OsVirtualMemory.prefault(ptr, size) }
}

/// OS page size.
pub fn page_size() -> usize {
    OsVirtualMemory.page_size()
}
