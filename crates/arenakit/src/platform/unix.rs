//! mmap-backed virtual memory for unix targets

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::io;

use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE};

use super::VirtualMemory;
use crate::error::{MemoryError, MemoryResult};

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_NORESERVE: libc::c_int = 0;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Virtual memory through `mmap`, `mprotect`, `madvise` and `munmap`.
///
/// Reserved ranges are mapped `PROT_NONE`; committing flips pages to
/// read/write and the kernel backs them on first touch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OsVirtualMemory;

fn check(operation: &'static str, rc: libc::c_int) -> MemoryResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(MemoryError::platform(operation, io::Error::last_os_error()))
    }
}

impl VirtualMemory for OsVirtualMemory {
    fn page_size(&self) -> usize {
        let cached = PAGE_SIZE.load(Ordering::Relaxed);
        if cached != 0 {
            return cached;
        }
        // SAFETY: sysconf has no memory-safety preconditions
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let size = if raw > 0 { raw as usize } else { 4096 };
        PAGE_SIZE.store(size, Ordering::Relaxed);
        size
    }

    fn reserve(&self, size: usize) -> MemoryResult<NonNull<u8>> {
        // SAFETY: FFI call to libc mmap. We pass:
        // - addr = null: the kernel picks the placement
        // - PROT_NONE: nothing is readable until committed
        // - MAP_NORESERVE (where supported): no swap accounting for the range
        // - fd=-1, offset=0: anonymous mapping
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if raw == MAP_FAILED {
            return Err(MemoryError::platform("mmap", io::Error::last_os_error()));
        }
        NonNull::new(raw.cast::<u8>())
            .ok_or_else(|| MemoryError::platform("mmap", io::Error::from(io::ErrorKind::Other)))
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> MemoryResult<()> {
        // SAFETY: caller guarantees ptr/size came from `reserve`
        check("munmap", unsafe { libc::munmap(ptr.as_ptr().cast(), size) })
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> MemoryResult<()> {
        // SAFETY: caller guarantees a page-aligned range inside a reservation
        check("mprotect", unsafe {
            libc::mprotect(ptr.as_ptr().cast(), size, PROT_READ | PROT_WRITE)
        })
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) -> MemoryResult<()> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            // SAFETY: caller guarantees a page-aligned range inside a
            // reservation. DONTNEED drops private anonymous pages; the next
            // touch after a commit sees zeroes.
            check("madvise", unsafe {
                libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_DONTNEED)
            })?;
            // SAFETY: same range as above
            check("mprotect", unsafe {
                libc::mprotect(ptr.as_ptr().cast(), size, PROT_NONE)
            })
        }

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            // madvise is only a hint here; remapping over the range is the
            // portable way to drop the pages.
            // SAFETY: MAP_FIXED over a range we already own
            let raw = unsafe {
                libc::mmap(
                    ptr.as_ptr().cast(),
                    size,
                    PROT_NONE,
                    MAP_PRIVATE | MAP_ANONYMOUS | libc::MAP_FIXED | MAP_NORESERVE,
                    -1,
                    0,
                )
            };
            if raw == MAP_FAILED {
                Err(MemoryError::platform("mmap", io::Error::last_os_error()))
            } else {
                Ok(())
            }
        }
    }
}
