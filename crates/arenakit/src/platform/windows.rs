//! VirtualAlloc-backed virtual memory for Windows

use core::ptr::{self, NonNull};
use std::io;

use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
use winapi::um::winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

use super::VirtualMemory;
use crate::error::{MemoryError, MemoryResult};

/// Virtual memory through `VirtualAlloc` and `VirtualFree`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OsVirtualMemory;

impl VirtualMemory for OsVirtualMemory {
    fn page_size(&self) -> usize {
        // SAFETY: GetSystemInfo fills a caller-owned struct
        unsafe {
            let mut info: SYSTEM_INFO = core::mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        }
    }

    fn reserve(&self, size: usize) -> MemoryResult<NonNull<u8>> {
        // SAFETY: FFI call to VirtualAlloc with a null address; MEM_RESERVE
        // only claims address space.
        let raw = unsafe { VirtualAlloc(ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };
        NonNull::new(raw.cast::<u8>())
            .ok_or_else(|| MemoryError::platform("VirtualAlloc", io::Error::last_os_error()))
    }

    unsafe fn release(&self, ptr: NonNull<u8>, _size: usize) -> MemoryResult<()> {
        // SAFETY: MEM_RELEASE requires the base address and a zero size
        let ok = unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) };
        if ok == 0 {
            return Err(MemoryError::platform("VirtualFree", io::Error::last_os_error()));
        }
        Ok(())
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, size: usize) -> MemoryResult<()> {
        // SAFETY: caller guarantees the range is inside a reservation
        let raw = unsafe { VirtualAlloc(ptr.as_ptr().cast(), size, MEM_COMMIT, PAGE_READWRITE) };
        if raw.is_null() {
            return Err(MemoryError::platform("VirtualAlloc", io::Error::last_os_error()));
        }
        Ok(())
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, size: usize) -> MemoryResult<()> {
        // SAFETY: caller guarantees the range is inside a reservation
        let ok = unsafe { VirtualFree(ptr.as_ptr().cast(), size, MEM_DECOMMIT) };
        if ok == 0 {
            return Err(MemoryError::platform("VirtualFree", io::Error::last_os_error()));
        }
        Ok(())
    }
}
