//! The allocator capability trait
//!
//! Every strategy in this crate implements [`Allocator`], and consumers hold
//! it as `&dyn Allocator`. The surface is deliberately small: allocate,
//! free, reallocate, plus two optional introspection hooks.
//!
//! # Safety
//!
//! ## Trait Safety Contract
//!
//! Implementors of the unsafe [`Allocator`] trait promise that:
//! - A successful `try_alloc(size, align)` returns memory valid for `size`
//!   bytes of reads and writes, aligned to `align`
//! - Live allocations never overlap
//! - The memory stays valid until it is freed, reallocated, or the allocator
//!   is reset or destroyed
//!
//! ## Caller Contract
//!
//! `free` and `realloc` take raw pointers. Callers must pass either null or
//! a pointer previously returned by the *same* allocator instance that has
//! not been freed since. Allocators detect violations they can see (double
//! free, out-of-order stack free) through the fatal assertion path.

use core::ptr::{self, NonNull};

use super::{AllocError, AllocResult};
use crate::mem_fatal;
use crate::utils::is_power_of_two;

/// Reject alignments that are not a power of two.
#[inline]
pub(crate) fn check_align(align: usize) -> AllocResult<()> {
    if is_power_of_two(align) {
        Ok(())
    } else {
        Err(AllocError::invalid_alignment(align))
    }
}

/// Polymorphic allocation capability.
///
/// Only `name`, `try_alloc` and `free` are required. `alloc` and `realloc`
/// escalate failures of their `try_*` counterparts to the fatal assertion
/// handler.
pub unsafe trait Allocator {
    /// Human-readable allocator name used in diagnostics
    fn name(&self) -> &str;

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// # Errors
    /// - `InvalidAlignment` if `align` is not a power of two
    /// - An exhaustion variant when the allocator has no room left
    fn try_alloc(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>>;

    /// Allocate or abort through the assertion handler.
    fn alloc(&self, size: usize, align: usize) -> NonNull<u8> {
        match self.try_alloc(size, align) {
            Ok(ptr) => ptr,
            Err(e) => mem_fatal!("{} cannot allocate {size} bytes (align {align}): {e}", self.name()),
        }
    }

    /// Release a block. Null is a no-op.
    ///
    /// # Safety
    /// `ptr` is null or a live allocation of this allocator.
    unsafe fn free(&self, ptr: *mut u8);

    /// Resize a block, moving it when needed.
    ///
    /// The default allocates a new block, copies `min(old_size, new_size)`
    /// bytes and frees the old block. A null `ptr` behaves like
    /// `try_alloc`. On error the original block is untouched.
    ///
    /// # Safety
    /// `ptr` is null or a live allocation of this allocator of `old_size`
    /// bytes.
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
        let new_ptr = self.try_alloc(new_size, align)?;
        // SAFETY: Moving the payload into the new block.
        // - ptr is live for old_size bytes (caller contract)
        // - new_ptr is a fresh block of new_size bytes, disjoint from ptr
        // - the copy length is the smaller of the two
        unsafe {
            ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), old_size.min(new_size));
            self.free(ptr);
        }
        Ok(new_ptr)
    }

    /// Resize or abort through the assertion handler.
    ///
    /// # Safety
    /// Same as [`Allocator::try_realloc`].
    unsafe fn realloc(
        &self,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> NonNull<u8> {
        // SAFETY: forwarded caller contract
        match unsafe { self.try_realloc(ptr, old_size, new_size, align) } {
            Ok(ptr) => ptr,
            Err(e) => mem_fatal!(
                "{} cannot reallocate {old_size} -> {new_size} bytes: {e}",
                self.name()
            ),
        }
    }

    /// Usable size of a live allocation, if the allocator records it.
    ///
    /// # Safety
    /// `ptr` is a live allocation of this allocator.
    unsafe fn allocation_size(&self, ptr: *const u8) -> Option<usize> {
        let _ = ptr;
        None
    }

    /// Run an internal consistency check.
    ///
    /// Returns `false` when the allocator has no such check. Allocators that
    /// do check report corruption through the assertion handler.
    fn validate_heap(&self) -> bool {
        false
    }
}

// SAFETY: Forwarding impl.
// - every call is delegated to the referenced allocator
// - the contract of `A` carries over unchanged
unsafe impl<A: Allocator + ?Sized> Allocator for &A {
    #[inline]
    fn name(&self) -> &str {
        (**self).name()
    }

    #[inline]
    fn try_alloc(&self, size: usize, align: usize) -> AllocResult<NonNull<u8>> {
        (**self).try_alloc(size, align)
    }

    #[inline]
    fn alloc(&self, size: usize, align: usize) -> NonNull<u8> {
        (**self).alloc(size, align)
    }

    #[inline]
    unsafe fn free(&self, ptr: *mut u8) {
        // SAFETY: forwarded caller contract
        unsafe { (**self).free(ptr) }
    }

    #[inline]
    unsafe fn try_realloc(
        &self,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> AllocResult<NonNull<u8>> {
        // SAFETY: forwarded caller contract
        unsafe { (**self).try_realloc(ptr, old_size, new_size, align) }
    }

    #[inline]
    unsafe fn allocation_size(&self, ptr: *const u8) -> Option<usize> {
        // SAFETY: forwarded caller contract
        unsafe { (**self).allocation_size(ptr) }
    }

    #[inline]
    fn validate_heap(&self) -> bool {
        (**self).validate_heap()
    }
}
