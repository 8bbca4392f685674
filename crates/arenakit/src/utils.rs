//! Alignment arithmetic and spin helpers shared by every allocator

use core::sync::atomic::{AtomicUsize, Ordering};

/// Check if a value is a power of two
#[inline(always)]
pub const fn is_power_of_two(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Align value up to the nearest multiple of `align`
///
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(is_power_of_two(align));
    (value + align - 1) & !(align - 1)
}

/// Checked variant of [`align_up`] for untrusted sizes
#[inline(always)]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Align value down to the nearest multiple of `align`
#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(is_power_of_two(align));
    value & !(align - 1)
}

/// Check if value is aligned
#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Aligned address such that at least `header` bytes sit between `base`
/// and the result.
///
/// Used by every allocator that stores metadata just in front of the
/// payload.
#[inline(always)]
pub const fn align_with_header(base: usize, header: usize, align: usize) -> usize {
    align_up(base + header, align)
}

/// Atomically raise `target` to at least `value`
#[inline]
pub fn atomic_max(target: &AtomicUsize, value: usize) {
    let mut current = target.load(Ordering::Relaxed);
    while value > current {
        match target.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

/// Backoff utility for spin loops
#[derive(Debug, Clone)]
pub struct Backoff {
    current: u32,
    max: u32,
}

impl Backoff {
    /// Create new backoff with default parameters
    #[inline]
    pub fn new() -> Self {
        Self {
            current: 1,
            max: 64,
        }
    }

    /// Perform backoff
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..self.current {
            core::hint::spin_loop();
        }
        if self.current < self.max {
            self.current *= 2;
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
