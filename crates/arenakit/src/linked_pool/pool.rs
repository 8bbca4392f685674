//! Lock-free object pool addressed by handles
//!
//! # Safety
//!
//! Slots are never moved while the pool lives, so a slot's address is
//! stable between `acquire` and `release`:
//! - Slot ownership is decided by the shared [`VersionedFreeList`]
//! - A slot's link is `ALLOCATED` exactly while it holds a live `T`
//! - Generations are bumped before the slot goes back on the list, so a
//!   handle from an earlier life no longer matches

use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::slice;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

#[cfg(feature = "logging")]
use tracing::debug;

use super::handle::{Handle, HandleLayout};
use crate::allocator::free_list::{ALLOCATED, VersionedFreeList};
use crate::allocator::{Allocator, system_allocator};
use crate::error::{MemoryError, MemoryResult};
use crate::{mem_assert, mem_debug_assert, mem_fatal};

/// Fixed-capacity pool of `T` with generation-checked handles
///
/// Any number of threads may [`acquire`](Self::acquire) and
/// [`release`](Self::release) concurrently. With `GEN_CHECK` the pool keeps
/// a generation per slot and rejects handles to a slot that has since been
/// released; the capacity is then limited to `2^16 - 1` slots instead of
/// `2^29 - 1`.
///
/// # Memory Layout
/// ```text
/// slots:       [T0][T1][T2][T3]...
/// links:       [-2][ 3][-2][-1]...   (-2: live, otherwise next free slot)
/// generations: [ 4][ 1][ 0][ 7]...   (only with GEN_CHECK)
/// ```
pub struct AtomicLinkedPool<'a, T, const GEN_CHECK: bool = true> {
    backing: &'a (dyn Allocator + Sync),
    slots: NonNull<T>,
    links: NonNull<AtomicI32>,
    generations: Option<NonNull<AtomicU32>>,
    capacity: usize,
    free_list: VersionedFreeList,
    _owns: PhantomData<T>,
}

impl<T, const GEN_CHECK: bool> AtomicLinkedPool<'static, T, GEN_CHECK> {
    /// Pool of `capacity` slots backed by the system allocator
    ///
    /// # Errors
    /// See [`AtomicLinkedPool::with_backing`].
    pub fn new(capacity: usize) -> MemoryResult<Self> {
        Self::with_backing(capacity, system_allocator())
    }
}

impl<'a, T, const GEN_CHECK: bool> AtomicLinkedPool<'a, T, GEN_CHECK> {
    /// Largest capacity the handle encoding supports
    pub const MAX_CAPACITY: usize = HandleLayout::<GEN_CHECK>::MAX_SLOTS;

    /// Creates a pool whose arrays come from `backing`
    ///
    /// # Errors
    /// - `InvalidConfig` when `capacity` is zero or above
    ///   [`Self::MAX_CAPACITY`]
    /// - `SizeOverflow` or the backing allocator's error when the arrays
    ///   cannot be allocated
    pub fn with_backing(capacity: usize, backing: &'a (dyn Allocator + Sync)) -> MemoryResult<Self> {
        if capacity == 0 || capacity > Self::MAX_CAPACITY {
            return Err(MemoryError::invalid_config(&format!(
                "linked pool capacity {capacity} must be between 1 and {}",
                Self::MAX_CAPACITY
            )));
        }

        let slots = alloc_array::<T>(backing, capacity)?;
        let links = match alloc_array::<AtomicI32>(backing, capacity) {
            Ok(links) => links,
            Err(e) => {
                // SAFETY: slots was just allocated from backing
                unsafe { free_array(backing, slots) };
                return Err(e);
            }
        };
        let generations = if GEN_CHECK {
            match alloc_array::<AtomicU32>(backing, capacity) {
                Ok(generations) => Some(generations),
                Err(e) => {
                    // SAFETY: both arrays were just allocated from backing
                    unsafe {
                        free_array(backing, links);
                        free_array(backing, slots);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        // SAFETY: Initialising the side arrays.
        // - both have room for `capacity` elements (allocated above)
        // - the atomics are plain integers, any start value is valid
        unsafe {
            for i in 0..capacity {
                links.add(i).write(AtomicI32::new(ALLOCATED));
                if let Some(generations) = generations {
                    generations.add(i).write(AtomicU32::new(0));
                }
            }
        }

        let pool = Self {
            backing,
            slots,
            links,
            generations,
            capacity,
            free_list: VersionedFreeList::new(true),
            _owns: PhantomData,
        };
        pool.free_list.rebuild(pool.links());

        #[cfg(feature = "logging")]
        debug!(
            capacity,
            slot_size = size_of::<T>(),
            gen_check = GEN_CHECK,
            "atomic linked pool initialized"
        );

        Ok(pool)
    }

    #[inline]
    fn links(&self) -> &[AtomicI32] {
        // SAFETY: links holds `capacity` initialised atomics until destroy,
        // which also zeroes the capacity
        unsafe { slice::from_raw_parts(self.links.as_ptr(), self.capacity) }
    }

    #[inline]
    fn generation(&self, index: usize) -> Option<&AtomicU32> {
        // SAFETY: callers bounds-check index against capacity
        self.generations.map(|g| unsafe { &*g.as_ptr().add(index) })
    }

    #[inline]
    fn current_generation(&self, index: usize) -> u32 {
        self.generation(index)
            .map_or(0, |g| g.load(Ordering::Acquire))
    }

    #[inline]
    fn slot(&self, index: usize) -> NonNull<T> {
        // SAFETY: index < capacity keeps the slot inside the array
        unsafe { self.slots.add(index) }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live slots. Walks the free list, so only exact while no other
    /// thread acquires or releases.
    pub fn live_count(&self) -> usize {
        self.capacity - self.free_count()
    }

    fn free_count(&self) -> usize {
        let mut free = 0;
        if !self.free_list.walk(self.links(), |_| free += 1) {
            mem_fatal!("atomic linked pool free list is corrupted");
        }
        free
    }

    /// Slot index and encoded generation of `handle`, without validating it
    /// against the pool.
    pub fn handle_parts(&self, handle: Handle) -> Option<(usize, u32)> {
        HandleLayout::<GEN_CHECK>::decode(handle)
    }

    /// Decode and bounds-check. Malformed handles are fatal.
    fn index_of(&self, handle: Handle) -> (usize, u32) {
        let Some((index, generation)) = HandleLayout::<GEN_CHECK>::decode(handle) else {
            mem_fatal!("invalid linked pool handle {handle:?}")
        };
        mem_assert!(
            index < self.capacity,
            "linked pool handle {handle:?} refers to slot {index} of {}",
            self.capacity
        );
        (index, generation)
    }

    fn matches_generation(&self, index: usize, generation: u32) -> bool {
        self.current_generation(index) & HandleLayout::<GEN_CHECK>::GENERATION_MASK == generation
    }

    /// Take a free slot and move `value` into it.
    ///
    /// A full pool is fatal: size pools for the worst case.
    pub fn acquire_with(&self, value: T) -> Handle {
        let Some(index) = self.free_list.pop(self.links()) else {
            mem_fatal!(
                "atomic linked pool full: all {} slots are in use",
                self.capacity
            )
        };
        // SAFETY: the slot was just popped, this thread owns it
        unsafe { self.slot(index).write(value) };
        HandleLayout::<GEN_CHECK>::encode(index, self.current_generation(index))
    }

    /// Take a free slot holding `T::default()`.
    pub fn acquire(&self) -> Handle
    where
        T: Default,
    {
        self.acquire_with(T::default())
    }

    /// Drop the slot's value and put the slot back on the free list.
    ///
    /// Releasing a stale handle, or the same handle twice, is fatal.
    pub fn release(&self, handle: Handle) {
        let (index, generation) = self.index_of(handle);

        if let Some(current) = self.generation(index) {
            let mut observed = current.load(Ordering::Relaxed);
            loop {
                if observed & HandleLayout::<GEN_CHECK>::GENERATION_MASK != generation {
                    mem_fatal!(
                        "stale linked pool handle {handle:?}: slot {index} is at generation {}",
                        observed & HandleLayout::<GEN_CHECK>::GENERATION_MASK
                    );
                }
                match current.compare_exchange_weak(
                    observed,
                    observed.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => observed = actual,
                }
            }
        }

        mem_assert!(
            self.free_list.mark_released(self.links(), index),
            "atomic linked pool double release of slot {index}"
        );
        // SAFETY: the slot held a live T and this thread claimed it above
        unsafe { ptr::drop_in_place(self.slot(index).as_ptr()) };
        self.free_list.push_released(self.links(), index);
    }

    /// Shared reference to the slot's value
    ///
    /// The generation is re-checked in debug builds only.
    ///
    /// # Safety
    /// The handle must be live and stay live while the reference is used,
    /// and no `&mut T` to the slot may exist meanwhile.
    pub unsafe fn get(&self, handle: Handle) -> &T {
        let (index, generation) = self.index_of(handle);
        mem_debug_assert!(
            self.matches_generation(index, generation),
            "stale linked pool handle {handle:?} used with get"
        );
        // SAFETY: caller contract, the slot holds a live T
        unsafe { self.slot(index).as_ref() }
    }

    /// Exclusive reference to the slot's value. Always validated.
    pub fn get_mut(&mut self, handle: Handle) -> &mut T {
        let (index, generation) = self.index_of(handle);
        mem_assert!(
            self.matches_generation(index, generation),
            "stale linked pool handle {handle:?} used with get_mut"
        );
        mem_assert!(
            self.links()[index].load(Ordering::Relaxed) == ALLOCATED,
            "linked pool handle {handle:?} refers to a free slot"
        );
        // SAFETY: the slot is live and `&mut self` excludes other access
        unsafe { self.slot(index).as_mut() }
    }

    /// Raw pointer to the slot, stable until the handle is released
    pub fn get_ptr(&self, handle: Handle) -> NonNull<T> {
        let (index, generation) = self.index_of(handle);
        mem_debug_assert!(
            self.matches_generation(index, generation),
            "stale linked pool handle {handle:?} used with get_ptr"
        );
        self.slot(index)
    }

    /// Call `f` with a handle to every live slot, in ascending slot order.
    ///
    /// The free list is snapshotted up front, so `f` may release the slot
    /// it was given or any slot visited before it. Releasing a slot that
    /// has not been visited yet, or acquiring from another thread during the
    /// walk, makes the remaining visits unreliable.
    pub fn iterate_allocated_nodes(&self, mut f: impl FnMut(Handle)) {
        let links = self.links();
        let free = self.free_count();
        if free == self.capacity {
            return;
        }

        let mut scratch = SortBuffer::new(self.backing, free);
        let (keys, tmp) = scratch.halves();
        let mut filled = 0;
        self.free_list.walk(links, |index| {
            if filled < keys.len() {
                keys[filled] = index as u32;
                filled += 1;
            }
        });
        let keys = &mut keys[..filled];
        radix_sort(keys, &mut tmp[..filled]);

        let mut free_slots = keys.iter().copied().peekable();
        for index in 0..self.capacity {
            if free_slots.next_if_eq(&(index as u32)).is_some() {
                continue;
            }
            f(HandleLayout::<GEN_CHECK>::encode(
                index,
                self.current_generation(index),
            ));
        }
    }

    /// Release every live slot, dropping the values and bumping their
    /// generations. Outstanding handles all become stale.
    pub fn release_all(&mut self) {
        let this = &*self;
        this.iterate_allocated_nodes(|handle| this.release(handle));
    }

    /// Drop live values and return the arrays to the backing allocator.
    /// The pool is empty and unusable afterwards. Idempotent.
    pub fn destroy(&mut self) {
        if self.capacity == 0 {
            return;
        }
        if core::mem::needs_drop::<T>() {
            let this = &*self;
            this.iterate_allocated_nodes(|handle| {
                let (index, _) = this.index_of(handle);
                // SAFETY: the slot is live and `&mut self` excludes handles
                // being used concurrently
                unsafe { ptr::drop_in_place(this.slot(index).as_ptr()) };
            });
        }

        // SAFETY: the arrays were allocated from backing in with_backing
        // and are not touched again once capacity is zero
        unsafe {
            if let Some(generations) = self.generations.take() {
                free_array(self.backing, generations);
            }
            free_array(self.backing, self.links);
            free_array(self.backing, self.slots);
        }
        self.capacity = 0;
        self.free_list.rebuild(&[]);

        #[cfg(feature = "logging")]
        debug!("atomic linked pool destroyed");
    }
}

impl<T> AtomicLinkedPool<'_, T, true> {
    /// Whether `handle` still refers to the value it was acquired for
    pub fn is_alive(&self, handle: Handle) -> bool {
        let Some((index, generation)) = HandleLayout::<true>::decode(handle) else {
            return false;
        };
        index < self.capacity
            && self.matches_generation(index, generation)
            && self.links()[index].load(Ordering::Acquire) == ALLOCATED
    }
}

impl<T, const GEN_CHECK: bool> core::fmt::Debug for AtomicLinkedPool<'_, T, GEN_CHECK> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AtomicLinkedPool")
            .field("capacity", &self.capacity)
            .field("gen_check", &GEN_CHECK)
            .field("backing", &self.backing.name())
            .finish_non_exhaustive()
    }
}

impl<T, const GEN_CHECK: bool> Drop for AtomicLinkedPool<'_, T, GEN_CHECK> {
    fn drop(&mut self) {
        self.destroy();
    }
}

// SAFETY: the pool owns its Ts; moving it moves them to another thread
unsafe impl<T: Send, const GEN_CHECK: bool> Send for AtomicLinkedPool<'_, T, GEN_CHECK> {}
// SAFETY: Shared use across threads.
// - acquire/release move Ts between threads, hence T: Send
// - get hands out &T to several threads, hence T: Sync
// - all slot bookkeeping goes through atomics
unsafe impl<T: Send + Sync, const GEN_CHECK: bool> Sync for AtomicLinkedPool<'_, T, GEN_CHECK> {}

fn alloc_array<E>(backing: &dyn Allocator, len: usize) -> MemoryResult<NonNull<E>> {
    if size_of::<E>() == 0 {
        return Ok(NonNull::dangling());
    }
    let bytes = size_of::<E>()
        .checked_mul(len)
        .ok_or_else(|| MemoryError::size_overflow("linked pool storage"))?;
    Ok(backing.try_alloc(bytes, align_of::<E>())?.cast())
}

/// # Safety
/// `array` must come from [`alloc_array`] on the same allocator.
unsafe fn free_array<E>(backing: &dyn Allocator, array: NonNull<E>) {
    if size_of::<E>() != 0 {
        // SAFETY: caller contract
        unsafe { backing.free(array.as_ptr().cast()) };
    }
}

/// Scratch keys for the free-list sort, returned to the backing allocator
/// on drop.
struct SortBuffer<'b> {
    backing: &'b dyn Allocator,
    ptr: NonNull<u32>,
    len: usize,
}

impl<'b> SortBuffer<'b> {
    /// Room for two runs of `len` keys. Allocation failure is fatal.
    fn new(backing: &'b dyn Allocator, len: usize) -> Self {
        let Some(bytes) = len.checked_mul(2 * size_of::<u32>()) else {
            mem_fatal!("linked pool sort buffer for {len} keys overflows")
        };
        let ptr = backing.alloc(bytes.max(1), align_of::<u32>()).cast::<u32>();
        // SAFETY: the allocation spans 2 * len u32
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, 2 * len) };
        Self { backing, ptr, len }
    }

    fn halves(&mut self) -> (&mut [u32], &mut [u32]) {
        // SAFETY: 2 * len initialised u32, exclusively borrowed through self
        let all = unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), 2 * self.len) };
        all.split_at_mut(self.len)
    }
}

impl Drop for SortBuffer<'_> {
    fn drop(&mut self) {
        // SAFETY: ptr came from backing.alloc in new
        unsafe { self.backing.free(self.ptr.as_ptr().cast()) };
    }
}

/// LSD radix sort, one byte per pass. `scratch` must match `keys` in
/// length; the sorted run ends up back in `keys`.
fn radix_sort<'s>(keys: &'s mut [u32], scratch: &'s mut [u32]) {
    debug_assert_eq!(keys.len(), scratch.len());
    let (mut src, mut dst) = (keys, scratch);
    for shift in [0, 8, 16, 24] {
        let mut offsets = [0usize; 256];
        for &key in src.iter() {
            offsets[((key >> shift) & 0xFF) as usize] += 1;
        }
        let mut total = 0;
        for slot in &mut offsets {
            let count = *slot;
            *slot = total;
            total += count;
        }
        for &key in src.iter() {
            let bucket = ((key >> shift) & 0xFF) as usize;
            dst[offsets[bucket]] = key;
            offsets[bucket] += 1;
        }
        core::mem::swap(&mut src, &mut dst);
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::assert::{panicking_assert_handler, scoped_assert_handler};

    #[test]
    fn test_capacity_limits() {
        assert!(AtomicLinkedPool::<u32, true>::new(0).is_err());
        assert!(AtomicLinkedPool::<u32, true>::new(1 << 16).is_err());
        assert!(AtomicLinkedPool::<u32, true>::new((1 << 16) - 1).is_ok());
        let err = AtomicLinkedPool::<u8, false>::new(1 << 29).unwrap_err();
        assert_eq!(err.code(), "MEM:CONFIG:INVALID");
    }

    #[test]
    fn test_radix_sort_orders_multi_byte_keys() {
        let mut keys = vec![70_000, 3, 256, 65_535, 0, 1 << 24, 255, 513];
        let mut scratch = vec![0; keys.len()];
        radix_sort(&mut keys, &mut scratch);
        assert_eq!(keys, vec![0, 3, 255, 256, 513, 65_535, 70_000, 1 << 24]);
    }

    #[test]
    fn test_acquire_release_reuses_slot_with_new_generation() {
        let pool: AtomicLinkedPool<'_, u64> = AtomicLinkedPool::new(4).unwrap();
        let a = pool.acquire_with(11);
        let (index, generation) = pool.handle_parts(a).unwrap();
        pool.release(a);
        let b = pool.acquire();
        assert_eq!(pool.handle_parts(b), Some((index, generation + 1)));
        assert!(!pool.is_alive(a));
        assert!(pool.is_alive(b));
        assert_eq!(unsafe { *pool.get(b) }, 0);
    }

    #[test]
    fn test_get_mut_and_get_ptr() {
        let mut pool: AtomicLinkedPool<'_, String> = AtomicLinkedPool::new(2).unwrap();
        let h = pool.acquire_with("left".to_owned());
        pool.get_mut(h).push_str("-right");
        assert_eq!(unsafe { pool.get(h) }, "left-right");
        let p = pool.get_ptr(h);
        assert_eq!(unsafe { p.as_ref() }.len(), 10);
    }

    #[test]
    fn test_values_are_dropped_on_release_and_destroy() {
        let marker = Rc::new(());
        let mut pool: AtomicLinkedPool<'_, Rc<()>> = AtomicLinkedPool::new(4).unwrap();
        let a = pool.acquire_with(marker.clone());
        pool.acquire_with(marker.clone());
        pool.acquire_with(marker.clone());
        assert_eq!(Rc::strong_count(&marker), 4);
        pool.release(a);
        assert_eq!(Rc::strong_count(&marker), 3);
        pool.destroy();
        assert_eq!(Rc::strong_count(&marker), 1);
        assert_eq!(pool.capacity(), 0);
        pool.destroy();
    }

    #[test]
    fn test_iteration_is_ascending() {
        let pool: AtomicLinkedPool<'_, usize> = AtomicLinkedPool::new(300).unwrap();
        let handles: Vec<_> = (0..300).map(|i| pool.acquire_with(i)).collect();
        for h in handles.iter().step_by(3) {
            pool.release(*h);
        }
        let mut seen = Vec::new();
        pool.iterate_allocated_nodes(|h| seen.push(unsafe { *pool.get(h) }));
        let expected: Vec<usize> = (0..300).filter(|i| i % 3 != 0).collect();
        assert_eq!(seen, expected);
        assert_eq!(pool.live_count(), 200);
    }

    #[test]
    fn test_release_all_empties_pool() {
        let mut pool: AtomicLinkedPool<'_, u8, false> = AtomicLinkedPool::new(16).unwrap();
        for i in 0..10 {
            pool.acquire_with(i);
        }
        pool.release_all();
        assert_eq!(pool.live_count(), 0);
        let mut visits = 0;
        pool.iterate_allocated_nodes(|_| visits += 1);
        assert_eq!(visits, 0);
    }

    #[test]
    #[should_panic(expected = "atomic linked pool full")]
    fn test_full_pool_faults() {
        let _guard = scoped_assert_handler(panicking_assert_handler);
        let pool: AtomicLinkedPool<'_, u32> = AtomicLinkedPool::new(1).unwrap();
        pool.acquire();
        pool.acquire();
    }

    #[test]
    #[should_panic(expected = "stale linked pool handle")]
    fn test_stale_release_faults() {
        let _guard = scoped_assert_handler(panicking_assert_handler);
        let pool: AtomicLinkedPool<'_, u32> = AtomicLinkedPool::new(2).unwrap();
        let h = pool.acquire();
        pool.release(h);
        pool.release(h);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn test_unchecked_double_release_faults() {
        let _guard = scoped_assert_handler(panicking_assert_handler);
        let pool: AtomicLinkedPool<'_, u32, false> = AtomicLinkedPool::new(2).unwrap();
        let h = pool.acquire();
        pool.release(h);
        pool.release(h);
    }

    #[test]
    #[should_panic(expected = "invalid linked pool handle")]
    fn test_none_handle_faults() {
        let _guard = scoped_assert_handler(panicking_assert_handler);
        let pool: AtomicLinkedPool<'_, u32> = AtomicLinkedPool::new(2).unwrap();
        pool.release(Handle::NONE);
    }
}
