//! Two-Level Segregated Fit core
//!
//! Free blocks are binned by size class: the first level splits sizes by
//! power of two, the second level splits each power of two into
//! `SL_INDEX_COUNT` linear steps. Two bitmaps record which bins are
//! non-empty, so finding a fitting block is a couple of bit scans.
//!
//! # Block layout
//! ```text
//!             +-----------------+
//! block ----> | prev_phys_block |  only valid while the previous block is free
//!             +-----------------+
//!             | size | P | F    |  F: this block is free, P: previous is free
//!             +-----------------+ <-- user pointer
//!             | next_free       |  only while free
//!             | prev_free       |  only while free
//!             | ...             |
//!             +-----------------+
//! ```
//! The `prev_phys_block` field of a block overlaps the last word of the
//! previous block's payload, so a used block costs one word of overhead.
//!
//! Blocks are addressed through [`Block`], a raw address wrapper. All field
//! access goes through wrapping offsets so that the sentinel block in front
//! of each pool never materialises an out-of-bounds reference.

use core::ptr;

pub(crate) const WORD: usize = size_of::<usize>();

#[cfg(target_pointer_width = "64")]
const ALIGN_SIZE_LOG2: u32 = 3;
#[cfg(not(target_pointer_width = "64"))]
const ALIGN_SIZE_LOG2: u32 = 2;

/// Alignment every block payload has
pub(crate) const ALIGN_SIZE: usize = 1 << ALIGN_SIZE_LOG2;

const SL_INDEX_COUNT_LOG2: u32 = 5;
const SL_INDEX_COUNT: usize = 1 << SL_INDEX_COUNT_LOG2;

#[cfg(target_pointer_width = "64")]
const FL_INDEX_MAX: u32 = 32;
#[cfg(not(target_pointer_width = "64"))]
const FL_INDEX_MAX: u32 = 30;

const FL_INDEX_SHIFT: u32 = SL_INDEX_COUNT_LOG2 + ALIGN_SIZE_LOG2;
const FL_INDEX_COUNT: usize = (FL_INDEX_MAX - FL_INDEX_SHIFT + 1) as usize;
const SMALL_BLOCK_SIZE: usize = 1 << FL_INDEX_SHIFT;

const FREE_BIT: usize = 1;
const PREV_FREE_BIT: usize = 2;
const SIZE_MASK: usize = !(FREE_BIT | PREV_FREE_BIT);

// Field offsets inside a block header
const PREV_PHYS: usize = 0;
const SIZE: usize = WORD;
const NEXT_FREE: usize = 2 * WORD;
const PREV_FREE: usize = 3 * WORD;

/// Bytes a used block adds in front of its payload
pub(crate) const BLOCK_OVERHEAD: usize = WORD;
/// Distance from a block to its payload
const BLOCK_START_OFFSET: usize = 2 * WORD;
/// Smallest payload a block can carry: enough for the free-list links
pub(crate) const BLOCK_SIZE_MIN: usize = 4 * WORD - WORD;
/// Largest block the first level can index
pub(crate) const BLOCK_SIZE_MAX: usize = 1 << FL_INDEX_MAX;
/// Per-pool bookkeeping: the leading sentinel word and the trailing
/// zero-sized block
pub(crate) const POOL_OVERHEAD: usize = 2 * BLOCK_OVERHEAD;

/// Raw address of a block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block(*mut u8);

impl Block {
    const NULL: Self = Self(ptr::null_mut());

    #[inline]
    fn is_null(self) -> bool {
        self.0.is_null()
    }

    #[inline]
    fn field(self, offset: usize) -> *mut usize {
        self.0.wrapping_add(offset).cast::<usize>()
    }

    #[inline]
    unsafe fn get(self, offset: usize) -> usize {
        // SAFETY: the caller only reads fields that lie inside a pool
        unsafe { self.field(offset).read() }
    }

    #[inline]
    unsafe fn set(self, offset: usize, value: usize) {
        // SAFETY: the caller only writes fields that lie inside a pool
        unsafe { self.field(offset).write(value) }
    }

    #[inline]
    unsafe fn set_link(self, offset: usize, block: Self) {
        // Store the pointer itself so provenance survives the round trip
        // SAFETY: forwarded
        unsafe { self.field(offset).cast::<*mut u8>().write(block.0) }
    }

    #[inline]
    unsafe fn next_free(self) -> Self {
        // SAFETY: forwarded
        Self(unsafe { self.field(NEXT_FREE).cast::<*mut u8>().read() })
    }

    #[inline]
    unsafe fn prev_free(self) -> Self {
        // SAFETY: forwarded
        Self(unsafe { self.field(PREV_FREE).cast::<*mut u8>().read() })
    }

    #[inline]
    unsafe fn prev_phys(self) -> Self {
        // SAFETY: forwarded
        Self(unsafe { self.field(PREV_PHYS).cast::<*mut u8>().read() })
    }

    #[inline]
    pub(crate) unsafe fn size(self) -> usize {
        // SAFETY: forwarded
        unsafe { self.get(SIZE) & SIZE_MASK }
    }

    #[inline]
    unsafe fn set_size(self, size: usize) {
        // SAFETY: forwarded
        unsafe {
            let flags = self.get(SIZE) & !SIZE_MASK;
            self.set(SIZE, size | flags);
        }
    }

    #[inline]
    unsafe fn is_last(self) -> bool {
        // SAFETY: forwarded
        unsafe { self.size() == 0 }
    }

    #[inline]
    pub(crate) unsafe fn is_free(self) -> bool {
        // SAFETY: forwarded
        unsafe { self.get(SIZE) & FREE_BIT != 0 }
    }

    #[inline]
    unsafe fn set_free(self) {
        // SAFETY: forwarded
        unsafe { self.set(SIZE, self.get(SIZE) | FREE_BIT) }
    }

    #[inline]
    unsafe fn set_used(self) {
        // SAFETY: forwarded
        unsafe { self.set(SIZE, self.get(SIZE) & !FREE_BIT) }
    }

    #[inline]
    unsafe fn is_prev_free(self) -> bool {
        // SAFETY: forwarded
        unsafe { self.get(SIZE) & PREV_FREE_BIT != 0 }
    }

    #[inline]
    unsafe fn set_prev_free(self) {
        // SAFETY: forwarded
        unsafe { self.set(SIZE, self.get(SIZE) | PREV_FREE_BIT) }
    }

    #[inline]
    unsafe fn set_prev_used(self) {
        // SAFETY: forwarded
        unsafe { self.set(SIZE, self.get(SIZE) & !PREV_FREE_BIT) }
    }

    #[inline]
    pub(crate) fn from_ptr(ptr: *mut u8) -> Self {
        Self(ptr.wrapping_sub(BLOCK_START_OFFSET))
    }

    #[inline]
    pub(crate) fn to_ptr(self) -> *mut u8 {
        self.0.wrapping_add(BLOCK_START_OFFSET)
    }

    /// Block whose header starts `offset` bytes past `ptr`
    #[inline]
    fn at_offset(ptr: *mut u8, offset: isize) -> Self {
        Self(ptr.wrapping_offset(offset))
    }

    /// Physically next block
    #[inline]
    unsafe fn next(self) -> Self {
        // SAFETY: forwarded
        let size = unsafe { self.size() };
        Self::at_offset(self.to_ptr(), (size - BLOCK_OVERHEAD) as isize)
    }

    /// Record `self` as the previous block of its physical successor
    #[inline]
    unsafe fn link_next(self) -> Self {
        // SAFETY: forwarded
        unsafe {
            let next = self.next();
            next.set_link(PREV_PHYS, self);
            next
        }
    }

    #[inline]
    unsafe fn mark_as_free(self) {
        // SAFETY: forwarded
        unsafe {
            let next = self.link_next();
            next.set_prev_free();
            self.set_free();
        }
    }

    #[inline]
    unsafe fn mark_as_used(self) {
        // SAFETY: forwarded
        unsafe {
            let next = self.next();
            next.set_prev_used();
            self.set_used();
        }
    }

    #[inline]
    unsafe fn can_split(self, size: usize) -> bool {
        // SAFETY: forwarded
        unsafe { self.size() >= 4 * WORD + size }
    }

    /// Split off the tail of `self` past `size` bytes as a new free block
    #[inline]
    unsafe fn split(self, size: usize) -> Self {
        // SAFETY: forwarded; can_split guarantees room for the new header
        unsafe {
            let remaining = Self::at_offset(self.to_ptr(), (size - BLOCK_OVERHEAD) as isize);
            let remain_size = self.size() - (size + BLOCK_OVERHEAD);
            remaining.set(SIZE, 0);
            remaining.set_size(remain_size);
            self.set_size(size);
            remaining.mark_as_free();
            remaining
        }
    }

    /// Fold `block` into its physical predecessor `self`
    #[inline]
    unsafe fn absorb(self, block: Self) -> Self {
        // SAFETY: forwarded
        unsafe {
            let size = self.get(SIZE) + block.size() + BLOCK_OVERHEAD;
            self.set(SIZE, size);
            self.link_next();
        }
        self
    }
}

/// Size class of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mapping {
    fl: usize,
    sl: usize,
}

#[inline]
fn fls(value: usize) -> u32 {
    usize::BITS - 1 - value.leading_zeros()
}

/// Bin that holds blocks of exactly `size` bytes
#[inline]
pub(crate) fn mapping_insert(size: usize) -> Mapping {
    if size < SMALL_BLOCK_SIZE {
        Mapping {
            fl: 0,
            sl: size / (SMALL_BLOCK_SIZE / SL_INDEX_COUNT),
        }
    } else {
        let fl = fls(size);
        let sl = (size >> (fl - SL_INDEX_COUNT_LOG2)) ^ (1 << SL_INDEX_COUNT_LOG2);
        Mapping {
            fl: (fl - (FL_INDEX_SHIFT - 1)) as usize,
            sl,
        }
    }
}

/// First bin whose blocks are all at least `size` bytes
#[inline]
fn mapping_search(size: usize) -> Mapping {
    let size = if size >= SMALL_BLOCK_SIZE {
        size + (1 << (fls(size) - SL_INDEX_COUNT_LOG2)) - 1
    } else {
        size
    };
    mapping_insert(size)
}

/// Round a request up to the granularity blocks are carved at
#[inline]
pub(crate) fn adjust_request_size(size: usize, align: usize) -> Option<usize> {
    let aligned = size.checked_add(align - 1)? & !(align - 1);
    (aligned < BLOCK_SIZE_MAX).then(|| aligned.max(BLOCK_SIZE_MIN))
}

/// Reason a consistency check failed
pub(crate) type CheckFailure = &'static str;

/// Bitmaps and bin heads. Lives at the front of the first pool.
#[repr(C)]
pub(crate) struct Control {
    fl_bitmap: u32,
    sl_bitmap: [u32; FL_INDEX_COUNT],
    blocks: [[*mut u8; SL_INDEX_COUNT]; FL_INDEX_COUNT],
}

impl Control {
    pub(crate) const fn new() -> Self {
        Self {
            fl_bitmap: 0,
            sl_bitmap: [0; FL_INDEX_COUNT],
            blocks: [[ptr::null_mut(); SL_INDEX_COUNT]; FL_INDEX_COUNT],
        }
    }

    #[inline]
    fn head(&self, m: Mapping) -> Block {
        Block(self.blocks[m.fl][m.sl])
    }

    /// Non-empty bin at or above `m`, with the bin it came from
    fn search_suitable_block(&self, m: Mapping) -> Option<(Block, Mapping)> {
        let mut fl = m.fl;
        let mut sl_map = self.sl_bitmap[fl] & (!0u32 << m.sl);
        if sl_map == 0 {
            let fl_map = self.fl_bitmap & (!0u32).checked_shl((fl + 1) as u32).unwrap_or(0);
            if fl_map == 0 {
                return None;
            }
            fl = fl_map.trailing_zeros() as usize;
            sl_map = self.sl_bitmap[fl];
        }
        let found = Mapping {
            fl,
            sl: sl_map.trailing_zeros() as usize,
        };
        Some((self.head(found), found))
    }

    unsafe fn remove_free_block(&mut self, block: Block, m: Mapping) {
        // SAFETY: block is on the free list for bin m
        unsafe {
            let prev = block.prev_free();
            let next = block.next_free();
            if !next.is_null() {
                next.set_link(PREV_FREE, prev);
            }
            if !prev.is_null() {
                prev.set_link(NEXT_FREE, next);
            }
            if self.head(m) == block {
                self.blocks[m.fl][m.sl] = next.0;
                if next.is_null() {
                    self.sl_bitmap[m.fl] &= !(1 << m.sl);
                    if self.sl_bitmap[m.fl] == 0 {
                        self.fl_bitmap &= !(1 << m.fl);
                    }
                }
            }
        }
    }

    unsafe fn insert_free_block(&mut self, block: Block, m: Mapping) {
        // SAFETY: block is a free block not on any list
        unsafe {
            let current = self.head(m);
            block.set_link(NEXT_FREE, current);
            block.set_link(PREV_FREE, Block::NULL);
            if !current.is_null() {
                current.set_link(PREV_FREE, block);
            }
        }
        self.blocks[m.fl][m.sl] = block.0;
        self.fl_bitmap |= 1 << m.fl;
        self.sl_bitmap[m.fl] |= 1 << m.sl;
    }

    unsafe fn block_remove(&mut self, block: Block) {
        // SAFETY: forwarded
        unsafe { self.remove_free_block(block, mapping_insert(block.size())) }
    }

    unsafe fn block_insert(&mut self, block: Block) {
        // SAFETY: forwarded
        unsafe { self.insert_free_block(block, mapping_insert(block.size())) }
    }

    unsafe fn merge_prev(&mut self, block: Block) -> Block {
        // SAFETY: the prev-free bit guarantees prev_phys is valid
        unsafe {
            if block.is_prev_free() {
                let prev = block.prev_phys();
                self.block_remove(prev);
                return prev.absorb(block);
            }
        }
        block
    }

    unsafe fn merge_next(&mut self, block: Block) -> Block {
        // SAFETY: every block has a physical successor (the pool sentinel
        // terminates the chain and is never free)
        unsafe {
            let next = block.next();
            if next.is_free() {
                self.block_remove(next);
                return block.absorb(next);
            }
        }
        block
    }

    /// Give back the tail of a free block past `size`
    unsafe fn trim_free(&mut self, block: Block, size: usize) {
        // SAFETY: forwarded
        unsafe {
            if block.can_split(size) {
                let remaining = block.split(size);
                block.link_next();
                remaining.set_prev_free();
                self.block_insert(remaining);
            }
        }
    }

    /// Give back the tail of a used block past `size`
    unsafe fn trim_used(&mut self, block: Block, size: usize) {
        // SAFETY: forwarded
        unsafe {
            if block.can_split(size) {
                let remaining = block.split(size);
                remaining.set_prev_used();
                let remaining = self.merge_next(remaining);
                self.block_insert(remaining);
            }
        }
    }

    /// Split `size` leading bytes off a free block and keep them free
    unsafe fn trim_free_leading(&mut self, block: Block, size: usize) -> Block {
        // SAFETY: forwarded
        unsafe {
            if block.can_split(size) {
                let remaining = block.split(size - BLOCK_OVERHEAD);
                remaining.set_prev_free();
                block.link_next();
                self.block_insert(block);
                return remaining;
            }
        }
        block
    }

    unsafe fn locate_free(&mut self, size: usize) -> Option<Block> {
        if size == 0 {
            return None;
        }
        let m = mapping_search(size);
        if m.fl >= FL_INDEX_COUNT {
            return None;
        }
        let (block, found) = self.search_suitable_block(m)?;
        // SAFETY: the bitmaps only flag bins that hold free blocks
        unsafe {
            debug_assert!(block.size() >= size);
            self.remove_free_block(block, found);
        }
        Some(block)
    }

    unsafe fn prepare_used(&mut self, block: Block, size: usize) -> *mut u8 {
        // SAFETY: forwarded
        unsafe {
            self.trim_free(block, size);
            block.mark_as_used();
        }
        block.to_ptr()
    }

    /// Allocate `size` bytes at the natural block alignment
    pub(crate) unsafe fn malloc(&mut self, size: usize) -> Option<*mut u8> {
        let adjusted = adjust_request_size(size, ALIGN_SIZE)?;
        // SAFETY: forwarded
        unsafe {
            let block = self.locate_free(adjusted)?;
            Some(self.prepare_used(block, adjusted))
        }
    }

    /// Allocate `size` bytes aligned to `align`
    pub(crate) unsafe fn memalign(&mut self, align: usize, size: usize) -> Option<*mut u8> {
        let adjusted = adjust_request_size(size, ALIGN_SIZE)?;
        // A leading gap must be big enough to become a free block itself
        let gap_minimum = 4 * WORD;
        let aligned_size = if align <= ALIGN_SIZE {
            adjusted
        } else {
            adjust_request_size(adjusted.checked_add(align)?.checked_add(gap_minimum)?, align)?
        };

        // SAFETY: forwarded
        unsafe {
            let mut block = self.locate_free(aligned_size)?;
            let ptr = block.to_ptr();
            let mut aligned = crate::utils::align_up(ptr as usize, align);
            let mut gap = aligned - ptr as usize;

            if gap != 0 && gap < gap_minimum {
                let gap_remain = gap_minimum - gap;
                let offset = gap_remain.max(align);
                aligned = crate::utils::align_up(aligned + offset, align);
                gap = aligned - ptr as usize;
            }
            if gap != 0 {
                block = self.trim_free_leading(block, gap);
            }
            Some(self.prepare_used(block, adjusted))
        }
    }

    /// Release the block at `ptr`. Returns false on a double free.
    pub(crate) unsafe fn free(&mut self, ptr: *mut u8) -> bool {
        let block = Block::from_ptr(ptr);
        // SAFETY: ptr came from this control (caller contract)
        unsafe {
            if block.is_free() {
                return false;
            }
            block.mark_as_free();
            let block = self.merge_prev(block);
            let block = self.merge_next(block);
            self.block_insert(block);
        }
        true
    }

    /// Resize in place when the block or its free successor has room.
    /// Returns `None` when the block has to move.
    pub(crate) unsafe fn realloc_in_place(&mut self, ptr: *mut u8, size: usize) -> Option<*mut u8> {
        let adjusted = adjust_request_size(size, ALIGN_SIZE)?;
        let block = Block::from_ptr(ptr);
        // SAFETY: ptr is a live allocation of this control
        unsafe {
            let next = block.next();
            let current = block.size();
            let combined = current + next.size() + BLOCK_OVERHEAD;
            if adjusted > current && (!next.is_free() || adjusted > combined) {
                return None;
            }
            if adjusted > current {
                self.merge_next(block);
                block.mark_as_used();
            }
            self.trim_used(block, adjusted);
        }
        Some(ptr)
    }

    /// Hand `bytes` starting at `mem` to the allocator as one free block.
    ///
    /// `mem` must be `ALIGN_SIZE`-aligned and `bytes` within the limits
    /// checked by the caller.
    pub(crate) unsafe fn add_pool(&mut self, mem: *mut u8, bytes: usize) {
        let pool_bytes = crate::utils::align_down(bytes - POOL_OVERHEAD, ALIGN_SIZE);
        // The first header starts one word before the pool; its prev_phys
        // field is never touched because the prev-free bit stays clear.
        let block = Block::at_offset(mem, -(BLOCK_OVERHEAD as isize));
        // SAFETY: the size word of the first block is mem[0..WORD], and the
        // sentinel sits in the last POOL_OVERHEAD bytes of the pool.
        unsafe {
            block.set(SIZE, 0);
            block.set_size(pool_bytes);
            block.set_free();
            block.set_prev_used();
            self.block_insert(block);

            let next = block.link_next();
            next.set(SIZE, 0);
            next.set_used();
            next.set_prev_free();
        }
    }

    /// Verify bitmaps against bin contents and that free blocks coalesced.
    pub(crate) unsafe fn check(&self) -> Result<(), CheckFailure> {
        for fl in 0..FL_INDEX_COUNT {
            for sl in 0..SL_INDEX_COUNT {
                let fl_map = self.fl_bitmap & (1 << fl) != 0;
                let sl_list = self.sl_bitmap[fl];
                let sl_map = sl_list & (1 << sl) != 0;
                let mut block = Block(self.blocks[fl][sl]);

                if !fl_map && sl_map {
                    return Err("second-level map must be empty when the first-level bit is clear");
                }
                if !sl_map {
                    if !block.is_null() {
                        return Err("bin must be empty when its bitmap bit is clear");
                    }
                    continue;
                }
                if sl_list == 0 || block.is_null() {
                    return Err("bin marked non-empty holds no blocks");
                }
                // SAFETY: every block on a free list lies inside a pool
                unsafe {
                    while !block.is_null() {
                        if !block.is_free() {
                            return Err("block on a free list is not marked free");
                        }
                        if block.is_prev_free() {
                            return Err("free block follows another free block");
                        }
                        let next = block.next();
                        if next.is_free() {
                            return Err("free block precedes another free block");
                        }
                        if !next.is_prev_free() {
                            return Err("successor of a free block does not know it");
                        }
                        if block.size() < BLOCK_SIZE_MIN {
                            return Err("free block below minimum size");
                        }
                        if mapping_insert(block.size()) != (Mapping { fl, sl }) {
                            return Err("free block filed in the wrong bin");
                        }
                        block = block.next_free();
                    }
                }
            }
        }
        Ok(())
    }

    /// Walk one pool physically, returning (used bytes, free bytes).
    pub(crate) unsafe fn walk_pool(mem: *mut u8) -> Result<(usize, usize), CheckFailure> {
        let mut block = Block::at_offset(mem, -(BLOCK_OVERHEAD as isize));
        let (mut used, mut free) = (0, 0);
        let mut prev_free = false;
        // SAFETY: the chain of physical blocks ends at the pool sentinel
        unsafe {
            while !block.is_last() {
                if block.is_prev_free() != prev_free {
                    return Err("prev-free bit disagrees with the previous block");
                }
                prev_free = block.is_free();
                if prev_free {
                    free += block.size();
                } else {
                    used += block.size();
                }
                block = block.next();
            }
            if block.is_prev_free() != prev_free {
                return Err("pool sentinel disagrees with the last block");
            }
        }
        Ok((used, free))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_sizes_map_linearly() {
        let step = SMALL_BLOCK_SIZE / SL_INDEX_COUNT;
        assert_eq!(mapping_insert(0), Mapping { fl: 0, sl: 0 });
        assert_eq!(mapping_insert(step), Mapping { fl: 0, sl: 1 });
        assert_eq!(
            mapping_insert(SMALL_BLOCK_SIZE - 1),
            Mapping {
                fl: 0,
                sl: SL_INDEX_COUNT - 1
            }
        );
    }

    #[test]
    fn test_large_sizes_map_by_power_of_two() {
        assert_eq!(mapping_insert(SMALL_BLOCK_SIZE), Mapping { fl: 1, sl: 0 });
        assert_eq!(
            mapping_insert(SMALL_BLOCK_SIZE * 2),
            Mapping { fl: 2, sl: 0 }
        );
        // halfway through a power of two lands halfway through the bins
        assert_eq!(
            mapping_insert(SMALL_BLOCK_SIZE * 3 / 2),
            Mapping {
                fl: 1,
                sl: SL_INDEX_COUNT / 2
            }
        );
    }

    #[test]
    fn test_search_rounds_up_to_next_bin() {
        let exact = mapping_insert(SMALL_BLOCK_SIZE + 1);
        let search = mapping_search(SMALL_BLOCK_SIZE + 1);
        assert_eq!(exact.fl, search.fl);
        assert_eq!(search.sl, exact.sl + 1);
    }

    #[test]
    fn test_adjust_request_size() {
        assert_eq!(adjust_request_size(1, ALIGN_SIZE), Some(BLOCK_SIZE_MIN));
        assert_eq!(adjust_request_size(100, ALIGN_SIZE), Some(crate::utils::align_up(100, ALIGN_SIZE)));
        assert_eq!(adjust_request_size(BLOCK_SIZE_MAX, ALIGN_SIZE), None);
        assert_eq!(adjust_request_size(usize::MAX, ALIGN_SIZE), None);
    }

    #[test]
    fn test_malloc_free_coalesces_back_to_one_block() {
        #[repr(align(16))]
        struct Pool([u8; 4096]);
        let mut pool = Pool([0; 4096]);
        let mut control = Control::new();
        unsafe {
            control.add_pool(pool.0.as_mut_ptr(), pool.0.len());
            let (_, free_before) = Control::walk_pool(pool.0.as_mut_ptr()).unwrap();

            let a = control.malloc(100).unwrap();
            let b = control.malloc(200).unwrap();
            let c = control.memalign(256, 64).unwrap();
            assert_eq!(c as usize % 256, 0);
            control.check().unwrap();

            assert!(control.free(b));
            assert!(control.free(a));
            assert!(control.free(c));
            control.check().unwrap();

            let (used, free_after) = Control::walk_pool(pool.0.as_mut_ptr()).unwrap();
            assert_eq!(used, 0);
            assert_eq!(free_after, free_before);
        }
    }

    #[test]
    fn test_double_free_is_reported() {
        #[repr(align(16))]
        struct Pool([u8; 1024]);
        let mut pool = Pool([0; 1024]);
        let mut control = Control::new();
        unsafe {
            control.add_pool(pool.0.as_mut_ptr(), pool.0.len());
            let a = control.malloc(32).unwrap();
            let _b = control.malloc(32).unwrap();
            assert!(control.free(a));
            assert!(!control.free(a));
        }
    }
}
