//! In-band allocation headers
//!
//! Stack-style and ring allocators keep a few bytes of metadata directly in
//! front of each payload. All pointer arithmetic for those headers lives
//! here so the allocators only deal in offsets.

use crate::utils::align_with_header;

/// Header in front of every stack allocation.
///
/// `padding` is the distance from the allocator head at allocation time to
/// the payload, so freeing rewinds the head by exactly that much.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StackHeader {
    pub padding: u32,
    pub alloc_id: u32,
}

impl StackHeader {
    pub const SIZE: usize = size_of::<Self>();

    /// Payload address for an allocation starting at `head`, or `None` when
    /// the padding would not fit in the header.
    #[inline]
    pub fn payload_addr(head: usize, align: usize) -> Option<usize> {
        let payload = align_with_header(head, Self::SIZE, align);
        u32::try_from(payload - head).ok().map(|_| payload)
    }

    /// # Safety
    /// `payload - SIZE .. payload` must be writable.
    #[inline]
    pub unsafe fn write_before(payload: *mut u8, header: Self) {
        // SAFETY: caller guarantees the header bytes are in bounds; the
        // payload may be less aligned than the header.
        unsafe { payload.sub(Self::SIZE).cast::<Self>().write_unaligned(header) }
    }

    /// # Safety
    /// `payload` must have been written with [`StackHeader::write_before`].
    #[inline]
    pub unsafe fn read_before(payload: *const u8) -> Self {
        // SAFETY: see write_before
        unsafe { payload.sub(Self::SIZE).cast::<Self>().read_unaligned() }
    }
}

/// Word at the start of every ring slot: slot length plus a free bit.
///
/// Between the header and the payload the gap is filled with
/// [`ScratchHeader::PAD`] words so the header can be found from the payload
/// pointer alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScratchHeader(u32);

impl ScratchHeader {
    pub const SIZE: usize = size_of::<u32>();
    pub const FREE_BIT: u32 = 0x8000_0000;
    pub const PAD: u32 = u32::MAX;

    #[inline]
    pub const fn used(slot_len: u32) -> Self {
        Self(slot_len)
    }

    #[inline]
    pub const fn free(slot_len: u32) -> Self {
        Self(slot_len | Self::FREE_BIT)
    }

    #[inline]
    pub const fn is_free(self) -> bool {
        self.0 & Self::FREE_BIT != 0
    }

    #[inline]
    pub const fn slot_len(self) -> usize {
        (self.0 & !Self::FREE_BIT) as usize
    }

    #[inline]
    pub const fn mark_free(self) -> Self {
        Self(self.0 | Self::FREE_BIT)
    }

    /// # Safety
    /// `at` must be 4-byte aligned and writable.
    #[inline]
    pub unsafe fn write(at: *mut u8, header: Self) {
        // SAFETY: caller contract
        unsafe { at.cast::<u32>().write(header.0) }
    }

    /// # Safety
    /// `at` must be 4-byte aligned and hold a header word.
    #[inline]
    pub unsafe fn read(at: *const u8) -> Self {
        // SAFETY: caller contract
        Self(unsafe { at.cast::<u32>().read() })
    }

    /// Fill `header_at + SIZE .. payload` with pad words.
    ///
    /// # Safety
    /// The range must be writable and both ends 4-byte aligned.
    #[inline]
    pub unsafe fn write_padding(header_at: *mut u8, payload: *mut u8) {
        // SAFETY: caller contract; steps stay inside header_at..payload
        unsafe {
            let mut word = header_at.add(Self::SIZE).cast::<u32>();
            let stop = payload.cast::<u32>();
            while word < stop {
                word.write(Self::PAD);
                word = word.add(1);
            }
        }
    }

    /// Locate the header of the slot owning `payload`.
    ///
    /// # Safety
    /// `payload` must come from a slot written with
    /// [`ScratchHeader::write`] and [`ScratchHeader::write_padding`].
    #[inline]
    pub unsafe fn find_from_payload(payload: *mut u8) -> *mut u8 {
        // SAFETY: caller contract; a real header terminates the walk since
        // a header word can never equal PAD.
        unsafe {
            let mut word = payload.cast::<u32>().sub(1);
            while word.read() == Self::PAD {
                word = word.sub(1);
            }
            word.cast::<u8>()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_header_round_trip_unaligned() {
        let mut buf = [0u8; 32];
        let base = buf.as_mut_ptr();
        let header = StackHeader {
            padding: 11,
            alloc_id: 42,
        };
        unsafe {
            // payload deliberately not 4-aligned relative to the buffer
            let payload = base.add(11);
            StackHeader::write_before(payload, header);
            assert_eq!(StackHeader::read_before(payload), header);
        }
    }

    #[test]
    fn test_stack_payload_addr_leaves_header_room() {
        let payload = StackHeader::payload_addr(0x1000, 16).unwrap();
        assert_eq!(payload, 0x1010);
        assert!(payload - 0x1000 >= StackHeader::SIZE);

        let payload = StackHeader::payload_addr(0x1003, 1).unwrap();
        assert_eq!(payload, 0x1003 + StackHeader::SIZE);
    }

    #[test]
    fn test_scratch_header_bits() {
        let header = ScratchHeader::used(72);
        assert!(!header.is_free());
        assert_eq!(header.slot_len(), 72);
        let freed = header.mark_free();
        assert!(freed.is_free());
        assert_eq!(freed.slot_len(), 72);
        assert_eq!(ScratchHeader::free(16).slot_len(), 16);
        assert_ne!(ScratchHeader::free(0x7FFF_FFFC).0, ScratchHeader::PAD);
    }

    #[test]
    fn test_scratch_header_found_through_padding() {
        let mut words = [0u32; 8];
        let base = words.as_mut_ptr().cast::<u8>();
        unsafe {
            ScratchHeader::write(base, ScratchHeader::used(32));
            let payload = base.add(16);
            ScratchHeader::write_padding(base, payload);
            assert_eq!(ScratchHeader::find_from_payload(payload), base);

            // No padding: header sits right before the payload
            let payload = base.add(ScratchHeader::SIZE);
            assert_eq!(ScratchHeader::find_from_payload(payload), base);
        }
    }
}
