//! 32-bit handles into an [`AtomicLinkedPool`](super::AtomicLinkedPool)
//!
//! # Bit Layout
//! ```text
//! with generation checks:     [ 0 0 0 | generation:13 | index+1:16 ]
//! without generation checks:  [ 0 0 0 |          index+1:29        ]
//! ```
//! An `index+1` of zero is [`Handle::NONE`].

use core::fmt;

/// Opaque reference to a pool slot
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    /// Refers to no slot
    pub const NONE: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("Handle(NONE)")
        } else {
            write!(f, "Handle({:#010x})", self.0)
        }
    }
}

/// Field widths for one pool flavour
pub(crate) struct HandleLayout<const GEN_CHECK: bool>;

impl<const GEN_CHECK: bool> HandleLayout<GEN_CHECK> {
    pub const INDEX_BITS: u32 = if GEN_CHECK { 16 } else { 29 };
    pub const GENERATION_BITS: u32 = if GEN_CHECK { 13 } else { 0 };

    const INDEX_MASK: u32 = (1 << Self::INDEX_BITS) - 1;
    pub const GENERATION_MASK: u32 = (1 << Self::GENERATION_BITS) - 1;
    const USED_MASK: u32 = (1 << (Self::INDEX_BITS + Self::GENERATION_BITS)) - 1;

    /// Largest slot count the index field can address
    pub const MAX_SLOTS: usize = Self::INDEX_MASK as usize;

    /// `index` must be below [`Self::MAX_SLOTS`]. Only the low
    /// [`Self::GENERATION_BITS`] of `generation` are kept.
    #[inline]
    pub const fn encode(index: usize, generation: u32) -> Handle {
        let generation = generation & Self::GENERATION_MASK;
        Handle((generation << Self::INDEX_BITS) | (index as u32 + 1))
    }

    /// Slot index and generation, or `None` for [`Handle::NONE`] and
    /// handles with the padding bits set.
    #[inline]
    pub const fn decode(handle: Handle) -> Option<(usize, u32)> {
        let raw = handle.0;
        let index_plus_one = raw & Self::INDEX_MASK;
        if index_plus_one == 0 || raw & !Self::USED_MASK != 0 {
            return None;
        }
        Some((
            (index_plus_one - 1) as usize,
            (raw >> Self::INDEX_BITS) & Self::GENERATION_MASK,
        ))
    }
}
