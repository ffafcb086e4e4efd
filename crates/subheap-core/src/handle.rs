//! One-word allocation handles.
//!
//! A handle packs the owning page record's arena slot, the page kind, the
//! memory type, and a kind-specific payload into a single `u64`. Arena slot
//! 0 is reserved, so a packed handle is never zero; `NonZeroU64` makes that
//! visible in the type.
//!
//! Layout, low to high bits:
//!
//! | bits  | field                                              |
//! |-------|----------------------------------------------------|
//! | 0..24 | arena slot index (non-zero)                        |
//! | 24..26| page kind                                          |
//! | 26..31| memory type                                        |
//! | 31    | reserved, zero                                     |
//! | 32..64| payload: tiny/small `bin | block << 8`, large the  |
//! |       | allocated region count, huge the sentinel `1`      |

use core::num::{NonZeroU32, NonZeroU64};

use crate::arena::SlotIx;

/// Number of memory types a heap tracks.
pub const MAX_MEMORY_TYPES: usize = 32;

const INDEX_MASK: u64 = (1 << 24) - 1;
const KIND_SHIFT: u32 = 24;
const TYPE_SHIFT: u32 = 26;
const PAYLOAD_SHIFT: u32 = 32;
const RESERVED_BIT: u64 = 1 << 31;

/// Payload value carried by every huge-page handle.
pub(crate) const HUGE_PAYLOAD: u32 = 1;

/// Index of a memory type, `0..MAX_MEMORY_TYPES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryTypeId(u8);

impl MemoryTypeId {
    /// `None` when `index` is not below [`MAX_MEMORY_TYPES`].
    #[must_use]
    pub const fn new(index: u8) -> Option<Self> {
        if (index as usize) < MAX_MEMORY_TYPES {
            Some(Self(index))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// This type's bit in a walk mask.
    #[must_use]
    pub const fn mask_bit(self) -> u32 {
        1 << self.0
    }

    /// Every memory type, in ascending index order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..MAX_MEMORY_TYPES as u8).filter_map(Self::new)
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which tier owns a handle's page record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageKind {
    Tiny = 0,
    Small = 1,
    Large = 2,
    Huge = 3,
}

impl PageKind {
    const fn from_bits(bits: u64) -> Self {
        match bits & 3 {
            0 => PageKind::Tiny,
            1 => PageKind::Small,
            2 => PageKind::Large,
            _ => PageKind::Huge,
        }
    }
}

/// Packed reference to one live allocation.
///
/// Handles are plain values: copying one does not extend the allocation's
/// life, and using one after `free` is out of contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapHandle(NonZeroU64);

impl HeapHandle {
    pub(crate) fn pack(slot: SlotIx, kind: PageKind, ty: MemoryTypeId, payload: u32) -> Self {
        debug_assert!(slot.get() as u64 <= INDEX_MASK, "slot {} overflows the index field", slot.get());
        let rest = ((kind as u64) << KIND_SHIFT)
            | ((ty.get() as u64) << TYPE_SHIFT)
            | ((payload as u64) << PAYLOAD_SHIFT);
        Self(NonZeroU64::from(slot.as_nonzero()) | rest)
    }

    pub(crate) fn pack_block_payload(bin: usize, block: u32) -> u32 {
        debug_assert!(bin < 0x100 && block < 0x100);
        (bin as u32) | (block << 8)
    }

    /// The raw word, suitable for storage in foreign data structures.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0.get()
    }

    /// Rebuild a handle from [`raw`](Self::raw) output. Rejects words that
    /// no `pack` call can produce; it cannot tell a stale handle from a
    /// live one.
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        let word = NonZeroU64::new(raw)?;
        if raw & INDEX_MASK == 0 || raw & RESERVED_BIT != 0 {
            return None;
        }
        Some(Self(word))
    }

    #[must_use]
    pub fn kind(self) -> PageKind {
        PageKind::from_bits(self.0.get() >> KIND_SHIFT)
    }

    /// The memory type this allocation was made from.
    #[must_use]
    pub fn memory_type(self) -> MemoryTypeId {
        let bits = ((self.0.get() >> TYPE_SHIFT) as u8) & (MAX_MEMORY_TYPES as u8 - 1);
        MemoryTypeId(bits)
    }

    pub(crate) fn slot(self) -> SlotIx {
        let bits = (self.0.get() & INDEX_MASK) as u32;
        match NonZeroU32::new(bits) {
            Some(ix) => SlotIx::from_nonzero(ix),
            None => unreachable!("handle index bits are never zero"),
        }
    }

    pub(crate) fn payload(self) -> u32 {
        (self.0.get() >> PAYLOAD_SHIFT) as u32
    }

    pub(crate) fn payload_bin(self) -> usize {
        (self.payload() & 0xFF) as usize
    }

    pub(crate) fn payload_block(self) -> u32 {
        (self.payload() >> 8) & 0xFF
    }
}
