//! External block-provider boundary.
//!
//! The heap never talks to a device or an OS itself; it subdivides blocks
//! obtained from a [`BlockProvider`] and hands them back when the last
//! sub-allocation in a block goes away.

use core::num::NonZeroU64;
use core::ptr::NonNull;

use crate::handle::MemoryTypeId;

/// Largest block id the heap will track. Providers returning ids above
/// this make the block unrepresentable; the heap releases such a block at
/// once and fails the allocation.
pub const MAX_BLOCK_ID: u64 = (1 << 48) - 1;

/// Identifier of one provider block.
///
/// The value is opaque to the heap apart from being non-zero; it is echoed
/// back verbatim on every deallocate/map/unmap/commit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(NonZeroU64);

impl BlockId {
    /// `None` for zero, the provider's failure value.
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

/// Source of the native blocks a heap subdivides.
///
/// Every method is invoked while the calling heap's lock is held. An
/// implementation must not call back into that heap: the lock is not
/// recursive and the call would deadlock. Talking to other heaps or to the
/// device is fine.
///
/// `commit_range`/`decommit_range` are optional; the defaults make commit
/// a successful no-op, which is correct for providers whose blocks are
/// fully resident from creation.
pub trait BlockProvider {
    /// Produce a block of `bytes` bytes aligned to `align`, or `None` when
    /// the request cannot be satisfied.
    fn allocate_block(&self, ty: MemoryTypeId, bytes: u64, align: u64) -> Option<BlockId>;

    /// Release a block. `bytes` is the size the block was allocated with.
    fn deallocate_block(&self, ty: MemoryTypeId, block: BlockId, bytes: u64);

    /// CPU-map a whole block. `None` means this memory type is not
    /// CPU-visible; the heap reports the same to its caller.
    fn map_block(&self, ty: MemoryTypeId, block: BlockId) -> Option<NonNull<u8>>;

    /// Undo one successful [`map_block`](Self::map_block).
    fn unmap_block(&self, ty: MemoryTypeId, block: BlockId, base: NonNull<u8>);

    /// Back `bytes` bytes at `offset` within a block with memory. `false`
    /// fails the allocation that needed the range.
    fn commit_range(&self, ty: MemoryTypeId, block: BlockId, offset: u64, bytes: u64) -> bool {
        let _ = (ty, block, offset, bytes);
        true
    }

    /// Release the backing of `bytes` bytes at `offset` within a block.
    fn decommit_range(&self, ty: MemoryTypeId, block: BlockId, offset: u64, bytes: u64) -> bool {
        let _ = (ty, block, offset, bytes);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_rejects_zero() {
        assert_eq!(BlockId::new(0), None);
        let id = BlockId::new(7).expect("non-zero id");
        assert_eq!(id.get(), 7);
    }

    #[test]
    fn block_id_ceiling_leaves_headroom_below_u64() {
        assert!(MAX_BLOCK_ID < u64::MAX);
        assert!(BlockId::new(MAX_BLOCK_ID).is_some());
        // Ids above the ceiling are representable as BlockId values; the
        // heap itself enforces the ceiling so it can release the block.
        assert!(BlockId::new(MAX_BLOCK_ID + 1).is_some());
    }
}
