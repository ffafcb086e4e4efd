//! Tiny tier: 64-slot bitmap pages over one small block.
//!
//! Same shape as the small tier one level down. The backing storage is a
//! single small-tier block, acquired lazily at a fixed bin mapping and
//! marked as a host on its carrier page so the walk does not report it
//! as an application allocation.

use super::{GpuHeap, HeapCore, note_arena_exhausted};
use crate::arena::{Links, PageRecord, SlotIx, TinyPage};
use crate::bins::{TINY_PAGE_SLOTS, tiny_backing_small_bin, tiny_page_blocks};
use crate::error::AllocError;
use crate::handle::{HeapHandle, MemoryTypeId, PageKind};
use crate::provider::BlockProvider;

/// Bitmap with the low `blocks` bits set. `blocks` is `1..=64`.
const fn full_mask(blocks: u32) -> u64 {
    u64::MAX >> (TINY_PAGE_SLOTS - blocks)
}

impl<P: BlockProvider> GpuHeap<P> {
    pub(super) fn alloc_tiny(
        &self,
        core: &mut HeapCore,
        ty: MemoryTypeId,
        bin: usize,
    ) -> Result<HeapHandle, AllocError> {
        let ix = match core.types[ty.index()].tiny_avail[bin].head() {
            Some(ix) => ix,
            None => self.create_tiny_page(core, ty, bin)?,
        };
        let page = core.arena.tiny_mut(ix);
        let block = page.free_bits.trailing_zeros();
        debug_assert!(block < u32::from(page.blocks), "avail list held a full page");
        page.free_bits &= !(1u64 << block);
        if page.free_bits == 0 {
            let lists = &mut core.types[ty.index()];
            lists.tiny_avail[bin].remove(&mut core.arena, ix);
            lists.tiny_full[bin].push_front(&mut core.arena, ix);
        }
        let payload = HeapHandle::pack_block_payload(bin, block);
        Ok(HeapHandle::pack(ix, PageKind::Tiny, ty, payload))
    }

    /// Acquire a backing small block and wrap it in an empty tiny page
    /// on the avail list.
    fn create_tiny_page(
        &self,
        core: &mut HeapCore,
        ty: MemoryTypeId,
        bin: usize,
    ) -> Result<SlotIx, AllocError> {
        let backing = self.alloc_small(core, ty, tiny_backing_small_bin(bin))?;
        let blocks = tiny_page_blocks(bin);
        let record = PageRecord::Tiny(TinyPage {
            backing,
            bin: bin as u8,
            blocks: blocks as u8,
            free_bits: full_mask(blocks),
            list_links: Links::default(),
        });
        let Some(ix) = core.arena.allocate(record) else {
            self.free_small(core, backing);
            note_arena_exhausted(&core.arena);
            return Err(AllocError::ArenaExhausted);
        };
        core.arena.small_mut(backing.slot()).host_bits |= 1 << backing.payload_block();
        core.types[ty.index()].tiny_avail[bin].push_front(&mut core.arena, ix);
        Ok(ix)
    }

    pub(super) fn free_tiny(&self, core: &mut HeapCore, handle: HeapHandle) {
        let ty = handle.memory_type();
        let ix = handle.slot();
        let block = handle.payload_block();
        let bin = handle.payload_bin();
        let page = core.arena.tiny_mut(ix);
        debug_assert_eq!(usize::from(page.bin), bin, "bin mismatch");
        debug_assert!(block < u32::from(page.blocks), "block index out of range");
        let mask = 1u64 << block;
        debug_assert_eq!(page.free_bits & mask, 0, "double free of a tiny block");
        let was_full = page.free_bits == 0;
        page.free_bits |= mask;
        let empty = page.free_bits == full_mask(u32::from(page.blocks));
        let backing = page.backing;

        if empty {
            let lists = &mut core.types[ty.index()];
            if was_full {
                lists.tiny_full[bin].remove(&mut core.arena, ix);
            } else {
                lists.tiny_avail[bin].remove(&mut core.arena, ix);
            }
            core.arena.recycle(ix);
            core.arena.small_mut(backing.slot()).host_bits &= !(1 << backing.payload_block());
            self.free_small(core, backing);
        } else if was_full {
            let lists = &mut core.types[ty.index()];
            lists.tiny_full[bin].remove(&mut core.arena, ix);
            lists.tiny_avail[bin].push_front(&mut core.arena, ix);
        }
    }
}
