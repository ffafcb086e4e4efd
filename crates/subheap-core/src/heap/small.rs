//! Small tier: 32-slot bitmap pages over one large page.
//!
//! A small page is a busy large page reshaped in place into a carrier of
//! same-size sub-blocks. Set bitmap bits are free blocks; allocation
//! always takes the lowest one. Pages migrate between an avail list and
//! a full list per bin so a heap walk can reach every page.

use super::{GpuHeap, HeapCore};
use crate::arena::{LargePage, Links, PageRecord, SmallPage, SlotIx};
use crate::bins::{SMALL_PAGE_SLOTS, small_page_shape};
use crate::error::AllocError;
use crate::handle::{HeapHandle, MemoryTypeId, PageKind};
use crate::provider::BlockProvider;

/// Bitmap with the low `blocks` bits set. `blocks` is `1..=32`.
const fn full_mask(blocks: u32) -> u32 {
    u32::MAX >> (SMALL_PAGE_SLOTS - blocks)
}

impl<P: BlockProvider> GpuHeap<P> {
    pub(super) fn alloc_small(
        &self,
        core: &mut HeapCore,
        ty: MemoryTypeId,
        bin: usize,
    ) -> Result<HeapHandle, AllocError> {
        let ix = match core.types[ty.index()].small_avail[bin].head() {
            Some(ix) => ix,
            None => self.create_small_page(core, ty, bin)?,
        };
        let page = core.arena.small_mut(ix);
        let block = page.free_bits.trailing_zeros();
        debug_assert!(block < u32::from(page.blocks), "avail list held a full page");
        page.free_bits &= !(1 << block);
        if page.free_bits == 0 {
            let lists = &mut core.types[ty.index()];
            lists.small_avail[bin].remove(&mut core.arena, ix);
            lists.small_full[bin].push_front(&mut core.arena, ix);
        }
        let payload = HeapHandle::pack_block_payload(bin, block);
        Ok(HeapHandle::pack(ix, PageKind::Small, ty, payload))
    }

    /// Cut a large page sized for this bin and reshape it into an empty
    /// small page on the avail list.
    fn create_small_page(
        &self,
        core: &mut HeapCore,
        ty: MemoryTypeId,
        bin: usize,
    ) -> Result<SlotIx, AllocError> {
        let shape = small_page_shape(bin, self.config.region_bytes);
        let ix = self.alloc_large_page(core, ty, shape.regions)?;
        // Same slot, new record kind: physical neighbors keep pointing
        // at a valid chain member.
        let (parent, first_region, regions, phys_links) = {
            let page = core.arena.large(ix);
            (page.parent, page.first_region, page.regions, page.phys_links)
        };
        *core.arena.get_mut(ix) = PageRecord::Small(SmallPage {
            parent,
            first_region,
            regions,
            bin: bin as u8,
            blocks: shape.blocks as u8,
            free_bits: full_mask(shape.blocks),
            host_bits: 0,
            list_links: Links::default(),
            phys_links,
        });
        core.types[ty.index()].small_avail[bin].push_front(&mut core.arena, ix);
        Ok(ix)
    }

    pub(super) fn free_small(&self, core: &mut HeapCore, handle: HeapHandle) {
        let ty = handle.memory_type();
        let ix = handle.slot();
        let block = handle.payload_block();
        let bin = handle.payload_bin();
        let page = core.arena.small_mut(ix);
        debug_assert_eq!(usize::from(page.bin), bin, "bin mismatch");
        debug_assert!(block < u32::from(page.blocks), "block index out of range");
        let mask = 1u32 << block;
        debug_assert_eq!(page.free_bits & mask, 0, "double free of a small block");
        debug_assert_eq!(page.host_bits & mask, 0, "block still hosts a tiny page");
        let was_full = page.free_bits == 0;
        page.free_bits |= mask;
        let empty = page.free_bits == full_mask(u32::from(page.blocks));

        if empty {
            debug_assert_eq!(page.host_bits, 0, "empty page with live tiny hosts");
            let lists = &mut core.types[ty.index()];
            if was_full {
                lists.small_full[bin].remove(&mut core.arena, ix);
            } else {
                lists.small_avail[bin].remove(&mut core.arena, ix);
            }
            // Reshape back into the busy large page the carrier was cut
            // from and let the large tier coalesce it.
            let (parent, first_region, regions, phys_links) = {
                let page = core.arena.small(ix);
                (page.parent, page.first_region, page.regions, page.phys_links)
            };
            *core.arena.get_mut(ix) = PageRecord::Large(LargePage {
                parent,
                first_region,
                regions,
                free: false,
                bin_links: Links::default(),
                phys_links,
            });
            self.free_large(core, ty, ix);
        } else if was_full {
            let lists = &mut core.types[ty.index()];
            lists.small_full[bin].remove(&mut core.arena, ix);
            lists.small_avail[bin].push_front(&mut core.arena, ix);
        }
    }
}
