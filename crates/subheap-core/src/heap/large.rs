//! Large tier: whole-region sub-ranges of shared huge pages.
//!
//! Allocation pops a free page from the exact region class or a bounded
//! probe sequence of wider classes, cuts off the unneeded tail, and keeps
//! the head. Freeing merges the page with free physical neighbors in
//! constant time and releases the parent block when the merge spans it.

use super::{GpuHeap, HeapCore, note_arena_exhausted};
use crate::arena::{LargePage, Links, PageRecord, SlotIx};
use crate::bins::{MAX_LARGE_REGIONS, large_bin_for_free, large_probe_bins, select_large_bin};
use crate::error::AllocError;
use crate::handle::{HeapHandle, MemoryTypeId, PageKind};
use crate::list::{phys_insert_after, phys_unlink};
use crate::provider::BlockProvider;

impl<P: BlockProvider> GpuHeap<P> {
    pub(super) fn alloc_large(
        &self,
        core: &mut HeapCore,
        ty: MemoryTypeId,
        regions: u64,
    ) -> Result<HeapHandle, AllocError> {
        let ix = self.alloc_large_page(core, ty, regions)?;
        let allocated = core.arena.large(ix).regions;
        Ok(HeapHandle::pack(ix, PageKind::Large, ty, allocated))
    }

    /// A busy large page of exactly `regions` regions, committed when
    /// the heap commits. `regions` is `1..=MAX_LARGE_REGIONS`.
    pub(super) fn alloc_large_page(
        &self,
        core: &mut HeapCore,
        ty: MemoryTypeId,
        regions: u64,
    ) -> Result<SlotIx, AllocError> {
        let bin = select_large_bin(regions);
        for candidate in large_probe_bins(bin) {
            let popped = core.types[ty.index()].large_free[candidate].pop_front(&mut core.arena);
            if let Some(ix) = popped {
                return self.finish_large(core, ty, ix, regions);
            }
        }
        let (huge_ix, child_ix) = self.create_split_source(core, ty)?;
        match self.finish_large(core, ty, child_ix, regions) {
            Ok(ix) => Ok(ix),
            Err(err) => {
                // A failed cut leaves the whole span in its free class;
                // unlink it and release the block it came with.
                let class = large_bin_for_free(MAX_LARGE_REGIONS);
                core.types[ty.index()].large_free[class].remove(&mut core.arena, child_ix);
                self.destroy_huge(core, ty, huge_ix);
                Err(err)
            }
        }
    }

    /// Cut `regions` regions off the head of the free page `ix` and mark
    /// the head busy. On failure the page is back in its free class with
    /// its original span and nothing else has changed.
    fn finish_large(
        &self,
        core: &mut HeapCore,
        ty: MemoryTypeId,
        ix: SlotIx,
        regions: u64,
    ) -> Result<SlotIx, AllocError> {
        let page = core.arena.large(ix);
        debug_assert!(page.free, "free class held a busy page");
        let parent = page.parent;
        let first_region = page.first_region;
        let total = u64::from(page.regions);
        debug_assert!(
            total >= regions,
            "free class held a {total} region page for a {regions} region request"
        );
        let excess = total - regions;

        let mut tail = None;
        if excess > 0 {
            let record = PageRecord::Large(LargePage {
                parent,
                first_region: first_region + regions as u32,
                regions: excess as u32,
                free: true,
                bin_links: Links::default(),
                phys_links: Links::default(),
            });
            let Some(tail_ix) = core.arena.allocate(record) else {
                core.types[ty.index()].large_free[large_bin_for_free(total)]
                    .push_front(&mut core.arena, ix);
                note_arena_exhausted(&core.arena);
                return Err(AllocError::ArenaExhausted);
            };
            phys_insert_after(&mut core.arena, ix, tail_ix);
            core.types[ty.index()].large_free[large_bin_for_free(excess)]
                .push_front(&mut core.arena, tail_ix);
            core.arena.large_mut(ix).regions = regions as u32;
            tail = Some(tail_ix);
        }

        if self.config.commit_regions {
            let block = core.arena.huge(parent).block;
            let offset = u64::from(first_region) * self.config.region_bytes;
            let bytes = regions * self.config.region_bytes;
            if !self.provider.commit_range(ty, block, offset, bytes) {
                log::debug!(
                    "provider declined to commit {bytes} bytes for memory type {}",
                    ty.get()
                );
                if let Some(tail_ix) = tail {
                    core.types[ty.index()].large_free[large_bin_for_free(excess)]
                        .remove(&mut core.arena, tail_ix);
                    phys_unlink(&mut core.arena, parent, tail_ix);
                    core.arena.recycle(tail_ix);
                    core.arena.large_mut(ix).regions = total as u32;
                }
                core.types[ty.index()].large_free[large_bin_for_free(total)]
                    .push_front(&mut core.arena, ix);
                return Err(AllocError::ProviderExhausted);
            }
        }

        core.arena.large_mut(ix).free = false;
        Ok(ix)
    }

    /// Free a busy large page, merging free physical neighbors into it;
    /// a merge spanning the whole parent releases the parent block.
    pub(super) fn free_large(&self, core: &mut HeapCore, ty: MemoryTypeId, ix: SlotIx) {
        let page = core.arena.large_mut(ix);
        debug_assert!(!page.free, "double free of a large page");
        page.free = true;
        let parent = page.parent;
        let freed_offset = u64::from(page.first_region) * self.config.region_bytes;
        let freed_bytes = u64::from(page.regions) * self.config.region_bytes;
        let neighbors = page.phys_links;

        if self.config.commit_regions {
            let block = core.arena.huge(parent).block;
            self.provider
                .decommit_range(ty, block, freed_offset, freed_bytes);
        }

        let mut right = None;
        if let Some(next) = neighbors.next
            && let PageRecord::Large(n) = core.arena.get(next)
            && n.free
        {
            right = Some((next, n.regions));
        }
        if let Some((next, n_regions)) = right {
            core.types[ty.index()].large_free[large_bin_for_free(u64::from(n_regions))]
                .remove(&mut core.arena, next);
            phys_unlink(&mut core.arena, parent, next);
            core.arena.recycle(next);
            core.arena.large_mut(ix).regions += n_regions;
        }

        let mut left = None;
        if let Some(prev) = neighbors.prev
            && let PageRecord::Large(n) = core.arena.get(prev)
            && n.free
        {
            left = Some((prev, n.first_region, n.regions));
        }
        if let Some((prev, n_first, n_regions)) = left {
            core.types[ty.index()].large_free[large_bin_for_free(u64::from(n_regions))]
                .remove(&mut core.arena, prev);
            phys_unlink(&mut core.arena, parent, prev);
            core.arena.recycle(prev);
            let page = core.arena.large_mut(ix);
            page.first_region = n_first;
            page.regions += n_regions;
        }

        let merged = u64::from(core.arena.large(ix).regions);
        if merged == core.arena.huge(parent).regions {
            self.destroy_huge(core, ty, parent);
        } else {
            core.types[ty.index()].large_free[large_bin_for_free(merged)]
                .push_front(&mut core.arena, ix);
        }
    }
}
