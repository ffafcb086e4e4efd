//! Huge tier: whole provider blocks.
//!
//! A huge page either carries children (a split source cut up by the
//! large tier) or is itself one allocation (a dedicated block for
//! requests the shared tiers cannot place).

use core::num::NonZeroUsize;

use super::{GpuHeap, HeapCore, mapped_ptr, note_arena_exhausted};
use crate::arena::{HugePage, LargePage, Links, PageRecord, SlotIx};
use crate::bins::MAX_LARGE_REGIONS;
use crate::error::AllocError;
use crate::handle::{HUGE_PAYLOAD, HeapHandle, MemoryTypeId, PageKind};
use crate::list::phys_unlink;
use crate::provider::{BlockId, BlockProvider, MAX_BLOCK_ID};

impl<P: BlockProvider> GpuHeap<P> {
    /// Ask the provider for a block, enforcing the id ceiling.
    fn acquire_block(
        &self,
        ty: MemoryTypeId,
        bytes: u64,
        align: u64,
    ) -> Result<BlockId, AllocError> {
        let Some(block) = self.provider.allocate_block(ty, bytes, align) else {
            log::debug!(
                "provider declined {bytes} bytes for memory type {}",
                ty.get()
            );
            return Err(AllocError::ProviderExhausted);
        };
        if block.get() > MAX_BLOCK_ID {
            log::error!(
                "provider block id {:#x} exceeds the representable ceiling; releasing it",
                block.get()
            );
            self.provider.deallocate_block(ty, block, bytes);
            return Err(AllocError::BlockIdOverflow);
        }
        Ok(block)
    }

    fn persistent_map_base(&self, ty: MemoryTypeId, block: BlockId) -> Option<NonZeroUsize> {
        self.provider
            .map_block(ty, block)
            .and_then(|base| NonZeroUsize::new(base.as_ptr() as usize))
    }

    /// New split-source huge page holding one whole-span free large
    /// child. Returns `(huge, child)`; the child is not in any free
    /// class, the caller cuts it up or releases it.
    pub(super) fn create_split_source(
        &self,
        core: &mut HeapCore,
        ty: MemoryTypeId,
    ) -> Result<(SlotIx, SlotIx), AllocError> {
        let bytes = MAX_LARGE_REGIONS * self.config.region_bytes;
        let block = self.acquire_block(ty, bytes, self.config.region_bytes)?;
        let Some(huge_ix) = core.arena.allocate(PageRecord::Huge(HugePage {
            block,
            regions: MAX_LARGE_REGIONS,
            mapped: None,
            map_count: 0,
            first_page: None,
            links: Links::default(),
        })) else {
            self.provider.deallocate_block(ty, block, bytes);
            note_arena_exhausted(&core.arena);
            return Err(AllocError::ArenaExhausted);
        };
        let Some(child_ix) = core.arena.allocate(PageRecord::Large(LargePage {
            parent: huge_ix,
            first_region: 0,
            regions: MAX_LARGE_REGIONS as u32,
            free: true,
            bin_links: Links::default(),
            phys_links: Links::default(),
        })) else {
            core.arena.recycle(huge_ix);
            self.provider.deallocate_block(ty, block, bytes);
            note_arena_exhausted(&core.arena);
            return Err(AllocError::ArenaExhausted);
        };
        if self.config.persistent_map {
            // A non-CPU-visible type simply stays unmapped.
            core.arena.huge_mut(huge_ix).mapped = self.persistent_map_base(ty, block);
        }
        core.arena.huge_mut(huge_ix).first_page = Some(child_ix);
        core.types[ty.index()]
            .huge_pages
            .push_front(&mut core.arena, huge_ix);
        Ok((huge_ix, child_ix))
    }

    /// One block per allocation: requests beyond the large tier or with
    /// alignment above the region size.
    pub(super) fn alloc_dedicated(
        &self,
        core: &mut HeapCore,
        ty: MemoryTypeId,
        bytes: u64,
        align: u64,
    ) -> Result<HeapHandle, AllocError> {
        let regions = bytes.div_ceil(self.config.region_bytes);
        let Some(block_bytes) = regions.checked_mul(self.config.region_bytes) else {
            log::debug!(
                "no single block can span {bytes} bytes for memory type {}",
                ty.get()
            );
            return Err(AllocError::ProviderExhausted);
        };
        let align = align.max(self.config.region_bytes);
        let block = self.acquire_block(ty, block_bytes, align)?;
        let Some(ix) = core.arena.allocate(PageRecord::Huge(HugePage {
            block,
            regions,
            mapped: None,
            map_count: 0,
            first_page: None,
            links: Links::default(),
        })) else {
            self.provider.deallocate_block(ty, block, block_bytes);
            note_arena_exhausted(&core.arena);
            return Err(AllocError::ArenaExhausted);
        };
        if self.config.persistent_map {
            core.arena.huge_mut(ix).mapped = self.persistent_map_base(ty, block);
        }
        if self.config.commit_regions && !self.provider.commit_range(ty, block, 0, block_bytes) {
            log::debug!(
                "provider declined to commit {block_bytes} bytes for memory type {}",
                ty.get()
            );
            if let Some(ptr) = core.arena.huge_mut(ix).mapped.take().and_then(mapped_ptr) {
                self.provider.unmap_block(ty, block, ptr);
            }
            core.arena.recycle(ix);
            self.provider.deallocate_block(ty, block, block_bytes);
            return Err(AllocError::ProviderExhausted);
        }
        core.types[ty.index()]
            .huge_pages
            .push_front(&mut core.arena, ix);
        Ok(HeapHandle::pack(ix, PageKind::Huge, ty, HUGE_PAYLOAD))
    }

    pub(super) fn free_dedicated(&self, core: &mut HeapCore, handle: HeapHandle) {
        let ix = handle.slot();
        debug_assert!(
            core.arena.huge(ix).first_page.is_none(),
            "dedicated handle names a split huge page"
        );
        self.destroy_huge(core, handle.memory_type(), ix);
    }

    /// Release a huge page whose chain is empty or a single free child
    /// not linked in any free class.
    pub(super) fn destroy_huge(&self, core: &mut HeapCore, ty: MemoryTypeId, huge_ix: SlotIx) {
        if let Some(child) = core.arena.huge(huge_ix).first_page {
            debug_assert!(
                core.arena.large(child).free,
                "child of a dying huge page is busy"
            );
            debug_assert_eq!(
                u64::from(core.arena.large(child).regions),
                core.arena.huge(huge_ix).regions,
                "child of a dying huge page does not span it"
            );
            phys_unlink(&mut core.arena, huge_ix, child);
            core.arena.recycle(child);
        }
        core.types[ty.index()]
            .huge_pages
            .remove(&mut core.arena, huge_ix);
        let huge = core.arena.huge(huge_ix);
        let block = huge.block;
        let bytes = huge.regions * self.config.region_bytes;
        debug_assert_eq!(huge.map_count, 0, "outstanding maps on a dying huge page");
        if let Some(ptr) = huge.mapped.and_then(mapped_ptr) {
            self.provider.unmap_block(ty, block, ptr);
        }
        core.arena.recycle(huge_ix);
        self.provider.deallocate_block(ty, block, bytes);
    }
}
