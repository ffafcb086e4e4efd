//! Diagnostic enumeration of live allocations.
//!
//! The walk visits every huge page chain and every tiny page of each
//! selected memory type and buckets each committed byte exactly once:
//! into an allocation, into free space, or into page-shaping slack
//! (counted as used). `used_bytes + free_bytes == total_bytes` holds for
//! every emitted summary.

use super::{GpuHeap, HeapCore, TypeLists};
use crate::arena::PageRecord;
use crate::bins::{TINY_BIN_COUNT, small_bin_bytes, tiny_backing_small_bin, tiny_bin_bytes};
use crate::handle::{HUGE_PAYLOAD, HeapHandle, MemoryTypeId, PageKind};
use crate::provider::BlockProvider;

/// One live allocation reported by [`GpuHeap::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationView {
    pub handle: HeapHandle,
    /// Reserved bytes, as [`GpuHeap::allocation_size`] reports them.
    pub bytes: u64,
}

/// Per-memory-type totals reported by [`GpuHeap::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeSummary {
    pub memory_type: MemoryTypeId,
    /// Committed provider bytes.
    pub total_bytes: u64,
    /// Bytes reserved by live allocations, plus page-shaping slack.
    pub used_bytes: u64,
    /// Bytes available without a new provider block: free regions and
    /// free sub-blocks.
    pub free_bytes: u64,
    pub huge_pages: u32,
    pub allocations: u64,
}

impl<P: BlockProvider> GpuHeap<P> {
    /// Enumerate live allocations and per-type totals for every memory
    /// type whose bit is set in `type_mask`. Allocation callbacks fire
    /// before their type's summary; types holding no huge pages are
    /// skipped. Holds the heap lock for the whole enumeration, so this
    /// is for tooling, not the allocation path.
    pub fn walk<S, A>(&self, type_mask: u32, mut on_summary: S, mut on_allocation: A)
    where
        S: FnMut(&TypeSummary),
        A: FnMut(&AllocationView),
    {
        let guard = self.core.lock();
        let core = &*guard;
        for ty in MemoryTypeId::all() {
            if type_mask & ty.mask_bit() == 0 {
                continue;
            }
            let lists = &core.types[ty.index()];
            if lists.huge_pages.is_empty() {
                continue;
            }
            let mut summary = TypeSummary {
                memory_type: ty,
                total_bytes: 0,
                used_bytes: 0,
                free_bytes: 0,
                huge_pages: 0,
                allocations: 0,
            };
            self.walk_huge_chains(core, lists, ty, &mut summary, &mut on_allocation);
            self.walk_tiny_pages(core, lists, ty, &mut summary, &mut on_allocation);
            on_summary(&summary);
        }
    }

    fn walk_huge_chains<A: FnMut(&AllocationView)>(
        &self,
        core: &HeapCore,
        lists: &TypeLists,
        ty: MemoryTypeId,
        summary: &mut TypeSummary,
        on_allocation: &mut A,
    ) {
        let region_bytes = self.config.region_bytes;
        for huge_ix in lists.huge_pages.iter(&core.arena) {
            let huge = core.arena.huge(huge_ix);
            summary.huge_pages += 1;
            let block_bytes = huge.regions * region_bytes;
            summary.total_bytes += block_bytes;
            let Some(first) = huge.first_page else {
                // Dedicated block, itself one allocation.
                summary.used_bytes += block_bytes;
                summary.allocations += 1;
                on_allocation(&AllocationView {
                    handle: HeapHandle::pack(huge_ix, PageKind::Huge, ty, HUGE_PAYLOAD),
                    bytes: block_bytes,
                });
                continue;
            };
            let mut cursor = Some(first);
            while let Some(ix) = cursor {
                cursor = match core.arena.get(ix) {
                    PageRecord::Large(page) => {
                        let bytes = u64::from(page.regions) * region_bytes;
                        if page.free {
                            if self.config.commit_regions {
                                // Free regions are decommitted: not
                                // provider-committed, not allocatable
                                // as-is.
                                summary.total_bytes -= bytes;
                            } else {
                                summary.free_bytes += bytes;
                            }
                        } else {
                            summary.used_bytes += bytes;
                            summary.allocations += 1;
                            on_allocation(&AllocationView {
                                handle: HeapHandle::pack(ix, PageKind::Large, ty, page.regions),
                                bytes,
                            });
                        }
                        page.phys_links.next
                    }
                    PageRecord::Small(page) => {
                        let bin = usize::from(page.bin);
                        let size = small_bin_bytes(bin);
                        let blocks = u32::from(page.blocks);
                        let page_bytes = u64::from(page.regions) * region_bytes;
                        summary.used_bytes += page_bytes - u64::from(blocks) * size;
                        for block in 0..blocks {
                            let mask = 1u32 << block;
                            if page.free_bits & mask != 0 {
                                summary.free_bytes += size;
                            } else if page.host_bits & mask == 0 {
                                summary.used_bytes += size;
                                summary.allocations += 1;
                                on_allocation(&AllocationView {
                                    handle: HeapHandle::pack(
                                        ix,
                                        PageKind::Small,
                                        ty,
                                        HeapHandle::pack_block_payload(bin, block),
                                    ),
                                    bytes: size,
                                });
                            }
                            // Host blocks are accounted by their tiny
                            // page.
                        }
                        page.phys_links.next
                    }
                    _ => unreachable!("record kind cannot sit in a physical chain"),
                };
            }
        }
    }

    fn walk_tiny_pages<A: FnMut(&AllocationView)>(
        &self,
        core: &HeapCore,
        lists: &TypeLists,
        ty: MemoryTypeId,
        summary: &mut TypeSummary,
        on_allocation: &mut A,
    ) {
        for bin in 0..TINY_BIN_COUNT {
            let size = tiny_bin_bytes(bin);
            let backing_bytes = small_bin_bytes(tiny_backing_small_bin(bin));
            for list in [&lists.tiny_avail[bin], &lists.tiny_full[bin]] {
                for ix in list.iter(&core.arena) {
                    let page = core.arena.tiny(ix);
                    debug_assert_eq!(usize::from(page.bin), bin, "page in the wrong bin list");
                    let blocks = u32::from(page.blocks);
                    summary.used_bytes += backing_bytes - u64::from(blocks) * size;
                    for block in 0..blocks {
                        if page.free_bits & 1 << block != 0 {
                            summary.free_bytes += size;
                        } else {
                            summary.used_bytes += size;
                            summary.allocations += 1;
                            on_allocation(&AllocationView {
                                handle: HeapHandle::pack(
                                    ix,
                                    PageKind::Tiny,
                                    ty,
                                    HeapHandle::pack_block_payload(bin, block),
                                ),
                                bytes: size,
                            });
                        }
                    }
                }
            }
        }
    }
}
