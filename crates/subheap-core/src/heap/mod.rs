//! The heap facade.
//!
//! A [`GpuHeap`] owns one [`BlockProvider`] and subdivides the provider's
//! blocks through four tiers. Requests up to 512 bytes land in tiny pages
//! (64-slot bitmaps over one small block), requests up to 8 KiB in small
//! pages (32-slot bitmaps over one large page), region-granular requests
//! up to 256 regions in large pages (sub-ranges of a shared huge page),
//! and everything else in a dedicated huge page wrapping its own block.
//!
//! All bookkeeping lives in a fixed-capacity [`PageArena`] guarded by one
//! non-recursive mutex; provider calls are made while that lock is held.
//! Every multi-step allocation unwinds completely on failure, so a
//! returned error never leaves a partial page behind.

mod huge;
mod large;
mod small;
mod tiny;
mod walk;

pub use walk::{AllocationView, TypeSummary};

use core::array;
use core::num::NonZeroUsize;
use core::ptr::NonNull;

use parking_lot::Mutex;

use crate::arena::{PageArena, SlotIx};
use crate::bins::{
    LARGE_BIN_COUNT, MAX_LARGE_REGIONS, SMALL_BIN_COUNT, SizeBin, TINY_BIN_COUNT,
    select_size_bin_aligned, small_bin_bytes, tiny_bin_bytes,
};
use crate::config::HeapConfig;
use crate::error::{AllocError, ConfigError};
use crate::handle::{HeapHandle, MAX_MEMORY_TYPES, MemoryTypeId, PageKind};
use crate::list::{BinLink, SlotList};
use crate::provider::BlockProvider;

/// Bin lists of one memory type.
struct TypeLists {
    tiny_avail: [SlotList<BinLink>; TINY_BIN_COUNT],
    tiny_full: [SlotList<BinLink>; TINY_BIN_COUNT],
    small_avail: [SlotList<BinLink>; SMALL_BIN_COUNT],
    small_full: [SlotList<BinLink>; SMALL_BIN_COUNT],
    large_free: [SlotList<BinLink>; LARGE_BIN_COUNT],
    huge_pages: SlotList<BinLink>,
}

impl TypeLists {
    fn new() -> Self {
        Self {
            tiny_avail: array::from_fn(|_| SlotList::new()),
            tiny_full: array::from_fn(|_| SlotList::new()),
            small_avail: array::from_fn(|_| SlotList::new()),
            small_full: array::from_fn(|_| SlotList::new()),
            large_free: array::from_fn(|_| SlotList::new()),
            huge_pages: SlotList::new(),
        }
    }
}

/// Mutex-guarded heap state.
struct HeapCore {
    arena: PageArena,
    types: Vec<TypeLists>,
}

/// A sub-allocating heap over one block provider.
pub struct GpuHeap<P: BlockProvider> {
    provider: P,
    config: HeapConfig,
    core: Mutex<HeapCore>,
}

impl<P: BlockProvider> GpuHeap<P> {
    /// Build a heap. Fails only on invalid configuration; no provider
    /// call is made until the first allocation.
    pub fn new(config: HeapConfig, provider: P) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            provider,
            config,
            core: Mutex::new(HeapCore {
                arena: PageArena::new(config.slot_capacity),
                types: (0..MAX_MEMORY_TYPES).map(|_| TypeLists::new()).collect(),
            }),
        })
    }

    /// The configuration the heap was built with.
    pub fn config(&self) -> HeapConfig {
        self.config
    }

    /// Allocate `bytes` bytes of type `ty` aligned to `align` (0 and 1
    /// both mean unaligned; otherwise a power of two). Zero-byte requests
    /// are served as one-byte requests.
    pub fn allocate(
        &self,
        ty: MemoryTypeId,
        bytes: u64,
        align: u64,
    ) -> Result<HeapHandle, AllocError> {
        let align = align.max(1);
        debug_assert!(
            align.is_power_of_two(),
            "alignment {align} is not a power of two"
        );
        let bytes = bytes.max(1);
        let mut core = self.core.lock();
        let core = &mut *core;
        if align <= self.config.region_bytes {
            if let Some(bin) = select_size_bin_aligned(bytes, align) {
                return match bin {
                    SizeBin::Tiny(bin) => self.alloc_tiny(core, ty, bin),
                    SizeBin::Small(bin) => self.alloc_small(core, ty, bin),
                };
            }
            let regions = bytes.div_ceil(self.config.region_bytes);
            if regions <= MAX_LARGE_REGIONS {
                return self.alloc_large(core, ty, regions);
            }
        }
        self.alloc_dedicated(core, ty, bytes, align)
    }

    /// Release an allocation. The handle must come from
    /// [`allocate`](Self::allocate) on this heap and must not have been
    /// released already.
    pub fn deallocate(&self, handle: HeapHandle) {
        let mut core = self.core.lock();
        let core = &mut *core;
        match handle.kind() {
            PageKind::Tiny => self.free_tiny(core, handle),
            PageKind::Small => self.free_small(core, handle),
            PageKind::Large => self.free_large(core, handle.memory_type(), handle.slot()),
            PageKind::Huge => self.free_dedicated(core, handle),
        }
    }

    /// Bytes actually reserved for an allocation; at least the byte count
    /// it was requested with.
    pub fn allocation_size(&self, handle: HeapHandle) -> u64 {
        match handle.kind() {
            PageKind::Tiny => tiny_bin_bytes(handle.payload_bin()),
            PageKind::Small => small_bin_bytes(handle.payload_bin()),
            PageKind::Large => u64::from(handle.payload()) * self.config.region_bytes,
            PageKind::Huge => {
                let core = self.core.lock();
                core.arena.huge(handle.slot()).regions * self.config.region_bytes
            }
        }
    }

    /// Bytes [`allocate`](Self::allocate) would reserve for a request,
    /// without performing it. Requests no single block can span saturate
    /// to `u64::MAX`; `allocate` refuses them.
    pub fn adjusted_size(&self, bytes: u64, align: u64) -> u64 {
        let align = align.max(1);
        debug_assert!(
            align.is_power_of_two(),
            "alignment {align} is not a power of two"
        );
        let bytes = bytes.max(1);
        if align <= self.config.region_bytes {
            if let Some(bin) = select_size_bin_aligned(bytes, align) {
                return match bin {
                    SizeBin::Tiny(bin) => tiny_bin_bytes(bin),
                    SizeBin::Small(bin) => small_bin_bytes(bin),
                };
            }
        }
        bytes
            .div_ceil(self.config.region_bytes)
            .saturating_mul(self.config.region_bytes)
    }

    /// CPU address of an allocation, or `None` when its memory type is
    /// not CPU-visible. Each successful call must be paired with an
    /// [`unmap`](Self::unmap); the block stays mapped while any count is
    /// outstanding.
    pub fn map(&self, handle: HeapHandle) -> Option<NonNull<u8>> {
        let mut core = self.core.lock();
        let core = &mut *core;
        let ty = handle.memory_type();
        let (huge_ix, offset) = self.resolve(core, handle);
        let huge = core.arena.huge_mut(huge_ix);
        if huge.mapped.is_none() {
            let base = self.provider.map_block(ty, huge.block)?;
            huge.mapped = NonZeroUsize::new(base.as_ptr() as usize);
        }
        let base = huge.mapped?;
        huge.map_count += 1;
        NonNull::new((base.get() + offset as usize) as *mut u8)
    }

    /// Undo one successful [`map`](Self::map).
    pub fn unmap(&self, handle: HeapHandle) {
        let mut core = self.core.lock();
        let core = &mut *core;
        let ty = handle.memory_type();
        let (huge_ix, _) = self.resolve(core, handle);
        let huge = core.arena.huge_mut(huge_ix);
        debug_assert!(huge.map_count > 0, "unmap without an outstanding map");
        huge.map_count = huge.map_count.saturating_sub(1);
        if huge.map_count == 0
            && !self.config.persistent_map
            && let Some(ptr) = huge.mapped.take().and_then(mapped_ptr)
        {
            self.provider.unmap_block(ty, huge.block, ptr);
        }
    }

    /// Owning huge page and byte offset within its block. At most three
    /// records are visited; each visit checks the record kind and, for
    /// bitmap tiers, that the named block is actually allocated.
    fn resolve(&self, core: &HeapCore, handle: HeapHandle) -> (SlotIx, u64) {
        match handle.kind() {
            PageKind::Huge => (handle.slot(), 0),
            PageKind::Large => {
                let page = core.arena.large(handle.slot());
                debug_assert!(!page.free, "handle names a free large page");
                (
                    page.parent,
                    u64::from(page.first_region) * self.config.region_bytes,
                )
            }
            PageKind::Small => self.resolve_small(
                core,
                handle.slot(),
                handle.payload_bin(),
                handle.payload_block(),
            ),
            PageKind::Tiny => {
                let page = core.arena.tiny(handle.slot());
                let block = handle.payload_block();
                debug_assert_eq!(usize::from(page.bin), handle.payload_bin(), "bin mismatch");
                debug_assert_eq!(
                    page.free_bits & 1 << block,
                    0,
                    "handle names a free tiny block"
                );
                let backing = page.backing;
                let (parent, base) = self.resolve_small(
                    core,
                    backing.slot(),
                    backing.payload_bin(),
                    backing.payload_block(),
                );
                (
                    parent,
                    base + u64::from(block) * tiny_bin_bytes(usize::from(page.bin)),
                )
            }
        }
    }

    fn resolve_small(&self, core: &HeapCore, ix: SlotIx, bin: usize, block: u32) -> (SlotIx, u64) {
        let page = core.arena.small(ix);
        debug_assert_eq!(usize::from(page.bin), bin, "bin mismatch");
        debug_assert_eq!(
            page.free_bits & 1 << block,
            0,
            "handle names a free small block"
        );
        let offset = u64::from(page.first_region) * self.config.region_bytes
            + u64::from(block) * small_bin_bytes(bin);
        (page.parent, offset)
    }
}

impl<P: BlockProvider> Drop for GpuHeap<P> {
    /// Live allocations at drop are a caller leak; they are logged, then
    /// every remaining block is released so the provider does not leak
    /// with them.
    fn drop(&mut self) {
        let core = self.core.get_mut();
        let live = core.arena.live_records();
        if live > 0 {
            log::warn!("heap dropped with {live} live page records; releasing provider blocks");
        }
        let HeapCore { arena, types } = core;
        for ty in MemoryTypeId::all() {
            let lists = &mut types[ty.index()];
            while let Some(huge_ix) = lists.huge_pages.pop_front(arena) {
                let huge = arena.huge(huge_ix);
                let block = huge.block;
                let bytes = huge.regions * self.config.region_bytes;
                if let Some(ptr) = huge.mapped.and_then(mapped_ptr) {
                    self.provider.unmap_block(ty, block, ptr);
                }
                self.provider.deallocate_block(ty, block, bytes);
            }
        }
    }
}

/// Rebuild the pointer a map address was stored from.
fn mapped_ptr(base: NonZeroUsize) -> Option<NonNull<u8>> {
    NonNull::new(base.get() as *mut u8)
}

/// Single logging site for the arena-capacity failure.
fn note_arena_exhausted(arena: &PageArena) {
    log::error!(
        "page record arena exhausted at {} slots; allocation failed",
        arena.capacity()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::error::{AllocError, ConfigError};
    use crate::provider::BlockId;

    struct TestProvider {
        next_id: AtomicU64,
        live: Mutex<BTreeMap<u64, u64>>,
        last_align: AtomicU64,
        maps: AtomicU64,
        unmaps: AtomicU64,
        cpu_visible: bool,
    }

    impl TestProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                next_id: AtomicU64::new(0),
                live: Mutex::new(BTreeMap::new()),
                last_align: AtomicU64::new(0),
                maps: AtomicU64::new(0),
                unmaps: AtomicU64::new(0),
                cpu_visible: true,
            })
        }

        fn device_only() -> Arc<Self> {
            let mut provider = Self::new();
            Arc::get_mut(&mut provider)
                .expect("fresh arc")
                .cpu_visible = false;
            provider
        }

        fn live_blocks(&self) -> usize {
            self.live.lock().len()
        }
    }

    impl BlockProvider for Arc<TestProvider> {
        fn allocate_block(&self, _ty: MemoryTypeId, bytes: u64, align: u64) -> Option<BlockId> {
            assert!(align.is_power_of_two(), "provider asked for align {align}");
            self.last_align.store(align, Ordering::Relaxed);
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            self.live.lock().insert(id, bytes);
            BlockId::new(id)
        }

        fn deallocate_block(&self, _ty: MemoryTypeId, block: BlockId, bytes: u64) {
            let recorded = self.live.lock().remove(&block.get());
            assert_eq!(recorded, Some(bytes), "release must match the allocation");
        }

        fn map_block(&self, _ty: MemoryTypeId, block: BlockId) -> Option<NonNull<u8>> {
            if !self.cpu_visible {
                return None;
            }
            self.maps.fetch_add(1, Ordering::Relaxed);
            // Fake 4 GiB aligned base; never dereferenced.
            NonNull::new((block.get() << 32) as *mut u8)
        }

        fn unmap_block(&self, _ty: MemoryTypeId, _block: BlockId, _base: NonNull<u8>) {
            self.unmaps.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn ty(index: u8) -> MemoryTypeId {
        MemoryTypeId::new(index).expect("memory type in range")
    }

    fn heap() -> GpuHeap<Arc<TestProvider>> {
        GpuHeap::new(HeapConfig::default(), TestProvider::new()).expect("default config")
    }

    #[test]
    fn construction_rejects_invalid_config() {
        let config = HeapConfig {
            region_bytes: 3000,
            ..HeapConfig::default()
        };
        let result = GpuHeap::new(config, TestProvider::new());
        assert!(matches!(result, Err(ConfigError::RegionNotPow2(3000))));
    }

    #[test]
    fn heap_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GpuHeap<Arc<TestProvider>>>();
    }

    #[test]
    fn adjusted_size_covers_every_tier() {
        let heap = heap();
        assert_eq!(heap.adjusted_size(0, 0), 64, "zero bytes get the min bin");
        assert_eq!(heap.adjusted_size(64, 1), 64);
        assert_eq!(heap.adjusted_size(65, 0), 128);
        assert_eq!(heap.adjusted_size(600, 512), 1024, "alignment skips bins");
        assert_eq!(heap.adjusted_size(8192, 1), 8192);
        assert_eq!(heap.adjusted_size(8193, 1), 64 * 1024, "one region");
        assert_eq!(heap.adjusted_size(200_000, 4), 4 * 64 * 1024);
    }

    #[test]
    fn allocate_reports_at_least_the_requested_size() {
        let heap = heap();
        for (bytes, align) in [(1, 1), (64, 16), (700, 1), (8192, 8192), (100_000, 4)] {
            let handle = heap.allocate(ty(0), bytes, align).expect("allocation");
            assert!(
                heap.allocation_size(handle) >= bytes,
                "{bytes} byte request got {} bytes",
                heap.allocation_size(handle)
            );
            assert_eq!(heap.allocation_size(handle), heap.adjusted_size(bytes, align));
            assert_eq!(handle.memory_type(), ty(0));
            heap.deallocate(handle);
        }
    }

    #[test]
    fn deallocate_returns_blocks_to_the_provider() {
        let provider = TestProvider::new();
        let heap = GpuHeap::new(HeapConfig::default(), provider.clone()).expect("config");
        let tiny = heap.allocate(ty(2), 64, 1).expect("tiny");
        let large = heap.allocate(ty(2), 150_000, 1).expect("large");
        assert_eq!(tiny.kind(), PageKind::Tiny);
        assert_eq!(large.kind(), PageKind::Large);
        assert!(provider.live_blocks() > 0);
        heap.deallocate(tiny);
        heap.deallocate(large);
        assert_eq!(
            provider.live_blocks(),
            0,
            "all provider blocks must be returned"
        );
    }

    #[test]
    fn oversized_alignment_takes_a_dedicated_block() {
        let provider = TestProvider::new();
        let heap = GpuHeap::new(HeapConfig::default(), provider.clone()).expect("config");
        let handle = heap.allocate(ty(0), 100, 1 << 20).expect("dedicated");
        assert_eq!(handle.kind(), PageKind::Huge);
        assert_eq!(heap.allocation_size(handle), 64 * 1024, "one region");
        assert_eq!(
            provider.last_align.load(Ordering::Relaxed),
            1 << 20,
            "alignment must reach the provider"
        );
        let base = heap.map(handle).expect("mappable type");
        assert_eq!(base.as_ptr() as usize % (1 << 20), 0);
        heap.unmap(handle);
        heap.deallocate(handle);
        assert_eq!(provider.live_blocks(), 0);
    }

    #[test]
    fn map_shares_one_block_mapping() {
        let provider = TestProvider::new();
        let heap = GpuHeap::new(HeapConfig::default(), provider.clone()).expect("config");
        let first = heap.allocate(ty(0), 64, 64).expect("first");
        let second = heap.allocate(ty(0), 64, 64).expect("second");
        let a = heap.map(first).expect("map first");
        let b = heap.map(second).expect("map second");
        assert_eq!(
            b.as_ptr() as usize - a.as_ptr() as usize,
            64,
            "neighbors in one tiny page are one bin size apart"
        );
        assert_eq!(a.as_ptr() as usize % 64, 0, "mapped address alignment");
        assert_eq!(provider.maps.load(Ordering::Relaxed), 1, "one block map");
        heap.unmap(first);
        assert_eq!(provider.unmaps.load(Ordering::Relaxed), 0, "map still held");
        heap.unmap(second);
        assert_eq!(provider.unmaps.load(Ordering::Relaxed), 1);
        heap.deallocate(first);
        heap.deallocate(second);
    }

    #[test]
    fn device_only_type_does_not_map() {
        let provider = TestProvider::device_only();
        let heap = GpuHeap::new(HeapConfig::default(), provider.clone()).expect("config");
        let handle = heap.allocate(ty(1), 4096, 1).expect("allocation");
        assert_eq!(heap.map(handle), None, "device-local memory has no address");
        assert_eq!(provider.maps.load(Ordering::Relaxed), 0);
        heap.deallocate(handle);
    }

    #[test]
    fn drop_releases_leaked_blocks() {
        let provider = TestProvider::new();
        let heap = GpuHeap::new(HeapConfig::default(), provider.clone()).expect("config");
        let _leaked_tiny = heap.allocate(ty(0), 64, 1).expect("tiny");
        let _leaked_dedicated = heap.allocate(ty(3), 30 * 1024 * 1024, 1).expect("huge");
        assert_eq!(provider.live_blocks(), 2);
        drop(heap);
        assert_eq!(
            provider.live_blocks(),
            0,
            "drop must hand every block back"
        );
    }

    #[test]
    fn requests_too_large_for_any_block_fail_cleanly() {
        let provider = TestProvider::new();
        let heap = GpuHeap::new(HeapConfig::default(), provider.clone()).expect("config");
        for bytes in [u64::MAX, u64::MAX - 1000] {
            assert_eq!(
                heap.allocate(ty(0), bytes, 1),
                Err(AllocError::ProviderExhausted),
                "no block can span {bytes} bytes"
            );
            assert_eq!(
                heap.allocate(ty(0), bytes, 1 << 21),
                Err(AllocError::ProviderExhausted),
                "the over-aligned path takes the same guard"
            );
        }
        assert_eq!(provider.live_blocks(), 0, "the provider is never consulted");
        assert_eq!(heap.adjusted_size(u64::MAX, 1), u64::MAX, "the quote saturates");
        let handle = heap.allocate(ty(0), 64, 1).expect("the heap stays usable");
        heap.deallocate(handle);
        assert_eq!(provider.live_blocks(), 0);
    }
}
