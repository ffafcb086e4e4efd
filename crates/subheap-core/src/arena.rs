//! Page-record arena.
//!
//! Every page the heap tracks lives in one bounded arena as a tagged
//! record addressed by slot index; lists thread records together by index,
//! never by pointer. Storage for the full capacity is reserved at
//! construction; slots activate on demand and recycled slots are reused
//! LIFO. Slot 0 is seeded as permanently vacant so that packed handles
//! are never zero.

use core::num::{NonZeroU32, NonZeroUsize};

use crate::handle::HeapHandle;
use crate::provider::BlockId;

/// Index of an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotIx(NonZeroU32);

impl SlotIx {
    pub(crate) fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub(crate) fn from_nonzero(raw: NonZeroU32) -> Self {
        Self(raw)
    }

    pub(crate) fn get(self) -> u32 {
        self.0.get()
    }

    pub(crate) fn as_nonzero(self) -> NonZeroU32 {
        self.0
    }

    fn index(self) -> usize {
        self.0.get() as usize
    }
}

/// Link pair threading one record into one list family.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Links {
    pub(crate) prev: Option<SlotIx>,
    pub(crate) next: Option<SlotIx>,
}

/// One native provider block.
#[derive(Debug, Clone)]
pub(crate) struct HugePage {
    pub(crate) block: BlockId,
    /// Whole-block size in regions.
    pub(crate) regions: u64,
    /// CPU base address while the block is mapped.
    pub(crate) mapped: Option<NonZeroUsize>,
    /// Outstanding `map` calls against allocations in this block.
    pub(crate) map_count: u32,
    /// Head of the address-ordered child chain. `None` for a dedicated
    /// block, which is itself the allocation.
    pub(crate) first_page: Option<SlotIx>,
    /// Per-type huge-page list.
    pub(crate) links: Links,
}

/// A run of whole regions inside a huge page.
#[derive(Debug, Clone)]
pub(crate) struct LargePage {
    pub(crate) parent: SlotIx,
    pub(crate) first_region: u32,
    pub(crate) regions: u32,
    pub(crate) free: bool,
    /// Free-list position while `free`.
    pub(crate) bin_links: Links,
    /// Address-order neighbors within the parent.
    pub(crate) phys_links: Links,
}

/// A busy large page reinterpreted as a carrier of same-size sub-blocks.
#[derive(Debug, Clone)]
pub(crate) struct SmallPage {
    pub(crate) parent: SlotIx,
    pub(crate) first_region: u32,
    pub(crate) regions: u32,
    pub(crate) bin: u8,
    /// Active sub-blocks; bits at this index and above stay zero.
    pub(crate) blocks: u8,
    /// Set bits are free sub-blocks.
    pub(crate) free_bits: u32,
    /// Allocated sub-blocks that back tiny pages.
    pub(crate) host_bits: u32,
    /// Avail/full list position.
    pub(crate) list_links: Links,
    pub(crate) phys_links: Links,
}

/// A small block reinterpreted as a carrier of tiny sub-blocks.
#[derive(Debug, Clone)]
pub(crate) struct TinyPage {
    /// The small-tier allocation this page subdivides.
    pub(crate) backing: HeapHandle,
    pub(crate) bin: u8,
    pub(crate) blocks: u8,
    pub(crate) free_bits: u64,
    /// Avail/full list position.
    pub(crate) list_links: Links,
}

#[derive(Debug, Clone)]
pub(crate) enum PageRecord {
    Vacant { next: Option<SlotIx> },
    Huge(HugePage),
    Large(LargePage),
    Small(SmallPage),
    Tiny(TinyPage),
}

fn kind_name(record: &PageRecord) -> &'static str {
    match record {
        PageRecord::Vacant { .. } => "vacant",
        PageRecord::Huge(_) => "huge",
        PageRecord::Large(_) => "large",
        PageRecord::Small(_) => "small",
        PageRecord::Tiny(_) => "tiny",
    }
}

pub(crate) struct PageArena {
    slots: Vec<PageRecord>,
    free_head: Option<SlotIx>,
    capacity: u32,
    live: u32,
}

impl PageArena {
    pub(crate) fn new(capacity: u32) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        // Slot 0 never enters the free list.
        slots.push(PageRecord::Vacant { next: None });
        Self {
            slots,
            free_head: None,
            capacity,
            live: 0,
        }
    }

    /// Place `record` in a slot. `None` when the arena is at capacity.
    pub(crate) fn allocate(&mut self, record: PageRecord) -> Option<SlotIx> {
        if let Some(ix) = self.free_head {
            let slot = &mut self.slots[ix.index()];
            let PageRecord::Vacant { next } = *slot else {
                unreachable!("free list points at a live record in slot {}", ix.get())
            };
            self.free_head = next;
            *slot = record;
            self.live += 1;
            return Some(ix);
        }
        if self.slots.len() < self.capacity as usize {
            // len >= 1: slot 0 is pre-seeded.
            let ix = SlotIx::new(self.slots.len() as u32)?;
            self.slots.push(record);
            self.live += 1;
            return Some(ix);
        }
        None
    }

    /// Return a slot to the free list.
    pub(crate) fn recycle(&mut self, ix: SlotIx) {
        debug_assert!(
            !matches!(self.slots[ix.index()], PageRecord::Vacant { .. }),
            "slot {} recycled twice",
            ix.get()
        );
        self.slots[ix.index()] = PageRecord::Vacant {
            next: self.free_head,
        };
        self.free_head = Some(ix);
        self.live -= 1;
    }

    pub(crate) fn get(&self, ix: SlotIx) -> &PageRecord {
        &self.slots[ix.index()]
    }

    pub(crate) fn get_mut(&mut self, ix: SlotIx) -> &mut PageRecord {
        &mut self.slots[ix.index()]
    }

    /// Live records; the reserved slot does not count.
    pub(crate) fn live_records(&self) -> u32 {
        self.live
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    pub(crate) fn huge(&self, ix: SlotIx) -> &HugePage {
        match self.get(ix) {
            PageRecord::Huge(page) => page,
            other => unreachable!("slot {} holds a {} record, expected huge", ix.get(), kind_name(other)),
        }
    }

    pub(crate) fn huge_mut(&mut self, ix: SlotIx) -> &mut HugePage {
        match self.get_mut(ix) {
            PageRecord::Huge(page) => page,
            other => unreachable!("slot {} holds a {} record, expected huge", ix.get(), kind_name(other)),
        }
    }

    pub(crate) fn large(&self, ix: SlotIx) -> &LargePage {
        match self.get(ix) {
            PageRecord::Large(page) => page,
            other => unreachable!("slot {} holds a {} record, expected large", ix.get(), kind_name(other)),
        }
    }

    pub(crate) fn large_mut(&mut self, ix: SlotIx) -> &mut LargePage {
        match self.get_mut(ix) {
            PageRecord::Large(page) => page,
            other => unreachable!("slot {} holds a {} record, expected large", ix.get(), kind_name(other)),
        }
    }

    pub(crate) fn small(&self, ix: SlotIx) -> &SmallPage {
        match self.get(ix) {
            PageRecord::Small(page) => page,
            other => unreachable!("slot {} holds a {} record, expected small", ix.get(), kind_name(other)),
        }
    }

    pub(crate) fn small_mut(&mut self, ix: SlotIx) -> &mut SmallPage {
        match self.get_mut(ix) {
            PageRecord::Small(page) => page,
            other => unreachable!("slot {} holds a {} record, expected small", ix.get(), kind_name(other)),
        }
    }

    pub(crate) fn tiny(&self, ix: SlotIx) -> &TinyPage {
        match self.get(ix) {
            PageRecord::Tiny(page) => page,
            other => unreachable!("slot {} holds a {} record, expected tiny", ix.get(), kind_name(other)),
        }
    }

    pub(crate) fn tiny_mut(&mut self, ix: SlotIx) -> &mut TinyPage {
        match self.get_mut(ix) {
            PageRecord::Tiny(page) => page,
            other => unreachable!("slot {} holds a {} record, expected tiny", ix.get(), kind_name(other)),
        }
    }
}
