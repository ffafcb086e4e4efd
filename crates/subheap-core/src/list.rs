//! Doubly-linked lists of arena slots.
//!
//! A [`SlotList`] owns only a head index; the prev/next pair lives inside
//! the member records. Which pair is used is picked by the [`LinkSite`]
//! type parameter, so one record can sit in a bin list and in its parent's
//! physical chain at the same time without the lists interfering. The
//! roots live outside the arena and never alias a slot.

use core::marker::PhantomData;

use crate::arena::{Links, PageArena, PageRecord, SlotIx};

/// Where a record keeps the link pair for one list family.
pub(crate) trait LinkSite {
    fn links(record: &PageRecord) -> &Links;
    fn links_mut(record: &mut PageRecord) -> &mut Links;
}

/// Bin membership: large free lists, small/tiny avail and full lists, the
/// per-type huge-page list. A record is in at most one such list.
pub(crate) struct BinLink;

impl LinkSite for BinLink {
    fn links(record: &PageRecord) -> &Links {
        match record {
            PageRecord::Huge(page) => &page.links,
            PageRecord::Large(page) => &page.bin_links,
            PageRecord::Small(page) => &page.list_links,
            PageRecord::Tiny(page) => &page.list_links,
            PageRecord::Vacant { .. } => unreachable!("vacant slot in a bin list"),
        }
    }

    fn links_mut(record: &mut PageRecord) -> &mut Links {
        match record {
            PageRecord::Huge(page) => &mut page.links,
            PageRecord::Large(page) => &mut page.bin_links,
            PageRecord::Small(page) => &mut page.list_links,
            PageRecord::Tiny(page) => &mut page.list_links,
            PageRecord::Vacant { .. } => unreachable!("vacant slot in a bin list"),
        }
    }
}

/// Address-order neighbors within one huge page. Large and small pages
/// only; the chain root is the parent's `first_page`.
pub(crate) struct PhysLink;

impl LinkSite for PhysLink {
    fn links(record: &PageRecord) -> &Links {
        match record {
            PageRecord::Large(page) => &page.phys_links,
            PageRecord::Small(page) => &page.phys_links,
            _ => unreachable!("record kind cannot join a physical chain"),
        }
    }

    fn links_mut(record: &mut PageRecord) -> &mut Links {
        match record {
            PageRecord::Large(page) => &mut page.phys_links,
            PageRecord::Small(page) => &mut page.phys_links,
            _ => unreachable!("record kind cannot join a physical chain"),
        }
    }
}

/// List root.
#[derive(Debug)]
pub(crate) struct SlotList<S: LinkSite> {
    head: Option<SlotIx>,
    _site: PhantomData<S>,
}

impl<S: LinkSite> SlotList<S> {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            _site: PhantomData,
        }
    }

    pub(crate) fn head(&self) -> Option<SlotIx> {
        self.head
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn push_front(&mut self, arena: &mut PageArena, ix: SlotIx) {
        {
            let links = S::links(arena.get(ix));
            debug_assert!(
                links.prev.is_none() && links.next.is_none(),
                "slot {} is already linked",
                ix.get()
            );
        }
        if let Some(head) = self.head {
            S::links_mut(arena.get_mut(head)).prev = Some(ix);
        }
        let links = S::links_mut(arena.get_mut(ix));
        links.prev = None;
        links.next = self.head;
        self.head = Some(ix);
    }

    pub(crate) fn pop_front(&mut self, arena: &mut PageArena) -> Option<SlotIx> {
        let head = self.head?;
        self.remove(arena, head);
        Some(head)
    }

    /// Unlink `ix` from anywhere in the list.
    pub(crate) fn remove(&mut self, arena: &mut PageArena, ix: SlotIx) {
        let Links { prev, next } = *S::links(arena.get(ix));
        match prev {
            Some(prev_ix) => S::links_mut(arena.get_mut(prev_ix)).next = next,
            None => {
                debug_assert_eq!(self.head, Some(ix), "slot {} is not in this list", ix.get());
                self.head = next;
            }
        }
        if let Some(next_ix) = next {
            S::links_mut(arena.get_mut(next_ix)).prev = prev;
        }
        *S::links_mut(arena.get_mut(ix)) = Links::default();
    }

    pub(crate) fn iter<'a>(&self, arena: &'a PageArena) -> SlotIter<'a, S> {
        SlotIter {
            arena,
            cursor: self.head,
            _site: PhantomData,
        }
    }
}

pub(crate) struct SlotIter<'a, S: LinkSite> {
    arena: &'a PageArena,
    cursor: Option<SlotIx>,
    _site: PhantomData<S>,
}

impl<S: LinkSite> Iterator for SlotIter<'_, S> {
    type Item = SlotIx;

    fn next(&mut self) -> Option<SlotIx> {
        let current = self.cursor?;
        self.cursor = S::links(self.arena.get(current)).next;
        Some(current)
    }
}

/// Insert `new` immediately after `at` in their shared physical chain.
pub(crate) fn phys_insert_after(arena: &mut PageArena, at: SlotIx, new: SlotIx) {
    let next = PhysLink::links(arena.get(at)).next;
    {
        let links = PhysLink::links_mut(arena.get_mut(new));
        links.prev = Some(at);
        links.next = next;
    }
    PhysLink::links_mut(arena.get_mut(at)).next = Some(new);
    if let Some(next_ix) = next {
        PhysLink::links_mut(arena.get_mut(next_ix)).prev = Some(new);
    }
}

/// Unlink `ix` from the physical chain of the huge page `parent`.
pub(crate) fn phys_unlink(arena: &mut PageArena, parent: SlotIx, ix: SlotIx) {
    let Links { prev, next } = *PhysLink::links(arena.get(ix));
    match prev {
        Some(prev_ix) => PhysLink::links_mut(arena.get_mut(prev_ix)).next = next,
        None => {
            let huge = arena.huge_mut(parent);
            debug_assert_eq!(huge.first_page, Some(ix), "slot {} is not the chain head", ix.get());
            huge.first_page = next;
        }
    }
    if let Some(next_ix) = next {
        PhysLink::links_mut(arena.get_mut(next_ix)).prev = prev;
    }
    *PhysLink::links_mut(arena.get_mut(ix)) = Links::default();
}
