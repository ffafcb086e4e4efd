//! Size-class math.
//!
//! All sizing follows one quanta ladder: 1, 2, 3, then four quarter steps
//! per doubling (4 5 6 7, 8 10 12 14, 16 20 24 28, ...). The smallest
//! range keeps one step and the second keeps two, which caps the bin count
//! for the smallest requests. The ladder classifies byte sizes as quanta
//! of [`ALLOC_UNIT`] (tiny and small tiers) and large-page sizes as quanta
//! of one region (large tier).
//!
//! Requests select a class by rounding up; free pages are binned by
//! rounding down, so every page found in a selected class fits.

/// Bytes per quantum of the byte-level ladder.
pub(crate) const ALLOC_UNIT: u64 = 64;

/// Bins served by the tiny tier, ladder indices `0..TINY_BIN_COUNT`.
pub(crate) const TINY_BIN_COUNT: usize = 8;
/// Bins served by the small tier, ladder indices continuing the tiny ones.
pub(crate) const SMALL_BIN_COUNT: usize = 16;
const SIZE_BIN_COUNT: usize = TINY_BIN_COUNT + SMALL_BIN_COUNT;

/// Region-count classes of the large tier.
pub(crate) const LARGE_BIN_COUNT: usize = 28;

/// Largest byte size the bitmap tiers serve.
pub(crate) const SMALL_MAX_BYTES: u64 = ladder_value(SIZE_BIN_COUNT - 1) * ALLOC_UNIT;

/// Largest region count the large tier serves; also the exact size of
/// every huge page created as a split source.
pub(crate) const MAX_LARGE_REGIONS: u64 = ladder_value(LARGE_BIN_COUNT - 1);

/// Bitmap width of a small page.
pub(crate) const SMALL_PAGE_SLOTS: u32 = 32;
/// Bitmap width of a tiny page.
pub(crate) const TINY_PAGE_SLOTS: u32 = 64;

/// Value of one ladder step.
pub(crate) const fn ladder_value(index: usize) -> u64 {
    match index {
        0 => 1,
        1 => 2,
        2 => 3,
        i => {
            let i = i - 3;
            (4 + (i & 3) as u64) << (i >> 2)
        }
    }
}

/// Smallest ladder index whose value is at least `quanta`.
pub(crate) const fn ladder_round_up(quanta: u64) -> usize {
    if quanta <= 1 {
        return 0;
    }
    if quanta == 2 {
        return 1;
    }
    if quanta == 3 {
        return 2;
    }
    let range = (quanta.ilog2() - 2) as usize;
    let base = 4u64 << range;
    let step = 1u64 << range;
    let sub = ((quanta - base + step - 1) >> range) as usize;
    3 + 4 * range + sub
}

/// Largest ladder index whose value is at most `quanta`. `quanta >= 1`.
pub(crate) const fn ladder_round_down(quanta: u64) -> usize {
    if quanta <= 1 {
        return 0;
    }
    if quanta == 2 {
        return 1;
    }
    if quanta == 3 {
        return 2;
    }
    let range = (quanta.ilog2() - 2) as usize;
    let base = 4u64 << range;
    let sub = ((quanta - base) >> range) as usize;
    3 + 4 * range + sub
}

/// A byte-size class and the tier that serves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SizeBin {
    Tiny(usize),
    Small(usize),
}

/// Byte size of a tiny bin.
pub(crate) const fn tiny_bin_bytes(bin: usize) -> u64 {
    ladder_value(bin) * ALLOC_UNIT
}

/// Byte size of a small bin.
pub(crate) const fn small_bin_bytes(bin: usize) -> u64 {
    ladder_value(bin + TINY_BIN_COUNT) * ALLOC_UNIT
}

/// Smallest bin holding `bytes` whose size is a multiple of `align`, so a
/// block at any in-page index is aligned. `align` is a power of two;
/// `None` when only the region-granular tiers can serve the request.
pub(crate) fn select_size_bin_aligned(bytes: u64, align: u64) -> Option<SizeBin> {
    if bytes > SMALL_MAX_BYTES {
        return None;
    }
    let quanta = bytes.max(1).div_ceil(ALLOC_UNIT);
    let mut index = ladder_round_up(quanta);
    while index < SIZE_BIN_COUNT {
        if (ladder_value(index) * ALLOC_UNIT) % align == 0 {
            return Some(if index < TINY_BIN_COUNT {
                SizeBin::Tiny(index)
            } else {
                SizeBin::Small(index - TINY_BIN_COUNT)
            });
        }
        index += 1;
    }
    None
}

/// Class a request for `regions` regions selects. `1..=MAX_LARGE_REGIONS`.
pub(crate) fn select_large_bin(regions: u64) -> usize {
    debug_assert!(
        regions >= 1 && regions <= MAX_LARGE_REGIONS,
        "region count {regions} outside the large tier"
    );
    ladder_round_up(regions)
}

/// Class a free page of `regions` regions is kept in.
pub(crate) fn large_bin_for_free(regions: u64) -> usize {
    debug_assert!(
        regions >= 1 && regions <= MAX_LARGE_REGIONS,
        "free page of {regions} regions outside the large tier"
    );
    ladder_round_down(regions)
}

/// Classes to probe for a request in `bin`: the exact class, the 4x
/// class, the 2x class, then every following class in ascending order.
/// Each probe is one list-head check, so the search is bounded by the
/// table length; a miss on all of them falls through to a fresh huge
/// page.
pub(crate) fn large_probe_bins(bin: usize) -> impl Iterator<Item = usize> {
    [bin, bin + 8, bin + 4]
        .into_iter()
        .filter(|candidate| *candidate < LARGE_BIN_COUNT)
        .chain(
            (bin + 1..LARGE_BIN_COUNT)
                .filter(move |candidate| *candidate != bin + 4 && *candidate != bin + 8),
        )
}

/// Geometry of a small page hosting one bin's sub-blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SmallPageShape {
    pub blocks: u32,
    pub regions: u64,
}

/// Block count and page size for a small bin. The region count aims to
/// fill the 32-slot bitmap without leaving more than one block of slack;
/// bins far below `region_bytes / 32` stay at one region and accept the
/// bitmap-bound slack.
pub(crate) fn small_page_shape(bin: usize, region_bytes: u64) -> SmallPageShape {
    let size = small_bin_bytes(bin);
    let regions = ((SMALL_PAGE_SLOTS as u64 * size) / region_bytes).clamp(1, 8);
    let blocks = ((regions * region_bytes) / size).min(SMALL_PAGE_SLOTS as u64) as u32;
    SmallPageShape { blocks, regions }
}

/// Small bin backing a tiny page of `bin`: enough bytes for a full bitmap,
/// capped at the largest small bin.
pub(crate) fn tiny_backing_small_bin(bin: usize) -> usize {
    let want = (TINY_PAGE_SLOTS as u64 * tiny_bin_bytes(bin)).min(SMALL_MAX_BYTES);
    ladder_round_up(want / ALLOC_UNIT) - TINY_BIN_COUNT
}

/// Active blocks in a tiny page of `bin`.
pub(crate) fn tiny_page_blocks(bin: usize) -> u32 {
    let backing = small_bin_bytes(tiny_backing_small_bin(bin));
    (backing / tiny_bin_bytes(bin)).min(TINY_PAGE_SLOTS as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select_size_bin(bytes: u64) -> Option<SizeBin> {
        select_size_bin_aligned(bytes, 1)
    }

    fn large_bin_regions(bin: usize) -> u64 {
        ladder_value(bin)
    }

    #[test]
    fn ladder_is_strictly_monotonic() {
        for index in 1..64 {
            assert!(
                ladder_value(index - 1) < ladder_value(index),
                "ladder must grow at index {index}: {} vs {}",
                ladder_value(index - 1),
                ladder_value(index)
            );
        }
    }

    #[test]
    fn ladder_round_up_is_minimal() {
        for quanta in 1..=4096u64 {
            let index = ladder_round_up(quanta);
            assert!(
                ladder_value(index) >= quanta,
                "bin {index} must hold {quanta} quanta"
            );
            if index > 0 {
                assert!(
                    ladder_value(index - 1) < quanta,
                    "bin {} already holds {quanta} quanta",
                    index - 1
                );
            }
        }
    }

    #[test]
    fn ladder_round_trip_is_identity() {
        for index in 0..64 {
            assert_eq!(ladder_round_up(ladder_value(index)), index);
            assert_eq!(ladder_round_down(ladder_value(index)), index);
        }
    }

    #[test]
    fn round_down_never_exceeds() {
        for quanta in 1..=4096u64 {
            let index = ladder_round_down(quanta);
            assert!(ladder_value(index) <= quanta);
            assert!(ladder_value(index + 1) > quanta);
        }
    }

    #[test]
    fn tier_boundaries_match_the_documented_sizes() {
        assert_eq!(tiny_bin_bytes(TINY_BIN_COUNT - 1), 512);
        assert_eq!(SMALL_MAX_BYTES, 8192);
        assert_eq!(MAX_LARGE_REGIONS, 256);
        assert_eq!(tiny_bin_bytes(0), 64);
        assert_eq!(small_bin_bytes(0), 640);
        assert_eq!(small_bin_bytes(SMALL_BIN_COUNT - 1), 8192);
    }

    #[test]
    fn select_size_bin_routes_across_tiers() {
        assert_eq!(select_size_bin(0), Some(SizeBin::Tiny(0)));
        assert_eq!(select_size_bin(64), Some(SizeBin::Tiny(0)));
        assert_eq!(select_size_bin(65), Some(SizeBin::Tiny(1)));
        assert_eq!(select_size_bin(512), Some(SizeBin::Tiny(7)));
        assert_eq!(select_size_bin(513), Some(SizeBin::Small(0)));
        assert_eq!(select_size_bin(8192), Some(SizeBin::Small(15)));
        assert_eq!(select_size_bin(8193), None);
    }

    #[test]
    fn aligned_selection_bumps_to_a_divisible_bin() {
        // 100 bytes at 256 alignment: 128 and 192 are not multiples of 256.
        assert_eq!(
            select_size_bin_aligned(100, 256),
            Some(SizeBin::Tiny(3)),
            "expected the 256-byte bin"
        );
        // 600 bytes at 512 alignment: 640..896 skipped, 1024 divides.
        assert_eq!(select_size_bin_aligned(600, 512), Some(SizeBin::Small(3)));
        // 8 KiB at 8 KiB alignment stays in the last small bin.
        assert_eq!(select_size_bin_aligned(8192, 8192), Some(SizeBin::Small(15)));
        // 7 KiB at 4 KiB alignment has no divisible bin below 8 KiB.
        assert_eq!(select_size_bin_aligned(7000, 4096), Some(SizeBin::Small(15)));
    }

    #[test]
    fn large_classes_cover_one_to_256_regions() {
        assert_eq!(large_bin_regions(0), 1);
        assert_eq!(large_bin_regions(1), 2);
        assert_eq!(large_bin_regions(2), 3);
        assert_eq!(large_bin_regions(LARGE_BIN_COUNT - 1), 256);
        for regions in 1..=MAX_LARGE_REGIONS {
            let bin = select_large_bin(regions);
            assert!(large_bin_regions(bin) >= regions);
            let free_bin = large_bin_for_free(regions);
            assert!(large_bin_regions(free_bin) <= regions);
        }
    }

    #[test]
    fn probe_order_widens_then_walks() {
        let probes: Vec<usize> = large_probe_bins(5).collect();
        assert_eq!(probes[..3], [5, 13, 9], "widening probes come first");
        let mut sorted = probes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), probes.len(), "no class is probed twice");
        assert_eq!(
            sorted,
            (5..LARGE_BIN_COUNT).collect::<Vec<_>>(),
            "every class that could hold the request is reachable"
        );

        let near_end: Vec<usize> = large_probe_bins(LARGE_BIN_COUNT - 2).collect();
        assert_eq!(near_end, vec![26, 27], "probes past the table are dropped");
    }

    #[test]
    fn small_page_shapes_fill_the_bitmap_when_possible() {
        for region_bytes in [4096u64, 64 * 1024, 128 * 1024] {
            for bin in 0..SMALL_BIN_COUNT {
                let shape = small_page_shape(bin, region_bytes);
                let size = small_bin_bytes(bin);
                assert!(
                    (1..=SMALL_PAGE_SLOTS).contains(&shape.blocks),
                    "bin {bin} at region {region_bytes}: {} blocks",
                    shape.blocks
                );
                assert!((1..=8).contains(&shape.regions));
                assert!(
                    shape.blocks as u64 * size <= shape.regions * region_bytes,
                    "blocks must fit the page"
                );
                // Slack below one block unless the bitmap is the limit.
                if shape.blocks < SMALL_PAGE_SLOTS {
                    assert!(shape.regions * region_bytes - shape.blocks as u64 * size < size);
                }
            }
        }
    }

    #[test]
    fn tiny_backing_keeps_bin_zero_at_full_width() {
        assert_eq!(small_bin_bytes(tiny_backing_small_bin(0)), 4096);
        assert_eq!(tiny_page_blocks(0), 64);
        // The largest tiny bin accepts a partial bitmap.
        assert_eq!(small_bin_bytes(tiny_backing_small_bin(7)), 8192);
        assert_eq!(tiny_page_blocks(7), 16);
        for bin in 0..TINY_BIN_COUNT {
            let blocks = tiny_page_blocks(bin);
            assert!((1..=TINY_PAGE_SLOTS).contains(&blocks));
            let backing = small_bin_bytes(tiny_backing_small_bin(bin));
            assert!(blocks as u64 * tiny_bin_bytes(bin) <= backing);
        }
    }
}
