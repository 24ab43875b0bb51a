use std::collections::BTreeSet;

use aero_addr_range::{AddressRange32, AddressRangeVector32, RangedMap};

const BLOCK: u32 = 0x1_0000;

#[test]
fn cursor_visits_each_entry_in_range_once_across_three_shards() {
    let mut map: RangedMap<&'static str, BLOCK> = RangedMap::new();
    let inside = [0x1_0000, 0x1_8000, 0x2_0004, 0x2_FFFF, 0x3_0000, 0x3_0FFF];
    let outside = [0x0_FFFF, 0x3_1000, 0x4_0000];
    for key in inside {
        map.insert(key, "in");
    }
    for key in outside {
        map.insert(key, "out");
    }

    let range = AddressRange32::start_end(0x1_0000, 0x3_0FFF);
    let mut seen = Vec::new();
    let mut cursor = map.cursor(range);
    while let Some(key) = cursor.key() {
        assert_eq!(*cursor.value(), "in");
        seen.push(key);
        // Erase every other entry; the cursor must stay usable either way.
        if seen.len() % 2 == 0 {
            assert_eq!(cursor.erase(), Some("in"));
        } else {
            cursor.advance();
        }
    }

    let unique: BTreeSet<u32> = seen.iter().copied().collect();
    assert_eq!(unique.len(), seen.len());
    assert_eq!(unique, inside.into_iter().collect());
    assert_eq!(map.len(), inside.len() / 2 + outside.len());
    assert_eq!(map.range(range).count(), inside.len() / 2);
}

#[test]
fn erasing_whole_range_empties_it_and_keeps_neighbours() {
    let mut map: RangedMap<u64, BLOCK> = RangedMap::new();
    for block in 0..8u32 {
        map.insert(block * BLOCK, u64::from(block));
        map.insert(block * BLOCK + 0x10, u64::from(block));
    }

    let range = AddressRange32::start_end(2 * BLOCK, 5 * BLOCK - 1);
    let mut cursor = map.cursor(range);
    let mut erased = 0;
    while !cursor.is_end() {
        cursor.erase();
        erased += 1;
    }

    assert_eq!(erased, 6);
    assert_eq!(map.range(range).count(), 0);
    assert_eq!(map.len(), 10);
    assert!(map.contains_key(BLOCK + 0x10));
    assert!(map.contains_key(5 * BLOCK));
}

#[test]
fn dirty_tracking_by_block() {
    // Mark written blocks in a vector and look up per-block state for exactly those blocks.
    let mut dirty = AddressRangeVector32::new();
    let mut state: RangedMap<u32, BLOCK> = RangedMap::new();

    for write in [
        AddressRange32::start_length(0x1_0100, 0x100),
        AddressRange32::start_length(0x1_0200, 0x2_0000),
    ] {
        dirty.merge(&write);
        let mut addr = u64::from(write.start) & !u64::from(BLOCK - 1);
        while addr <= u64::from(write.end) {
            *state.get_or_default(addr as u32) += 1;
            addr += u64::from(BLOCK);
        }
    }

    assert_eq!(dirty.valid_count(), 1);
    assert_eq!(dirty.get_min_max(), AddressRange32::start_end(0x1_0100, 0x3_01FF));
    let counts: Vec<(u32, u32)> = state
        .range(dirty.get_min_max().to_page_range())
        .map(|(k, v)| (k, *v))
        .collect();
    assert_eq!(counts, vec![(0x1_0000, 2), (0x2_0000, 1), (0x3_0000, 1)]);
}
