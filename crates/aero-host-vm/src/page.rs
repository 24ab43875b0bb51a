use std::sync::OnceLock;

use crate::sys;

/// Granularity of every address handed out by the mapping primitives.
///
/// Windows cannot place views at a finer granularity than 64KiB, so all platforms use it to keep
/// guest-visible layouts identical.
pub const MAPPING_ALIGNMENT: usize = 0x10000;

/// Host page size, queried from the OS once and cached.
///
/// Always a power of two.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = sys::query_page_size();
        assert!(size.is_power_of_two(), "host page size {size:#x} is not a power of two");
        size
    })
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a power of two. Saturates to the highest aligned value instead of
/// overflowing.
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());

    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v & !add,
        None => usize::MAX & !add,
    }
}

/// Round `value` down to the nearest multiple of `alignment` (a power of two).
pub fn align_down(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}
