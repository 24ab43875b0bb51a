//! Interval algebra over guest addresses.
//!
//! - [`AddressRange`]: an inclusive `[start, end]` interval with overlap, touch, distance and
//!   intersection queries plus page-alignment helpers. `start > end` marks an invalid (empty)
//!   range.
//! - [`AddressRangeVector`]: an unsorted set of ranges that never overlap or touch, maintained by
//!   [`AddressRangeVector::merge`] and [`AddressRangeVector::exclude`]. Invalid slots are reused.
//! - [`RangedMap`]: a map keyed by 32-bit address, sharded into fixed-size blocks so lookups and
//!   range-scoped iteration only touch the blocks involved.
//!
//! Everything here is plain data; nothing performs I/O or locking.

#![forbid(unsafe_code)]

mod address;
mod range;
mod ranged_map;
mod vector;

pub use address::Address;
pub use range::{
    is_page_aligned, next_page, page_end, page_start, AddressRange, AddressRange16,
    AddressRange32, AddressRange64,
};
pub use ranged_map::{RangeCursor, RangedMap};
pub use vector::{AddressRangeVector, AddressRangeVector32};

#[cfg(all(test, not(target_arch = "wasm32")))]
mod proptests;
