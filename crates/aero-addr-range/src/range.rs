use core::fmt;

use aero_host_vm::page_size;

use crate::address::Address;
use crate::vector::AddressRangeVector;

/// Start of the host page containing `addr`.
pub fn page_start<T: Address>(addr: T) -> T {
    let mask = page_size() as u64 - 1;
    T::from_u64(addr.to_u64() & !mask)
}

/// Start of the page after the one containing `addr`. Wraps at the top of the domain.
pub fn next_page<T: Address>(addr: T) -> T {
    let page = page_size() as u64;
    T::from_u64((addr.to_u64() & !(page - 1)).wrapping_add(page))
}

/// Last byte of the page containing `addr`.
pub fn page_end<T: Address>(addr: T) -> T {
    let mask = page_size() as u64 - 1;
    T::from_u64(addr.to_u64() | mask)
}

pub fn is_page_aligned<T: Address>(value: T) -> bool {
    value.to_u64() & (page_size() as u64 - 1) == 0
}

/// An inclusive address interval `[start, end]`.
///
/// A range is valid iff `start <= end`; the canonical invalid range is `[MAX, 0]`, which is also
/// what [`Default`] returns. Because `end` is inclusive, a valid range is never empty and the
/// whole domain is representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange<T: Address = u32> {
    pub start: T,
    pub end: T,
}

pub type AddressRange16 = AddressRange<u16>;
pub type AddressRange32 = AddressRange<u32>;
pub type AddressRange64 = AddressRange<u64>;

impl<T: Address> Default for AddressRange<T> {
    fn default() -> Self {
        Self::invalid()
    }
}

impl<T: Address> fmt::Display for AddressRange<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}-{:#x}]", self.start, self.end)
    }
}

impl<T: Address> AddressRange<T> {
    pub fn invalid() -> Self {
        Self {
            start: T::MAX,
            end: T::ZERO,
        }
    }

    /// `[start, start + length - 1]`, or the invalid range when `length` is zero.
    pub fn start_length(start: T, length: T) -> Self {
        if length == T::ZERO {
            return Self::invalid();
        }
        Self {
            start,
            end: start.wrapping_add(length.wrapping_sub(T::ONE)),
        }
    }

    pub fn start_end(start: T, end: T) -> Self {
        Self { start, end }
    }

    /// Number of addresses covered. The full domain wraps to zero.
    pub fn length(&self) -> T {
        debug_assert!(self.valid(), "length() of invalid range {self}");
        self.end.wrapping_sub(self.start).wrapping_add(T::ONE)
    }

    pub fn valid(&self) -> bool {
        self.start <= self.end
    }

    pub fn invalidate(&mut self) {
        *self = Self::invalid();
    }

    pub fn set(&mut self, start: T, end: T) {
        self.start = start;
        self.end = end;
    }

    /// The address just before `start` (wrapping).
    pub fn prev_address(&self) -> T {
        self.start.wrapping_sub(T::ONE)
    }

    /// The address just after `end` (wrapping).
    pub fn next_address(&self) -> T {
        self.end.wrapping_add(T::ONE)
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.valid() && other.valid() && self.start <= other.end && other.start <= self.end
    }

    pub fn overlaps_address(&self, addr: T) -> bool {
        self.valid() && self.start <= addr && addr <= self.end
    }

    pub fn overlaps_vector(&self, ranges: &AddressRangeVector<T>) -> bool {
        ranges.overlaps(self)
    }

    /// `self` lies entirely within `other`.
    pub fn inside(&self, other: &Self) -> bool {
        self.valid() && other.valid() && self.start >= other.start && self.end <= other.end
    }

    /// Some single range of `ranges` contains `self`.
    pub fn inside_vector(&self, ranges: &AddressRangeVector<T>) -> bool {
        ranges.contains(self)
    }

    /// Overlapping, or adjacent with no gap in between.
    pub fn touches(&self, other: &Self) -> bool {
        if !self.valid() || !other.valid() {
            return false;
        }
        self.overlaps(other)
            || self.end.checked_add(T::ONE) == Some(other.start)
            || other.end.checked_add(T::ONE) == Some(self.start)
    }

    /// Number of addresses strictly between the two ranges; zero if they touch.
    pub fn distance(&self, other: &Self) -> T {
        if self.touches(other) {
            return T::ZERO;
        }
        if other.start > self.end {
            other.start.wrapping_sub(self.end).wrapping_sub(T::ONE)
        } else {
            debug_assert!(self.start > other.end);
            self.start.wrapping_sub(other.end).wrapping_sub(T::ONE)
        }
    }

    /// Like [`AddressRange::distance`], positive when `other` comes after `self` and negative
    /// when it comes before. Saturates at `i64::MAX` in magnitude.
    pub fn signed_distance(&self, other: &Self) -> i64 {
        let gap = i64::try_from(self.distance(other).to_u64()).unwrap_or(i64::MAX);
        if self.touches(other) || other.start > self.end {
            gap
        } else {
            -gap
        }
    }

    /// Smallest range covering both. An invalid operand contributes nothing.
    pub fn get_min_max(&self, other: &Self) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn set_min_max(&mut self, other: &Self) {
        *self = self.get_min_max(other);
    }

    /// Intersection of both ranges; invalid if either is invalid or they are disjoint.
    pub fn get_intersect(&self, other: &Self) -> Self {
        let res = Self {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        };
        if res.valid() {
            res
        } else {
            Self::invalid()
        }
    }

    pub fn intersect(&mut self, other: &Self) {
        *self = self.get_intersect(other);
    }

    pub fn is_page_range(&self) -> bool {
        self.valid()
            && is_page_aligned(self.start)
            && is_page_aligned(self.end.wrapping_add(T::ONE))
    }

    /// The smallest page range covering `self`.
    pub fn to_page_range(&self) -> Self {
        debug_assert!(self.valid(), "to_page_range() of invalid range {self}");
        Self {
            start: page_start(self.start),
            end: page_end(self.end),
        }
    }

    pub fn page_align(&mut self) {
        *self = self.to_page_range();
        debug_assert!(self.is_page_range());
    }
}
