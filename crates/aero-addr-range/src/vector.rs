use crate::address::Address;
use crate::range::AddressRange;

/// A set of address ranges in which no two valid entries overlap or touch.
///
/// Entries are kept in insertion order, not sorted. Removing a range invalidates its slot instead
/// of shifting the storage; invalid slots are reused by later insertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressRangeVector<T: Address = u32> {
    data: Vec<AddressRange<T>>,
}

pub type AddressRangeVector32 = AddressRangeVector<u32>;

impl<T: Address> AddressRangeVector<T> {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Storage slots, including invalid ones.
    pub fn slot_count(&self) -> usize {
        self.data.len()
    }

    pub fn valid_count(&self) -> usize {
        self.iter().count()
    }

    /// No valid entries.
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Valid entries in storage order.
    pub fn iter(&self) -> impl Iterator<Item = &AddressRange<T>> + '_ {
        self.data.iter().filter(|r| r.valid())
    }

    fn store(&mut self, range: AddressRange<T>) {
        match self.data.iter_mut().find(|r| !r.valid()) {
            Some(slot) => *slot = range,
            None => self.data.push(range),
        }
    }

    /// Add `range` to the set, coalescing it with every entry it touches.
    ///
    /// When several entries touch, the first one in storage order absorbs the others, which are
    /// invalidated.
    pub fn merge(&mut self, range: &AddressRange<T>) {
        if !range.valid() {
            return;
        }

        let mut found: Option<usize> = None;
        for i in 0..self.data.len() {
            if !self.data[i].touches(range) {
                continue;
            }
            match found {
                None => {
                    self.data[i].set_min_max(range);
                    found = Some(i);
                }
                Some(survivor) => {
                    let absorbed = self.data[i];
                    self.data[survivor].set_min_max(&absorbed);
                    self.data[i].invalidate();
                }
            }
        }

        if found.is_none() {
            self.store(*range);
        }
        debug_assert!(self.check_consistency());
    }

    pub fn merge_vector(&mut self, other: &Self) {
        for range in other.iter() {
            self.merge(range);
        }
    }

    /// Remove every address of `exclusion` from the set, truncating or splitting entries.
    pub fn exclude(&mut self, exclusion: &AddressRange<T>) {
        if !exclusion.valid() {
            return;
        }

        // Index-based: a split may push a new slot while we scan.
        let original_len = self.data.len();
        for i in 0..original_len {
            let existing = self.data[i];
            if !existing.overlaps(exclusion) {
                continue;
            }

            let head_excluded = exclusion.overlaps_address(existing.start);
            let tail_excluded = exclusion.overlaps_address(existing.end);

            match (head_excluded, tail_excluded) {
                (true, true) => self.data[i].invalidate(),
                (true, false) => self.data[i].start = exclusion.next_address(),
                (false, true) => self.data[i].end = exclusion.prev_address(),
                (false, false) => {
                    self.data[i].end = exclusion.prev_address();
                    self.store(AddressRange::start_end(
                        exclusion.next_address(),
                        existing.end,
                    ));
                }
            }
        }
        debug_assert!(self.check_consistency());
    }

    pub fn exclude_vector(&mut self, other: &Self) {
        for range in other.iter() {
            self.exclude(range);
        }
    }

    /// No two valid entries touch.
    pub fn check_consistency(&self) -> bool {
        let valid: Vec<_> = self.iter().collect();
        valid
            .iter()
            .enumerate()
            .all(|(i, a)| valid[i + 1..].iter().all(|b| !a.touches(b)))
    }

    pub fn overlaps(&self, range: &AddressRange<T>) -> bool {
        self.iter().any(|r| r.overlaps(range))
    }

    pub fn overlaps_vector(&self, other: &Self) -> bool {
        other.iter().any(|r| self.overlaps(r))
    }

    /// Some single entry fully contains `range`. Coverage by several adjacent entries cannot
    /// happen since entries never touch.
    pub fn contains(&self, range: &AddressRange<T>) -> bool {
        self.iter().any(|r| range.inside(r))
    }

    /// Every valid entry lies inside `range`.
    pub fn inside(&self, range: &AddressRange<T>) -> bool {
        self.iter().all(|r| r.inside(range))
    }

    /// Bounding range of all entries; invalid when the set is empty.
    pub fn get_min_max(&self) -> AddressRange<T> {
        self.iter()
            .fold(AddressRange::invalid(), |acc, r| acc.get_min_max(r))
    }
}

impl<T: Address> FromIterator<AddressRange<T>> for AddressRangeVector<T> {
    fn from_iter<I: IntoIterator<Item = AddressRange<T>>>(iter: I) -> Self {
        let mut vec = Self::new();
        for range in iter {
            vec.merge(&range);
        }
        vec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::AddressRange32;

    fn r(start: u32, end: u32) -> AddressRange32 {
        AddressRange32::start_end(start, end)
    }

    fn sorted(vec: &AddressRangeVector32) -> Vec<AddressRange32> {
        let mut out: Vec<_> = vec.iter().copied().collect();
        out.sort_by_key(|r| r.start);
        out
    }

    #[test]
    fn merge_bridges_two_entries() {
        let mut vec = AddressRangeVector32::new();
        vec.merge(&r(0x1000, 0x1FFF));
        vec.merge(&r(0x3000, 0x3FFF));
        vec.merge(&r(0x2000, 0x2FFF));

        assert_eq!(sorted(&vec), vec![r(0x1000, 0x3FFF)]);
        assert_eq!(vec.valid_count(), 1);
        assert_eq!(vec.slot_count(), 2);
    }

    #[test]
    fn merge_survivor_is_first_touching_slot() {
        let mut vec = AddressRangeVector32::new();
        vec.merge(&r(0x3000, 0x3FFF));
        vec.merge(&r(0x1000, 0x1FFF));
        vec.merge(&r(0x5000, 0x5FFF));
        vec.merge(&r(0x2000, 0x4FFF));

        assert_eq!(vec.data[0], r(0x1000, 0x5FFF));
        assert!(!vec.data[1].valid());
        assert!(!vec.data[2].valid());
    }

    #[test]
    fn merge_reuses_invalid_slot() {
        let mut vec = AddressRangeVector32::new();
        vec.merge(&r(0x1000, 0x1FFF));
        vec.merge(&r(0x3000, 0x3FFF));
        vec.exclude(&r(0x1000, 0x1FFF));
        vec.merge(&r(0x8000, 0x8FFF));

        assert_eq!(vec.slot_count(), 2);
        assert_eq!(vec.data[0], r(0x8000, 0x8FFF));
    }

    #[test]
    fn exclude_splits_entry() {
        let mut vec = AddressRangeVector32::new();
        vec.merge(&r(0x1000, 0x4FFF));
        vec.exclude(&r(0x2000, 0x2FFF));

        assert_eq!(sorted(&vec), vec![r(0x1000, 0x1FFF), r(0x3000, 0x4FFF)]);
    }

    #[test]
    fn exclude_truncates_head_and_tail() {
        let mut vec: AddressRangeVector32 = [r(0x0, 0xFF), r(0x200, 0x2FF), r(0x400, 0x4FF)]
            .into_iter()
            .collect();
        vec.exclude(&r(0x80, 0x27F));

        assert_eq!(sorted(&vec), vec![r(0x0, 0x7F), r(0x280, 0x2FF), r(0x400, 0x4FF)]);

        vec.exclude(&r(0x0, 0xFFFF));
        assert!(vec.is_empty());
        assert_eq!(vec.slot_count(), 3);
    }

    #[test]
    fn invalid_input_is_ignored() {
        let mut vec = AddressRangeVector32::new();
        vec.merge(&AddressRange32::invalid());
        assert_eq!(vec.slot_count(), 0);
        vec.merge(&r(1, 2));
        vec.exclude(&AddressRange32::invalid());
        assert_eq!(sorted(&vec), vec![r(1, 2)]);
    }

    #[test]
    fn contains_requires_a_single_entry() {
        let vec: AddressRangeVector32 = [r(0x0, 0xF), r(0x20, 0x2F)].into_iter().collect();
        assert!(vec.contains(&r(0x2, 0x8)));
        assert!(!vec.contains(&r(0x8, 0x24)));
        assert!(vec.overlaps(&r(0x8, 0x24)));
        assert!(r(0x21, 0x22).inside_vector(&vec));
        assert!(vec.inside(&r(0, 0x30)));
        assert!(!vec.inside(&r(0, 0x28)));
        assert_eq!(vec.get_min_max(), r(0x0, 0x2F));
    }

    #[test]
    fn flush_exclusion_leaves_only_uncovered_parts() {
        // Pending flush of one region, minus everything another writer already owns.
        let mut flush = AddressRangeVector32::new();
        flush.merge(&r(0x10000, 0x1FFFF));

        let owned: AddressRangeVector32 = [r(0x11000, 0x11FFF), r(0x1C000, 0x2FFFF)]
            .into_iter()
            .collect();
        flush.exclude_vector(&owned);

        assert_eq!(
            sorted(&flush),
            vec![r(0x10000, 0x10FFF), r(0x12000, 0x1BFFF)]
        );
        assert!(!flush.overlaps_vector(&owned));
        assert!(flush.check_consistency());
    }
}
