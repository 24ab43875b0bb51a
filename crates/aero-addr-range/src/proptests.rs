use std::collections::BTreeSet;

use proptest::prelude::*;

use crate::{AddressRange32, AddressRangeVector32};

const DOMAIN: u32 = 512;

#[derive(Debug, Clone)]
enum Op {
    Merge(AddressRange32),
    Exclude(AddressRange32),
}

fn any_range() -> impl Strategy<Value = AddressRange32> {
    prop_oneof![
        4 => (0u32..DOMAIN, 1u32..64).prop_map(|(start, len)| {
            AddressRange32::start_length(start, len)
        }),
        1 => Just(AddressRange32::invalid()),
    ]
}

fn wide_range() -> impl Strategy<Value = AddressRange32> {
    (any::<u32>(), any::<u32>()).prop_map(|(a, b)| AddressRange32::start_end(a.min(b), a.max(b)))
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        any_range().prop_map(Op::Merge),
        any_range().prop_map(Op::Exclude),
    ]
}

fn covered(vec: &AddressRangeVector32) -> BTreeSet<u32> {
    vec.iter().flat_map(|r| r.start..=r.end).collect()
}

fn range_set(range: &AddressRange32) -> BTreeSet<u32> {
    if range.valid() {
        (range.start..=range.end).collect()
    } else {
        BTreeSet::new()
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_predicates_are_symmetric(a in wide_range(), b in wide_range()) {
        prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));
        prop_assert_eq!(a.touches(&b), b.touches(&a));
        if a.inside(&b) && b.inside(&a) {
            prop_assert_eq!(a, b);
        }
    }

    #[test]
    fn prop_signed_distance_is_antisymmetric(a in wide_range(), b in wide_range()) {
        if a.touches(&b) {
            prop_assert_eq!(a.distance(&b), 0);
            prop_assert_eq!(a.signed_distance(&b), 0);
        } else {
            prop_assert_eq!(a.signed_distance(&b), -b.signed_distance(&a));
            prop_assert_eq!(a.signed_distance(&b).unsigned_abs(), u64::from(a.distance(&b)));
            prop_assert_eq!(a.distance(&b), b.distance(&a));
        }
    }

    #[test]
    fn prop_page_range_round_trip(a in wide_range()) {
        let page = a.to_page_range();
        prop_assert!(page.is_page_range());
        prop_assert!(a.inside(&page));

        let mut twice = page;
        twice.page_align();
        prop_assert_eq!(twice, page);
    }

    #[test]
    fn prop_intersect_is_inside_both(a in wide_range(), b in wide_range()) {
        let i = a.get_intersect(&b);
        prop_assert_eq!(i.valid(), a.overlaps(&b));
        if i.valid() {
            prop_assert!(i.inside(&a) && i.inside(&b));
        }
        prop_assert!(a.inside(&a.get_min_max(&b)));
    }

    #[test]
    fn prop_vector_matches_set_model(ops in proptest::collection::vec(op_strategy(), 0..48)) {
        let mut vec = AddressRangeVector32::new();
        let mut model = BTreeSet::new();

        for op in &ops {
            match op {
                Op::Merge(range) => {
                    vec.merge(range);
                    model.extend(range_set(range));
                }
                Op::Exclude(range) => {
                    vec.exclude(range);
                    for addr in range_set(range) {
                        model.remove(&addr);
                    }
                }
            }
            prop_assert!(vec.check_consistency(), "inconsistent after {:?}: {:?}", op, vec);
            prop_assert_eq!(&covered(&vec), &model);
        }
    }
}
