mod common;

use indumpco::chunker::{Chunker, MAX_SEG_LEN, MIN_SEG_LEN};
use proptest::prelude::*;
use std::collections::HashSet;
use std::io::Cursor;

fn chunk(data: &[u8]) -> Vec<Vec<u8>> {
    Chunker::new(Cursor::new(data.to_vec())).map(|seg| seg.unwrap()).collect()
}

#[test]
fn concatenation_reproduces_input_and_bounds_hold() {
    let data = common::bottles(250_000);
    let segs = chunk(&data);
    assert!(segs.len() >= 2, "expected multiple segments from {} bytes", data.len());
    assert_eq!(segs.concat(), data);
    for (n, seg) in segs.iter().enumerate() {
        assert!(seg.len() <= MAX_SEG_LEN);
        if n + 1 < segs.len() {
            assert!(seg.len() >= MIN_SEG_LEN, "segment {n} is only {} bytes", seg.len());
        }
    }
    assert_eq!(chunk(&data), segs, "identical input must split identically");
}

#[test]
fn small_edit_leaves_later_boundaries_in_place() {
    let mut data = common::bottles(300_000);
    let before: HashSet<Vec<u8>> = chunk(&data).into_iter().collect();
    data.drain(4321..4325);
    let after = chunk(&data);
    assert!(after.len() >= 3);
    let fresh = after.iter().filter(|seg| !before.contains(seg.as_slice())).count();
    assert!(fresh <= 2, "{fresh} fresh segments after a 4-byte deletion");
}

#[test]
fn constant_input_is_cut_at_the_cap() {
    // All-zero input never satisfies the content predicate, so only the
    // length cap can cut it.
    let data = vec![0u8; MAX_SEG_LEN + MAX_SEG_LEN / 2];
    let lens: Vec<usize> = chunk(&data).iter().map(|seg| seg.len()).collect();
    assert_eq!(lens, [MAX_SEG_LEN, MAX_SEG_LEN / 2]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn sub_minimum_inputs_come_back_whole(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
        let segs = chunk(&data);
        prop_assert!(segs.len() <= 1);
        prop_assert_eq!(segs.concat(), data);
    }
}
