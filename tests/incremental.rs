#![cfg(unix)]

mod common;

use common::{bottles, DumpUnderTest};

#[test]
fn incremental_dump_reuses_unchanged_segments() {
    let mut input = bottles(500_000);

    let orig = DumpUnderTest::create(&input, &[], None);
    assert_eq!(orig.restore(&[]), input);

    // Delete a few bytes near the start, then redump against the original.
    // Boundaries are content-local, so everything past the edit must come
    // back as hard links.
    input.drain(4321..4325);
    let delbytes = DumpUnderTest::create(&input, &[orig.dumpdir.as_path()], None);
    assert_eq!(delbytes.restore(&[]), input);
    assert!(
        delbytes.new_segs <= 2,
        "a small change should create at most 2 new segments, got {}",
        delbytes.new_segs,
    );
    assert!(delbytes.new_segs < delbytes.reused_segs, "most segments should be reused");
    assert_eq!(delbytes.absent_segs, 0, "no absent segments");

    // The same redump with the original's digests declared remote rather
    // than linkable: unchanged segments are indexed but not stored, and
    // extraction needs the original block directory on the search path.
    let remote = DumpUnderTest::create(&input, &[], Some(&orig.digests));
    assert_eq!(remote.restore(&[orig.blockdir.as_path()]), input);
    assert_eq!(remote.new_segs, delbytes.new_segs, "same number of new segments");
    assert_eq!(remote.reused_segs, 0, "nothing reused from a block dir");
    assert_eq!(remote.absent_segs, delbytes.reused_segs, "reused segments become absent");
}
