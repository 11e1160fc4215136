mod common;

use common::{bottles, DumpUnderTest};
use indumpco::format::{encode_x, md5_hex, read_index, xz_pack, BlockFile};
use indumpco::repack::{repack_blocks, rewrite_index};
use std::fs;

fn repack_preserves(input: &[u8]) {
    let dump = DumpUnderTest::create(input, &[], None);
    let index = dump.dumpdir.join("index");
    repack_blocks(&index, &dump.blockdir).unwrap();
    assert_eq!(dump.restore(&[]), input, "repack failed to preserve data");

    let mut rewritten = Vec::new();
    rewrite_index(&index, &dump.blockdir, &mut rewritten).unwrap();
    fs::write(&index, &rewritten).unwrap();
    assert_eq!(dump.restore(&[]), input, "rewritten index failed to extract");
}

#[test]
fn repack_preserves_short_input() {
    repack_preserves(b"asd-0f98a-sdf9a-sf9a-sfd9as-df9a-sdf9-as9f-asdf9as-df");
}

#[test]
fn repack_preserves_long_input() {
    repack_preserves(&bottles(200_000));
}

/// Join every z-block of a dump into one x-block by hand, then extract it
/// through each of the compound read paths.
#[test]
fn compound_blocks_extract_through_every_path() {
    let input = bottles(300_000);
    let dump = DumpUnderTest::create(&input, &[], None);
    let index = dump.dumpdir.join("index");
    let lines = read_index(&index).unwrap();
    assert!(lines.len() >= 2);

    let mut payload = Vec::new();
    for line in &lines {
        payload.extend(BlockFile::open(&dump.blockdir.join(line.seg_sum())).unwrap().read_z().unwrap());
    }
    let overall_sum = md5_hex(&payload);
    let packed = xz_pack(&payload).unwrap();
    let xpath = dump.blockdir.join(&overall_sum);
    let mut f = fs::File::create(&xpath).unwrap();
    encode_x(&mut f, &overall_sum, &lines, &packed).unwrap();
    drop(f);
    for line in &lines {
        let member = dump.blockdir.join(line.seg_sum());
        if member != xpath {
            fs::remove_file(&member).unwrap();
            fs::hard_link(&xpath, &member).unwrap();
        }
    }

    // Sibling idxlines of one compound, decoded across workers: the block
    // must be decompressed once and sliced for everyone.
    assert_eq!(dump.restore(&[]), input);

    // Repeated idxlines are served from cache.
    let mut doubled = Vec::new();
    for line in &lines {
        doubled.extend_from_slice(line.as_bytes());
    }
    for line in &lines {
        doubled.extend_from_slice(line.as_bytes());
    }
    fs::write(&index, &doubled).unwrap();
    let mut twice = input.clone();
    twice.extend_from_slice(&input);
    assert_eq!(dump.restore(&[]), twice);

    // The overall idxline names the whole compound.
    fs::write(&index, format!("{} {}\n", payload.len(), overall_sum)).unwrap();
    assert_eq!(dump.restore(&[]), input);
}
