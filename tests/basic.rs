mod common;

use common::DumpUnderTest;
use std::fs;

fn check_restores(input: &[u8]) {
    let dump = DumpUnderTest::create(input, &[], None);
    assert_eq!(dump.restore(&[]), input);
}

#[test]
fn short_pathological_strings() {
    for s in ["\r", "\n", "", "x", "\0", "\\", "foo", "0"] {
        check_restores(s.as_bytes());
    }
}

#[test]
fn multi_megabyte_repetitive_stream() {
    check_restores(&common::bottles(120_000));
}

#[test]
fn nested_block_layout() {
    let input: &[u8] = b"afs lasfjlasf laskjdf lasfj asf
asldf aslfjas lfdslad lkjsadflkasf lsaflasdfjsldfj sladfjlaldsfjlsajfsadf
asdlf lasdfsad flsadladsdfj2 fsfsljflsfjs lasdfj    234028340f sadfjasflsl";
    let dump = DumpUnderTest::create(input, &[], None);

    // Re-shelve every block under its first hex digit; extraction must
    // detect the nested layout and still restore bit-for-bit.
    for hexdigit in "0123456789abcdef".chars() {
        fs::create_dir(dump.blockdir.join(hexdigit.to_string())).unwrap();
    }
    for entry in fs::read_dir(&dump.blockdir).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().into_string().unwrap();
        if name.len() > 2 {
            fs::rename(entry.path(), dump.blockdir.join(&name[..1]).join(&name)).unwrap();
        }
    }
    assert_eq!(dump.restore(&[]), input);
}
