//! Shared harness for dump round-trip tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use indumpco::extract::extract_dump_to;
use indumpco::writer::{create_dump, CreateOptions};
use tempfile::TempDir;

pub struct DumpUnderTest {
    tmp: Option<TempDir>,
    pub dumpdir: PathBuf,
    pub blockdir: PathBuf,
    pub new_segs: usize,
    pub reused_segs: usize,
    pub absent_segs: usize,
    pub digests: HashSet<String>,
}

impl DumpUnderTest {
    pub fn create(
        input: &[u8],
        reuse_dumpdirs: &[&Path],
        remote_segs: Option<&HashSet<String>>,
    ) -> DumpUnderTest {
        let tmp = TempDir::new().unwrap();
        let dumpdir = tmp.path().join("d");
        let blockdir = dumpdir.join("blocks");

        let remote_segs_file = remote_segs.map(|segs| {
            let path = tmp.path().join("remotesegs");
            let mut body = String::new();
            for seg_sum in segs {
                body.push_str(seg_sum);
                body.push('\n');
            }
            fs::write(&path, body).unwrap();
            path
        });

        let opts = CreateOptions {
            reuse_dumps: reuse_dumpdirs.iter().map(|dir| dir.to_path_buf()).collect(),
            remote_segs_file,
            threads: 4,
        };
        create_dump(Cursor::new(input.to_vec()), &dumpdir, &opts).unwrap();

        let mut dump = DumpUnderTest {
            tmp: Some(tmp),
            dumpdir,
            blockdir,
            new_segs: 0,
            reused_segs: 0,
            absent_segs: 0,
            digests: HashSet::new(),
        };
        // Gather reuse stats right away: the counts rely on hard-link counts,
        // which deleting the reuse dumps later would skew.
        dump.count_segment_reuse();
        dump
    }

    #[cfg(unix)]
    fn count_segment_reuse(&mut self) {
        use std::os::unix::fs::MetadataExt;
        for line in fs::read_to_string(self.dumpdir.join("index")).unwrap().lines() {
            let seg_sum = line.split_whitespace().nth(1).unwrap().to_owned();
            let path = self.blockdir.join(&seg_sum);
            if path.exists() {
                if fs::metadata(&path).unwrap().nlink() == 1 {
                    self.new_segs += 1;
                } else {
                    self.reused_segs += 1;
                }
            } else {
                self.absent_segs += 1;
            }
            self.digests.insert(seg_sum);
        }
    }

    #[cfg(not(unix))]
    fn count_segment_reuse(&mut self) {
        for line in fs::read_to_string(self.dumpdir.join("index")).unwrap().lines() {
            self.digests.insert(line.split_whitespace().nth(1).unwrap().to_owned());
        }
    }

    pub fn restore(&self, extra_blkdirs: &[&Path]) -> Vec<u8> {
        let extras: Vec<PathBuf> = extra_blkdirs.iter().map(|dir| dir.to_path_buf()).collect();
        let mut out = Vec::new();
        extract_dump_to(&self.dumpdir, &extras, 4, &mut out).unwrap();
        out
    }
}

impl Drop for DumpUnderTest {
    fn drop(&mut self) {
        if std::env::var_os("INDUMPCO_TEST_NODEL").is_some() {
            if let Some(tmp) = self.tmp.take() {
                eprintln!("INDUMPCO_TEST_NODEL: keeping {}", tmp.path().display());
                std::mem::forget(tmp);
            }
        }
    }
}

/// A long, repetitive-but-drifting text stream; `n` is the starting bottle
/// count, ~95 bytes of text per bottle.
pub fn bottles(n: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for b in (2..=n).rev() {
        out.extend_from_slice(
            format!(
                "{b} bottles of beer on the wall, {b} bottles of beer.\n\
                 If one of those bottles should happen to fall, "
            )
            .as_bytes(),
        );
    }
    out
}
