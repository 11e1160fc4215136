//! Offline repacking: regroup adjacent z-blocks into jointly compressed
//! x-blocks.
//!
//! The index is scanned in order and cut into groups of consecutive idxlines;
//! each group's z-blocks are decompressed, concatenated, and recompressed as
//! one xz stream.  When the joint stream is enough smaller than the separate
//! z-blocks, an x-block named by the overall digest is written and every
//! member digest becomes a hard link to it.  All replacements go through
//! `link`/`rename`, so a concurrent reader always sees a complete block file
//! under every digest.
//!
//! Grouping is digest-driven so that repeated runs cut the index at the same
//! places: a digest whose first hex character is in `0..=3` is a "hit", and a
//! hit arriving after four or more consecutive misses closes the group.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tempfile::NamedTempFile;

use crate::blockdir::BlockDir;
use crate::error::Error;
use crate::format::{encode_x, md5_hex, read_index, xz_pack, BlockFile, FormatError, IdxLine, Z_MAGIC};

/// A group closes when a hit digest arrives after this many misses.
const GROUP_MISS_LIMIT: usize = 4;
/// Joint recompression must shrink the group below this fraction of its
/// original compressed size to be kept.
const REPACK_RATIO: f64 = 0.9;

fn is_hit(seg_sum: &str) -> bool {
    matches!(seg_sum.bytes().next(), Some(b'0'..=b'3'))
}

/// Cut an index into candidate groups of consecutive idxlines.
pub fn split_into_groups(lines: impl IntoIterator<Item = IdxLine>) -> Vec<Vec<IdxLine>> {
    let mut groups = Vec::new();
    let mut group = Vec::new();
    let mut misses = 0usize;
    for line in lines {
        let hit = is_hit(line.seg_sum());
        group.push(line);
        if hit {
            if misses >= GROUP_MISS_LIMIT {
                groups.push(std::mem::take(&mut group));
            }
            misses = 0;
        } else {
            misses += 1;
        }
    }
    if !group.is_empty() {
        groups.push(group);
    }
    groups
}

/// One group's repack outcome.
#[derive(Debug, Clone)]
pub struct RepackReport {
    /// MD5 over the group's idxline bytes, identifying the group.
    pub group_sum: String,
    /// Joint compressed size over the sum of the original block sizes.
    pub ratio: f64,
    pub repacked: bool,
}

/// Repack every eligible group of `index_file` within `block_dir`.
///
/// Groups containing anything but z-blocks are skipped without a report, as
/// are their members on later runs (a repacked member reads back as an
/// x-block).
pub fn repack_blocks(index_file: &Path, block_dir: &Path) -> Result<Vec<RepackReport>, Error> {
    let bd = BlockDir::open(block_dir);
    let mut reports = Vec::new();
    for group in split_into_groups(read_index(index_file)?) {
        if let Some(report) = repack_group(&bd, &group)? {
            reports.push(report);
        }
    }
    Ok(reports)
}

fn repack_group(bd: &BlockDir, group: &[IdxLine]) -> Result<Option<RepackReport>, Error> {
    let mut members = Vec::with_capacity(group.len());
    for line in group {
        let path = bd.block_path(line.seg_sum());
        if !path.exists() {
            return Err(FormatError::MissingBlock { seg_sum: line.seg_sum().to_owned() }.into());
        }
        members.push(path);
    }
    // A group is only repackable while every member is still a z-block.
    for path in &members {
        let mut magic = [0u8; 1];
        if File::open(path)?.read(&mut magic)? != 1 || magic[0] != Z_MAGIC {
            return Ok(None);
        }
    }

    let mut payload = Vec::new();
    for path in &members {
        payload.extend(BlockFile::open(path)?.read_z()?);
    }
    let overall_sum = md5_hex(&payload);
    let packed = xz_pack(&payload)?;

    let mut original_size = 0u64;
    for path in &members {
        original_size += fs::metadata(path)?.len();
    }
    let ratio = packed.len() as f64 / original_size as f64;

    if ratio < REPACK_RATIO {
        let overall_path = bd.block_path(&overall_sum);
        let mut tmp = NamedTempFile::new_in(bd.dir())?;
        encode_x(&mut tmp, &overall_sum, group, &packed)?;
        tmp.persist(&overall_path).map_err(|e| Error::Io(e.error))?;

        // Replace each member z-block with a hard link to the x-block.
        for path in &members {
            if *path == overall_path {
                continue;
            }
            let link_tmp = link_tmp_path(path);
            let _ = fs::remove_file(&link_tmp); // stale leftover from an interrupted run
            fs::hard_link(&overall_path, &link_tmp)?;
            fs::rename(&link_tmp, path)?;
        }
    }

    let mut hasher = Md5::new();
    for line in group {
        hasher.update(line.as_bytes());
    }
    Ok(Some(RepackReport {
        group_sum: hex::encode(hasher.finalize()),
        ratio,
        repacked: ratio < REPACK_RATIO,
    }))
}

fn link_tmp_path(member: &Path) -> PathBuf {
    let mut name = member.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    member.with_file_name(name)
}

/// Rewrite an index to name x-blocks directly: wherever a group's first
/// digest resolves to an x-block embedding exactly that group, emit the
/// single overall idxline in its place.
pub fn rewrite_index<W: Write>(index_file: &Path, block_dir: &Path, out: &mut W) -> Result<(), Error> {
    let bd = BlockDir::open(block_dir);
    for group in split_into_groups(read_index(index_file)?) {
        let blk = BlockFile::open(&bd.block_path(group[0].seg_sum()))?;
        let replacement = blk
            .x_header()
            .filter(|hdr| hdr.embedded == group)
            .map(|hdr| hdr.overall_idxline.clone());
        match replacement {
            Some(line) => out.write_all(line.as_bytes())?,
            None => {
                for line in &group {
                    out.write_all(line.as_bytes())?;
                }
            }
        }
    }
    Ok(())
}
