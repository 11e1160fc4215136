//! On-disk formats: index lines and block files.
//!
//! # Index line ("idxline")
//!
//! ```text
//! <seg_len> <seg_sum>\n
//! ```
//!
//! `seg_len` is the decimal byte length of a segment, `seg_sum` the lowercase
//! MD5 hex digest of its contents.  Parsing tolerates trailing whitespace;
//! emission is always exactly `"{len} {sum}\n"`.  An [`IdxLine`] preserves the
//! bytes it was parsed from (normalized to carry the terminating newline), and
//! compares and hashes as that byte string.  The raw line — not the digest —
//! is the cache key everywhere: an x-block's overall idxline and one of its
//! embedded idxlines may share a digest by coincidence while their lengths
//! differ.
//!
//! # Block files
//!
//! A block file is named by the digest of its decoded bytes and lives in a
//! block directory (see `blockdir`).  Two variants:
//!
//! ```text
//! z-block:  'z'  <zlib stream over one segment, level 9>
//! x-block:  'x'  <overall_sum>\n
//!                <N>\n
//!                <N embedded idxlines, each newline-terminated>
//!                <xz stream over the N segments concatenated in listed order>
//! ```
//!
//! `overall_sum` is the MD5 of the concatenated decompressed payload; its
//! length is the sum of the embedded lengths.  A digest may name either a
//! z-block or an x-block in which one embedded idxline carries that digest —
//! both decode to the same segment.

use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::bufread::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use md5::{Digest, Md5};
use thiserror::Error;

use crate::error::Error;

/// First byte of a single-segment zlib block.
pub const Z_MAGIC: u8 = b'z';
/// First byte of a compound xz block.
pub const X_MAGIC: u8 = b'x';
/// zlib level used for every freshly encoded z-block.
pub const Z_LEVEL: u32 = 9;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("malformed index line {0:?}")]
    MalformedIdxLine(String),
    #[error("invalid first byte {byte:#04x} of block file {}", .path.display())]
    BadMagic { path: PathBuf, byte: u8 },
    #[error("malformed x-block header in {}: {reason}", .path.display())]
    MalformedXHeader { path: PathBuf, reason: String },
    #[error("xz payload length not consistent with segment lengths in x header of {}", .path.display())]
    XLengthMismatch { path: PathBuf },
    #[error("x-block {} does not contain the requested idxline", .path.display())]
    XMissingRequested { path: PathBuf },
    #[error("decoded segment from {} is {actual} bytes, index says {expected}", .path.display())]
    WrongSegmentLength { path: PathBuf, expected: u64, actual: u64 },
    #[error("index references a missing block file {seg_sum}")]
    MissingBlock { seg_sum: String },
    #[error("xz decode error in {}: {reason}", .path.display())]
    Xz { path: PathBuf, reason: String },
}

impl FormatError {
    fn x_header(path: &Path, reason: impl Into<String>) -> FormatError {
        FormatError::MalformedXHeader { path: path.to_owned(), reason: reason.into() }
    }
}

// ── IdxLine ──────────────────────────────────────────────────────────────────

/// One index record, held as its canonical line bytes.
#[derive(Clone, Debug)]
pub struct IdxLine {
    raw: String,
    seg_len: u64,
    sum_start: usize,
    sum_end: usize,
}

impl IdxLine {
    /// Build the canonical line for a (length, digest) pair.
    pub fn pack(seg_len: u64, seg_sum: &str) -> IdxLine {
        let raw = format!("{seg_len} {seg_sum}\n");
        let sum_start = raw.len() - 1 - seg_sum.len();
        IdxLine { raw, seg_len, sum_start, sum_end: sum_start + seg_sum.len() }
    }

    /// Parse a line read from an index file or an x-block header.
    ///
    /// Trailing whitespace is tolerated and kept, except that a missing final
    /// newline is supplied so every stored line is newline-terminated.
    pub fn parse(line: &str) -> Result<IdxLine, FormatError> {
        let (seg_len, sum_start, sum_end) = match split_idxline(line) {
            Some(parts) => parts,
            None => return Err(FormatError::MalformedIdxLine(line.to_owned())),
        };
        let mut raw = line.to_owned();
        if !raw.ends_with('\n') {
            raw.push('\n');
        }
        Ok(IdxLine { raw, seg_len, sum_start, sum_end })
    }

    pub fn seg_len(&self) -> u64 {
        self.seg_len
    }

    pub fn seg_sum(&self) -> &str {
        &self.raw[self.sum_start..self.sum_end]
    }

    pub fn unpack(&self) -> (u64, &str) {
        (self.seg_len, self.seg_sum())
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.raw.as_bytes()
    }
}

impl PartialEq for IdxLine {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for IdxLine {}

impl Hash for IdxLine {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl fmt::Display for IdxLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// `^[0-9]+ [0-9a-fA-F]+\s*$` → (seg_len, sum_start, sum_end).
fn split_idxline(line: &str) -> Option<(u64, usize, usize)> {
    let rest = line.trim_end();
    let (len_part, sum_part) = rest.split_once(' ')?;
    if len_part.is_empty() || !len_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let seg_len = len_part.parse().ok()?;
    if sum_part.is_empty() || !sum_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let sum_start = len_part.len() + 1;
    Some((seg_len, sum_start, sum_start + sum_part.len()))
}

/// Read and validate a whole index file, in order.
pub fn read_index(path: &Path) -> Result<Vec<IdxLine>, Error> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for line in reader.lines() {
        lines.push(IdxLine::parse(&line?)?);
    }
    Ok(lines)
}

// ── Digests ──────────────────────────────────────────────────────────────────

/// MD5 of `data` as 32 lowercase hex characters — the block naming digest.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Write a z-block: the magic byte, then the segment zlib-compressed at
/// [`Z_LEVEL`].
pub fn encode_z<W: Write>(mut w: W, seg: &[u8]) -> io::Result<()> {
    w.write_all(&[Z_MAGIC])?;
    let mut enc = ZlibEncoder::new(w, Compression::new(Z_LEVEL));
    enc.write_all(seg)?;
    enc.finish()?;
    Ok(())
}

/// Compress a concatenated payload for an x-block.
pub fn xz_pack(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    lzma_rs::xz_compress(&mut io::Cursor::new(data), &mut out)?;
    Ok(out)
}

/// Write an x-block from an already xz-compressed payload.
///
/// The embedded idxlines are written verbatim, so the header bytes match the
/// cache keys under which the embedded segments will later be requested.
pub fn encode_x<W: Write>(
    mut w: W,
    overall_sum: &str,
    embedded: &[IdxLine],
    packed_payload: &[u8],
) -> io::Result<()> {
    w.write_all(&[X_MAGIC])?;
    write!(w, "{}\n{}\n", overall_sum, embedded.len())?;
    for line in embedded {
        w.write_all(line.as_bytes())?;
    }
    w.write_all(packed_payload)?;
    Ok(())
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Parsed x-block header.
#[derive(Debug, Clone)]
pub struct XHeader {
    pub overall_sum: String,
    pub overall_len: u64,
    /// Synthesized with [`IdxLine::pack`], so it is byte-for-byte equal to any
    /// index line naming the same compound.
    pub overall_idxline: IdxLine,
    pub embedded: Vec<IdxLine>,
}

#[derive(Debug)]
pub enum BlockKind {
    Z,
    X(XHeader),
}

/// An opened block file with its header parsed and the payload unread.
///
/// The file handle stays open only as long as the value lives; both `read_z`
/// and `read_x` consume it, so the handle is released as soon as decoding
/// completes.
pub struct BlockFile {
    path: PathBuf,
    reader: BufReader<File>,
    kind: BlockKind,
}

impl BlockFile {
    pub fn open(path: &Path) -> Result<BlockFile, Error> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 1];
        reader.read_exact(&mut magic)?;
        let kind = match magic[0] {
            Z_MAGIC => BlockKind::Z,
            X_MAGIC => BlockKind::X(read_x_header(path, &mut reader)?),
            byte => return Err(FormatError::BadMagic { path: path.to_owned(), byte }.into()),
        };
        Ok(BlockFile { path: path.to_owned(), reader, kind })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> &BlockKind {
        &self.kind
    }

    pub fn is_x(&self) -> bool {
        matches!(self.kind, BlockKind::X(_))
    }

    pub fn x_header(&self) -> Option<&XHeader> {
        match &self.kind {
            BlockKind::X(hdr) => Some(hdr),
            BlockKind::Z => None,
        }
    }

    /// Idxlines this block yields as a byproduct of decoding for `main_sum`:
    /// every embedded idxline carrying a different digest, plus the overall
    /// idxline when it differs.  Empty for z-blocks.
    pub fn byproducts(&self, main_sum: &str) -> Vec<IdxLine> {
        let hdr = match &self.kind {
            BlockKind::X(hdr) => hdr,
            BlockKind::Z => return Vec::new(),
        };
        let mut extra = HashSet::new();
        for line in &hdr.embedded {
            if line.seg_sum() != main_sum {
                extra.insert(line.clone());
            }
        }
        if hdr.overall_sum != main_sum {
            extra.insert(hdr.overall_idxline.clone());
        }
        extra.into_iter().collect()
    }

    /// Decompress a z-block's single segment.
    pub fn read_z(self) -> Result<Vec<u8>, Error> {
        debug_assert!(!self.is_x(), "read_z on an x-block");
        let mut out = Vec::new();
        ZlibDecoder::new(self.reader).read_to_end(&mut out)?;
        Ok(out)
    }

    /// Decompress an x-block's payload once and slice out every requested
    /// idxline at its cumulative offset.  The overall idxline, if requested,
    /// yields the whole payload.
    pub fn read_x(self, desired: &HashSet<IdxLine>) -> Result<Vec<(IdxLine, Vec<u8>)>, Error> {
        let BlockFile { path, mut reader, kind } = self;
        let hdr = match kind {
            BlockKind::X(hdr) => hdr,
            BlockKind::Z => {
                debug_assert!(false, "read_x on a z-block");
                return Ok(Vec::new());
            }
        };
        let mut payload = Vec::new();
        lzma_rs::xz_decompress(&mut reader, &mut payload)
            .map_err(|e| FormatError::Xz { path: path.clone(), reason: e.to_string() })?;
        drop(reader);

        let mut found = Vec::new();
        let mut offset = 0usize;
        for line in &hdr.embedded {
            let end = offset
                .checked_add(line.seg_len() as usize)
                .filter(|&end| end <= payload.len())
                .ok_or_else(|| FormatError::XLengthMismatch { path: path.clone() })?;
            if desired.contains(line) {
                found.push((line.clone(), payload[offset..end].to_vec()));
            }
            offset = end;
        }
        if offset != payload.len() {
            return Err(FormatError::XLengthMismatch { path }.into());
        }
        if desired.contains(&hdr.overall_idxline) {
            found.push((hdr.overall_idxline, payload));
        }
        Ok(found)
    }
}

fn read_x_header(path: &Path, reader: &mut BufReader<File>) -> Result<XHeader, Error> {
    let overall_sum = read_header_line(path, reader)?;
    if overall_sum.is_empty() || !overall_sum.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(FormatError::x_header(path, "overall digest is not hex").into());
    }
    let count_line = read_header_line(path, reader)?;
    let count: usize = count_line
        .parse()
        .map_err(|_| FormatError::x_header(path, format!("bad embedded line count {count_line:?}")))?;

    let mut embedded = Vec::with_capacity(count);
    let mut overall_len = 0u64;
    for _ in 0..count {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(FormatError::x_header(path, "truncated embedded idxline list").into());
        }
        let idxline = IdxLine::parse(&line)?;
        overall_len = overall_len
            .checked_add(idxline.seg_len())
            .ok_or_else(|| FormatError::x_header(path, "embedded lengths overflow"))?;
        embedded.push(idxline);
    }
    let overall_idxline = IdxLine::pack(overall_len, &overall_sum);
    Ok(XHeader { overall_sum, overall_len, overall_idxline, embedded })
}

fn read_header_line(path: &Path, reader: &mut BufReader<File>) -> Result<String, Error> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(FormatError::x_header(path, "truncated header").into());
    }
    Ok(line.trim_end().to_owned())
}
