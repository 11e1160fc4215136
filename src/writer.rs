//! Dump creation: chunk a stream, deduplicate, compress, write the index.
//!
//! A dump directory is created write-once: `blocks/` receives one block file
//! per distinct segment digest, `index` one idxline per segment in stream
//! order.  A segment whose digest already exists in a reuse dump's block
//! directory is hard-linked instead of re-encoded; a digest listed in the
//! remote-segments file is neither encoded nor linked — extraction of such a
//! dump needs the remote block directory passed as an extra search path.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::blockdir::BlockDir;
use crate::chunker::Chunker;
use crate::error::Error;
use crate::format::{encode_z, md5_hex, IdxLine};
use crate::pipeline::{parallel_pipe, OutputSlot};

// ── Options and stats ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Prior dump directories whose blocks may be hard-linked into this dump.
    pub reuse_dumps: Vec<PathBuf>,
    /// File of digests (one per line) that exist elsewhere and must not be
    /// stored here.
    pub remote_segs_file: Option<PathBuf>,
    pub threads: usize,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions { reuse_dumps: Vec::new(), remote_segs_file: None, threads: 8 }
    }
}

/// How each segment of a finished dump was materialized.
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpStats {
    pub segments: u64,
    /// Freshly encoded z-blocks.
    pub new_blocks: u64,
    /// Blocks hard-linked from a reuse dump.
    pub linked_blocks: u64,
    /// Segments skipped because their digest is declared remote.
    pub remote_segments: u64,
}

// ── Worker ───────────────────────────────────────────────────────────────────

enum SegOutcome {
    Fresh,
    Linked,
    /// Digest already present in this dump (repeated segment).
    Present,
    Remote,
}

struct WriterCtx {
    blkdir: BlockDir,
    reuse: Vec<BlockDir>,
    remote_segs: HashSet<String>,
}

impl WriterCtx {
    fn materialize(&self, seg_sum: &str, seg: &[u8]) -> Result<SegOutcome, Error> {
        if self.remote_segs.contains(seg_sum) {
            return Ok(SegOutcome::Remote);
        }
        let dest = self.blkdir.block_path(seg_sum);
        if dest.exists() {
            return Ok(SegOutcome::Present);
        }
        for reuse_dir in &self.reuse {
            let candidate = reuse_dir.block_path(seg_sum);
            if candidate.exists() {
                return match fs::hard_link(&candidate, &dest) {
                    Ok(()) => Ok(SegOutcome::Linked),
                    // A racing worker linked the same digest first.
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(SegOutcome::Present),
                    Err(e) => Err(e.into()),
                };
            }
        }
        // Fresh z-block, materialized atomically so racing workers and
        // concurrent readers never see a partial file.
        let mut tmp = NamedTempFile::new_in(self.blkdir.dir())?;
        encode_z(&mut tmp, seg)?;
        tmp.persist(&dest).map_err(|e| Error::Io(e.error))?;
        Ok(SegOutcome::Fresh)
    }
}

// ── Entry point ──────────────────────────────────────────────────────────────

/// Compress `src` into a new dump directory at `outdir`.
///
/// `outdir` must not exist; it and `outdir/blocks` are created.  Segments are
/// digested and encoded across `opts.threads` workers while the index is
/// written in stream order.
pub fn create_dump<R>(src: R, outdir: &Path, opts: &CreateOptions) -> Result<DumpStats, Error>
where
    R: Read + Send + 'static,
{
    fs::create_dir(outdir)?;
    let blkdir_path = outdir.join("blocks");
    fs::create_dir(&blkdir_path)?;
    let mut index = BufWriter::new(File::create(outdir.join("index"))?);

    let mut remote_segs = HashSet::new();
    if let Some(path) = &opts.remote_segs_file {
        for line in BufReader::new(File::open(path)?).lines() {
            let line = line?;
            let seg_sum = line.trim();
            if !seg_sum.is_empty() {
                remote_segs.insert(seg_sum.to_owned());
            }
        }
    }

    let ctx = Arc::new(WriterCtx {
        blkdir: BlockDir::open(&blkdir_path),
        reuse: opts.reuse_dumps.iter().map(|dump| BlockDir::open(dump.join("blocks"))).collect(),
        remote_segs,
    });

    let worker = {
        let ctx = Arc::clone(&ctx);
        move |slot: OutputSlot<(String, usize, SegOutcome)>, seg: Vec<u8>| -> Result<(), Error> {
            let seg_sum = md5_hex(&seg);
            let outcome = ctx.materialize(&seg_sum, &seg)?;
            slot.deposit((seg_sum, seg.len(), outcome));
            Ok(())
        }
    };

    let source = Chunker::new(src).map(|seg| seg.map_err(Error::from));
    let mut stats = DumpStats::default();
    for item in parallel_pipe(source, worker, opts.threads) {
        let (seg_sum, seg_len, outcome) = item?;
        index.write_all(IdxLine::pack(seg_len as u64, &seg_sum).as_bytes())?;
        stats.segments += 1;
        match outcome {
            SegOutcome::Fresh => stats.new_blocks += 1,
            SegOutcome::Linked => stats.linked_blocks += 1,
            SegOutcome::Present => {}
            SegOutcome::Remote => stats.remote_segments += 1,
        }
    }
    index.flush()?;
    Ok(stats)
}
