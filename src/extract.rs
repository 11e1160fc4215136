//! Dump extraction: index → blocks → ordered segment stream.
//!
//! The index is the question sequence; each idxline is resolved through the
//! block search path (the dump's own `blocks/` first, then any extras) and
//! decoded by a pool worker.  Decoding an x-block yields several segments at
//! once, so the workers coordinate through the QA cache: the first worker to
//! reach any idxline of a compound claims the whole decode, sibling workers
//! park their output slots with the cache instead of repeating it, and
//! upcoming repeats are served from the cached answers.  Answers are shared
//! as `Arc<Vec<u8>>` so a cached delivery never copies segment bytes.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::blockdir::BlockSearchPath;
use crate::error::Error;
use crate::format::{read_index, BlockFile, FormatError, IdxLine};
use crate::pipeline::{parallel_pipe, OutputSlot, PllPipe};
use crate::qa_cache::{QaCache, DEFAULT_LOOKAHEAD};

type Segment = Arc<Vec<u8>>;

// ── Worker ───────────────────────────────────────────────────────────────────

fn decode_one(
    cache: &QaCache<IdxLine, Segment>,
    search: &BlockSearchPath,
    slot: OutputSlot<Segment>,
    q: IdxLine,
) -> Result<(), Error> {
    if let Some(answer) = cache.consume_cached_answer(&q)? {
        slot.deposit(answer);
        return Ok(());
    }

    let (seg_len, seg_sum) = q.unpack();
    let path = search
        .find(seg_sum)
        .ok_or_else(|| FormatError::MissingBlock { seg_sum: seg_sum.to_owned() })?;
    let blk = BlockFile::open(&path)?;

    if blk.is_x() {
        let byproducts = blk.byproducts(seg_sum);
        if cache.i_should_compute(&q, &byproducts) {
            let mut desired: HashSet<IdxLine> = byproducts.iter().cloned().collect();
            desired.insert(q.clone());
            let mut answer = None;
            let mut byproduct_qas = Vec::new();
            for (line, data) in blk.read_x(&desired)? {
                let seg = Arc::new(data);
                if answer.is_none() && line == q {
                    answer = Some(seg);
                } else {
                    byproduct_qas.push((line, seg));
                }
            }
            let answer = answer.ok_or(FormatError::XMissingRequested { path })?;
            cache.i_have_computed(&q, answer.clone(), byproduct_qas)?;
            slot.deposit(answer);
        } else {
            // The claimant will fill this slot when its decode completes.
            cache.put_answer_when_ready(&q, slot)?;
        }
    } else if cache.i_should_compute(&q, &[]) {
        let data = blk.read_z()?;
        if data.len() as u64 != seg_len {
            return Err(FormatError::WrongSegmentLength {
                path,
                expected: seg_len,
                actual: data.len() as u64,
            }
            .into());
        }
        let answer = Arc::new(data);
        cache.i_have_computed(&q, answer.clone(), Vec::new())?;
        slot.deposit(answer);
    } else {
        cache.put_answer_when_ready(&q, slot)?;
    }
    Ok(())
}

// ── Stream ───────────────────────────────────────────────────────────────────

/// Ordered segment stream from [`extract_dump`]; concatenating the yielded
/// buffers reproduces the dumped stream.
pub struct ExtractStream {
    pipe: PllPipe<Segment, Error>,
    cache: QaCache<IdxLine, Segment>,
    errored: bool,
    checked: bool,
}

impl Iterator for ExtractStream {
    type Item = Result<Segment, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.pipe.next() {
            Some(Ok(seg)) => Some(Ok(seg)),
            Some(Err(e)) => {
                self.errored = true;
                Some(Err(e))
            }
            None => {
                if self.errored || self.checked {
                    return None;
                }
                // A clean run must leave the cache empty.
                self.checked = true;
                match self.cache.finished() {
                    Ok(()) => None,
                    Err(e) => Some(Err(e.into())),
                }
            }
        }
    }
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// Open a dump for extraction, decoding blocks across `threads` workers.
///
/// `extra_block_dirs` are searched after the dump's own `blocks/`; a dump
/// created with remote segments needs the remote block directory here.
pub fn extract_dump(
    dumpdir: &Path,
    extra_block_dirs: &[PathBuf],
    threads: usize,
) -> Result<ExtractStream, Error> {
    let questions = read_index(&dumpdir.join("index"))?;

    let mut dirs = vec![dumpdir.join("blocks")];
    dirs.extend(extra_block_dirs.iter().cloned());
    let search = Arc::new(BlockSearchPath::new(dirs));

    let cache: QaCache<IdxLine, Segment> = QaCache::new(DEFAULT_LOOKAHEAD);
    let question_iter = cache.iter_questions(questions.into_iter())?;

    let worker = {
        let cache = cache.clone();
        move |slot: OutputSlot<Segment>, q: IdxLine| decode_one(&cache, &search, slot, q)
    };

    let pipe = parallel_pipe(question_iter.map(Ok), worker, threads);
    Ok(ExtractStream { pipe, cache, errored: false, checked: false })
}

/// Extract a dump and write the reconstructed stream to `out`; returns the
/// byte count written.
pub fn extract_dump_to<W: Write>(
    dumpdir: &Path,
    extra_block_dirs: &[PathBuf],
    threads: usize,
    out: &mut W,
) -> Result<u64, Error> {
    let mut total = 0u64;
    for seg in extract_dump(dumpdir, extra_block_dirs, threads)? {
        let seg = seg?;
        out.write_all(&seg)?;
        total += seg.len() as u64;
    }
    Ok(total)
}
