//! # indumpco — incremental dump compressor
//!
//! Converts a large byte stream (typically a textual database dump) into a
//! content-addressed store of compressed segments plus an ordered index, and
//! reconstructs the original stream from it.  Successive dumps of a slowly
//! changing source share most segments; a new dump stores only the segments
//! whose bytes changed, hard-linking the rest from prior dumps.
//!
//! Format guarantees (frozen):
//! - A dump directory is `index` (text, one `"<len> <md5hex>\n"` line per
//!   segment, in stream order) plus `blocks/`, a directory of block files
//! - Block files are named by the lowercase MD5 hex digest of their decoded
//!   bytes; inside one dump a digest exists at most once
//! - z-blocks: one byte `'z'`, then the segment zlib-compressed at level 9
//! - x-blocks: one byte `'x'`, an ASCII header (overall digest, line count,
//!   the embedded idxlines verbatim), then one xz stream over the embedded
//!   segments concatenated in listed order
//! - Block directories are flat, or nested one level by first hex digit;
//!   nesting is detected by the presence of a `0` subdirectory
//! - Segment boundaries depend only on local content: identical input splits
//!   identically on every run and platform
//! - Dumps are write-once; repacking replaces block files atomically via
//!   link + rename, so concurrent readers always see complete files

pub mod blockdir;
pub mod chunker;
pub mod error;
pub mod extract;
pub mod format;
pub mod pipeline;
pub mod qa_cache;
pub mod repack;
pub mod writer;

// Flat re-exports for the most common types.
pub use blockdir::{BlockDir, BlockSearchPath, Layout};
pub use chunker::Chunker;
pub use error::Error;
pub use extract::{extract_dump, extract_dump_to, ExtractStream};
pub use format::{BlockFile, FormatError, IdxLine};
pub use pipeline::{parallel_pipe, OutputSlot, PllPipe};
pub use qa_cache::{QaCache, WorkflowError};
pub use repack::{repack_blocks, rewrite_index, RepackReport};
pub use writer::{create_dump, CreateOptions, DumpStats};
