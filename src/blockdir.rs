//! Block directories and the digest search path.
//!
//! A block directory maps a digest to a file in one of two layouts:
//!
//! ```text
//! flat:      <dir>/<digest>
//! nested-1:  <dir>/<first-hex-char>/<digest>
//! ```
//!
//! The layout is detected once per directory, at construction, by the
//! presence of a `0` subdirectory at the root.  The write path always uses
//! the current dump's own (flat) block directory; reuse and extra search
//! directories may use either layout.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Flat,
    Nested1,
}

#[derive(Debug, Clone)]
pub struct BlockDir {
    dir: PathBuf,
    layout: Layout,
}

impl BlockDir {
    /// Open a block directory, detecting its layout.
    pub fn open(dir: impl Into<PathBuf>) -> BlockDir {
        let dir = dir.into();
        let layout = if dir.join("0").exists() { Layout::Nested1 } else { Layout::Flat };
        BlockDir { dir, layout }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// The path at which a block with this digest lives (or would live).
    pub fn block_path(&self, seg_sum: &str) -> PathBuf {
        match self.layout {
            Layout::Flat => self.dir.join(seg_sum),
            Layout::Nested1 => self.dir.join(&seg_sum[..1]).join(seg_sum),
        }
    }
}

/// An ordered list of block directories searched front to back.
#[derive(Debug, Clone)]
pub struct BlockSearchPath {
    dirs: Vec<BlockDir>,
}

impl BlockSearchPath {
    pub fn new(dirs: impl IntoIterator<Item = PathBuf>) -> BlockSearchPath {
        BlockSearchPath { dirs: dirs.into_iter().map(BlockDir::open).collect() }
    }

    /// First existing block file for this digest, if any.
    pub fn find(&self, seg_sum: &str) -> Option<PathBuf> {
        self.dirs.iter().map(|bd| bd.block_path(seg_sum)).find(|path| path.exists())
    }
}
