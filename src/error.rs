//! Crate-level error type.
//!
//! Every operation is fatal on first failure; nothing is retried.  The two
//! structured kinds keep their own enums next to the code that raises them
//! ([`FormatError`] in `format`, [`WorkflowError`] in `qa_cache`) and fold
//! into [`Error`] here.

use std::io;
use thiserror::Error;

use crate::format::FormatError;
use crate::qa_cache::WorkflowError;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or inconsistent on-disk data.
    #[error(transparent)]
    Format(#[from] FormatError),
    /// Cache/pipeline protocol misuse — an implementation bug, not bad input.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
