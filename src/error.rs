use thiserror::Error;

use crate::arena::Handle;
use crate::config::DuplicatePolicy;

/// Errors surfaced by the tree and its ledgers.
///
/// [`Error::EmptyTree`] and [`Error::PolicyMismatch`] are caller-facing
/// conditions. `CorruptState` and `Invariant` mean the stored tree no longer
/// satisfies its structural invariants, and the remaining variants come from
/// the ledger the tree is committed to.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Tree is empty")]
    EmptyTree,

    #[error("corrupt tree state: node {handle} is not live")]
    CorruptState { handle: Handle },

    #[error("corrupt tree state: {0}")]
    Invariant(String),

    #[error("tree stores {stored:?} duplicates but was opened with {requested:?}")]
    PolicyMismatch {
        stored: DuplicatePolicy,
        requested: DuplicatePolicy,
    },

    #[error("journal I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal record encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("journal record at line {line} is invalid: {reason}")]
    Journal { line: usize, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
