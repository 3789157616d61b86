use std::fmt;

use thiserror::Error;

/// Which dedup tier flagged the receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DuplicateKind {
    /// Identical file bytes were processed before.
    Physical,
    /// A different file describing the same transaction (type + minute + amount).
    Semantic,
}

impl fmt::Display for DuplicateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Physical => f.write_str("physical"),
            Self::Semantic => f.write_str("semantic"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Not a failure: the receipt was already handled. Resolved locally by
    /// archiving the file instead of quarantining it.
    #[error("{kind} duplicate receipt")]
    Duplicate { kind: DuplicateKind },

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("no trip segment matches the receipt timestamp")]
    NoMatch,

    #[error("submission failed: {0}")]
    Submission(String),

    /// Ledger unavailable or misbehaving. Fatal for the current pass; never
    /// swallowed, so a submission is never attempted without a durable record.
    #[error("ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
