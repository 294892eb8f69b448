use thiserror::Error;

use crate::feed::NaturalKey;

/// Error taxonomy for the feed pipeline. Parse and Duplicate are recoverable
/// per-row conditions and are collected into import reports rather than
/// aborting a batch; the rest surface to the caller.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("row {row}: {reason}")]
    Parse { row: usize, reason: String },
    #[error("duplicate transaction {0}")]
    Duplicate(NaturalKey),
    #[error("validation: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("concurrent update: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl FeedError {
    pub fn parse(row: usize, reason: impl Into<String>) -> Self {
        FeedError::Parse {
            row,
            reason: reason.into(),
        }
    }

    /// Conflicts are the only retryable variant; everything else either
    /// succeeded partially (Parse/Duplicate) or needs caller intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::Conflict(_))
    }
}
