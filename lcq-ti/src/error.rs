//! Error types for lcq-ti
//!
//! Component-local recoverable conditions (a single failed fetch job, a
//! single no-op row) are absorbed into counts; everything here is a
//! run-level failure that always surfaces to the caller.

use thiserror::Error;

/// Import error taxonomy
#[derive(Debug, Error)]
pub enum ImportError {
    /// Another run holds the advisory lock for this key. Fatal to this
    /// invocation and never retried: overlapping runs are a caller bug.
    #[error("import already running for lock key '{lock_key}'")]
    AlreadyRunning { lock_key: String },

    /// Every fan-out job yielded zero rows - "source is down", as opposed
    /// to "source had nothing new"
    #[error("all {total_jobs} fetch jobs produced 0 rows")]
    NoRowsProduced { total_jobs: usize },

    /// Candidate row failed validation before reaching the upsert engine
    #[error("invalid candidate row: {0}")]
    InvalidRow(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// lcq-common error
    #[error("common error: {0}")]
    Common(#[from] lcq_common::Error),

    /// Generic error from an import work closure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for import operations
pub type ImportResult<T> = Result<T, ImportError>;
