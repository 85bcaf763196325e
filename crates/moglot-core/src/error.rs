//! Error types.
//!
//! Per-line, per-chunk and per-batch failures are recovered locally and
//! surfaced only through [`ParsingSummary`](crate::models::ParsingSummary)
//! counters. An `Err` from this crate always means something structural:
//! the database cannot be opened, the schema cannot be created, or an
//! operation was attempted in the wrong connection mode.

use thiserror::Error;

/// Result type for moglot operations.
pub type Result<T> = std::result::Result<T, MoglotError>;

/// Errors that abort an operation outright.
#[derive(Debug, Error)]
pub enum MoglotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("invalid connection mode: expected {expected}, was {actual}")]
    InvalidMode {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("index build service is stopped")]
    IndexServiceStopped,
}
