#![forbid(unsafe_code)]
//! Error types for the xrec recovery core.
//!
//! Defines `RecoveryError` and a `Result<T>` alias used throughout the
//! workspace. Soft inconsistencies (patched in place during repair) are not
//! errors and never appear here.

use thiserror::Error;
use xrec_types::ParseError;

/// Unified error type for all recovery operations.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of memory")]
    OutOfMemory,

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    #[error("log protocol error: {0}")]
    Protocol(String),

    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<ParseError> for RecoveryError {
    fn from(err: ParseError) -> Self {
        Self::Format(err.to_string())
    }
}

/// Result alias using `RecoveryError`.
pub type Result<T> = std::result::Result<T, RecoveryError>;
