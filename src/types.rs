//! Crate-wide error type and result alias.

use thiserror::Error;

/// Error taxonomy surfaced by every public operation.
///
/// The core propagates these verbatim; it never retries repository calls on
/// its own. Retry policy belongs to the storage collaborator.
#[derive(Debug, Error)]
pub enum GroveError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("canceled: {0}")]
    Canceled(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("not supported: {0}")]
    Unsupported(String),
}

impl GroveError {
    pub fn validation(msg: impl Into<String>) -> Self {
        GroveError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        GroveError::NotFound(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GroveError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, GroveError>;
