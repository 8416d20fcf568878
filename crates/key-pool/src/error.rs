//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("invalid credential: {0}")]
    Invalid(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
