//! Error types for memos-server.

use thiserror::Error;

/// Result type alias using memos-server's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for memos-server operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found, or not visible to the caller
    #[error("Not found: {0}")]
    NotFound(String),

    /// Filter expression failed to parse or type-check
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Page token is not a non-negative decimal offset
    #[error("Invalid page token: {0}")]
    InvalidPageToken(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation requires an authenticated viewer
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Client offset does not match the authoritative upload offset
    #[error("Upload offset mismatch: expected {expected}, current {current}")]
    OffsetMismatch { expected: i64, current: i64 },

    /// Upload session has not received all declared bytes
    #[error("Upload incomplete: received {received} of {size} bytes")]
    UploadIncomplete { received: i64, size: i64 },

    /// Storage backend does not support the requested operation
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Object storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error is a client-side validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidFilter(_) | Error::InvalidPageToken(_) | Error::InvalidInput(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
