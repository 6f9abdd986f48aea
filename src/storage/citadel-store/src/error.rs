//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection or migration failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Query failed.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Unique constraint violated on insert.
    #[error("row already exists: {0}")]
    AlreadyExists(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic I/O error.
    #[error("io error: {0}")]
    Io(String),
}
