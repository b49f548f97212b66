//! Error types for mqstore
//!
//! All fallible operations in the store return [`Result`]. The variants map
//! onto the store's failure taxonomy: illegal input is rejected before any
//! offset is assigned, corruption found during recovery triggers truncation
//! rather than failure, and only commit-log-level I/O problems are fatal.

use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Main error type for the storage engine
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Message illegal: {0}")]
    MessageIllegal(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    #[error("Offset out of range: {0}")]
    OffsetOutOfRange(i64),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store is shutting down")]
    ShuttingDown,
}

impl StoreError {
    /// Convenience constructor for corruption errors
    pub fn corrupted(msg: impl Into<String>) -> Self {
        StoreError::CorruptedData(msg.into())
    }
}
