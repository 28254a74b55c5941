//! Error types for Strata

use crate::Timestamp;
use thiserror::Error;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage engine error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Truncated or unreadable header
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Write before the start of a fixed-interval file
    #[error("Timestamp {timestamp} lies before file start {start}")]
    InvalidTimestamp { timestamp: Timestamp, start: Timestamp },

    /// Not a sample file name
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store already closed
    #[error("Store is closed")]
    Closed,

    /// Store opened read-only
    #[error("Store is read-only")]
    ReadOnly,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Check if error came from the filesystem
    pub fn is_io(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corruption(_) | StoreError::InvalidFormat(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Config(e.to_string())
    }
}
