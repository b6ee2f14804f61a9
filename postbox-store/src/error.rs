//! Error types for queue storage.

use thiserror::Error;

use crate::{QueueStatus, RecordId};

/// Top-level store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Record does not exist.
    #[error("Record not found: {0}")]
    NotFound(RecordId),

    /// Content is created at most once per record.
    #[error("Record {0} already has content")]
    ContentExists(RecordId),

    /// Attempted a status change outside the lifecycle.
    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition { from: QueueStatus, to: QueueStatus },

    /// A new record carries a value the store cannot hold.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// A persisted value could not be decoded.
    #[error("Corrupted row: {0}")]
    Corrupted(String),

    /// Blocking worker for a storage call panicked or was cancelled.
    #[error("Storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_display() {
        let err = StoreError::InvalidTransition {
            from: QueueStatus::Sent,
            to: QueueStatus::Queued,
        };
        assert_eq!(err.to_string(), "Invalid status transition SENT -> QUEUED");
    }

    #[test]
    fn test_sqlite_conversion() {
        let err: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, StoreError::Sqlite(_)));
    }
}
