//! Error types for the PawSync core.

use pawsync_protocol::ProtocolError;
use pawsync_storage::StorageError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the local store, queue, resolver, checker and migrations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Backend error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Encoding, decoding or validation error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A write would exceed the configured capacity.
    #[error("storage full: {requested} bytes requested, capacity {capacity}")]
    StorageFull {
        /// Bytes that would be live after the write.
        requested: u64,
        /// Configured limit.
        capacity: u64,
    },

    /// A persisted record is unreadable or inconsistent.
    #[error("corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Log frame checksum mismatch.
    #[error("frame checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// No queue item with this id.
    #[error("queue item not found: {id}")]
    QueueItemNotFound {
        /// Item id.
        id: String,
    },

    /// The queue item is not in the state the operation needs.
    #[error("queue item {id} is {actual}, expected {expected}")]
    InvalidQueueState {
        /// Item id.
        id: String,
        /// Required state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// No conflict record with this id.
    #[error("conflict not found: {id}")]
    ConflictNotFound {
        /// Conflict id.
        id: String,
    },

    /// The conflict was resolved before.
    #[error("conflict {id} is already resolved")]
    AlreadyResolved {
        /// Conflict id.
        id: String,
    },

    /// A migration step failed.
    #[error("migration failed: {message}")]
    MigrationFailed {
        /// Description of the failure.
        message: String,
    },

    /// The replica was written by a newer engine.
    #[error("schema version {found} is newer than supported version {supported}")]
    SchemaTooNew {
        /// Version found in the ledger.
        found: u64,
        /// Latest version this build knows.
        supported: u64,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a migration failed error.
    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a queue item not found error.
    pub fn queue_item_not_found(id: impl Into<String>) -> Self {
        Self::QueueItemNotFound { id: id.into() }
    }

    /// Whether the error means persisted data cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            CoreError::Corruption { .. }
                | CoreError::ChecksumMismatch { .. }
                | CoreError::Storage(StorageError::Corrupted(_))
                | CoreError::Protocol(ProtocolError::Decode(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_classification() {
        assert!(CoreError::corruption("torn frame").is_corruption());
        assert!(CoreError::Protocol(ProtocolError::Decode("eof".into())).is_corruption());
        assert!(!CoreError::StorageFull {
            requested: 10,
            capacity: 5
        }
        .is_corruption());
        assert!(!CoreError::AlreadyResolved { id: "c1".into() }.is_corruption());
    }
}
