//! Error types for the sync engine.

use crate::remote::RemoteError;
use pawsync_core::CoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// How the engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retried with backoff.
    Transient,
    /// Routed to the conflict resolver.
    Conflict,
    /// Flagged for the integrity checker.
    Corruption,
    /// Halts syncing until the host fixes the cause.
    Fatal,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote store refused or failed a call.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Local store, queue, resolver or migration error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Temporary failure not tied to a remote call.
    #[error("transient failure: {message}")]
    Transient {
        /// Error message.
        message: String,
    },

    /// A remote call exceeded its deadline.
    #[error("{operation} timed out")]
    Timeout {
        /// The call that timed out.
        operation: String,
    },

    /// Syncing stopped after a fatal error and waits for `clear_fatal`.
    #[error("sync halted: {reason}")]
    Halted {
        /// The error that halted syncing.
        reason: String,
    },

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The background worker is gone.
    #[error("sync worker stopped")]
    WorkerStopped,
}

impl SyncError {
    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// The class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Remote(e) => match e {
                RemoteError::Unavailable(_) | RemoteError::Timeout | RemoteError::Rejected(_) => {
                    ErrorClass::Transient
                }
                RemoteError::VersionConflict { .. }
                | RemoteError::AlreadyExists { .. }
                | RemoteError::NotFound { .. } => ErrorClass::Conflict,
                RemoteError::Unauthorized(_) => ErrorClass::Fatal,
            },
            SyncError::Core(e) => match e {
                CoreError::SchemaTooNew { .. }
                | CoreError::MigrationFailed { .. }
                | CoreError::StorageFull { .. } => ErrorClass::Fatal,
                CoreError::AlreadyResolved { .. } | CoreError::ConflictNotFound { .. } => {
                    ErrorClass::Conflict
                }
                e if e.is_corruption() => ErrorClass::Corruption,
                _ => ErrorClass::Transient,
            },
            SyncError::Halted { .. } => ErrorClass::Fatal,
            SyncError::Transient { .. }
            | SyncError::Timeout { .. }
            | SyncError::Cancelled
            | SyncError::WorkerStopped => ErrorClass::Transient,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient && !matches!(self, SyncError::WorkerStopped)
    }

    /// Returns true if syncing must stop until the host intervenes.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Returns true if the error requires `clear_fatal` before syncing resumes.
    pub(crate) fn halts(&self) -> bool {
        matches!(self, SyncError::Remote(RemoteError::Unauthorized(_)))
    }
}
