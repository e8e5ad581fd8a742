//! Error types for the journal and remote sync

use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by a remote endpoint
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Endpoint could not be reached or answered with a transient failure
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// Endpoint refused the change
    #[error("remote rejected change: {0}")]
    Rejected(String),
}

/// Errors from the sync layer
#[derive(Debug, Error)]
pub enum SyncError {
    /// Journal file could not be read or written
    #[error("journal I/O error at {path}: {source}")]
    Io {
        /// Journal path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Journal line could not be encoded or decoded
    #[error("journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Hash chain verification failed
    #[error("journal hash chain broken at seq {seq}: {reason}")]
    BrokenChain {
        /// First entry that failed verification
        seq: u64,
        /// What did not match
        reason: String,
    },

    /// Status line refers to an entry the journal does not hold
    #[error("unknown journal entry {0}")]
    UnknownEntry(u64),

    /// Remote push failed
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Remote push did not finish in time
    #[error("remote push of seq {seq} timed out after {timeout_ms}ms")]
    Timeout {
        /// Entry being pushed
        seq: u64,
        /// Timeout that elapsed
        timeout_ms: u64,
    },
}

impl SyncError {
    /// Wrap an I/O error with the journal path
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Check if a later retry may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Remote(RemoteError::Unavailable(_)) | Self::Io { .. }
        )
    }

    /// Check if the journal itself is untrustworthy
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::BrokenChain { .. } | Self::UnknownEntry(_) | Self::Serialization(_)
        )
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
