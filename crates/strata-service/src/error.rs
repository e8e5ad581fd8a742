//! Error types for the context service

use strata_core::{ConfigError, ContextError};
use strata_sync::SyncError;
use thiserror::Error;

/// Main service error type
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Structural or integrity failure of the operation
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Journal failure
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Journal entry could not be applied while rebuilding the store
    #[error("journal replay failed at seq {seq}: {source}")]
    Replay {
        /// Entry that failed
        seq: u64,
        /// Why it failed
        #[source]
        source: ContextError,
    },
}

impl ServiceError {
    /// Underlying context error, if this is one
    #[must_use]
    pub fn as_context(&self) -> Option<&ContextError> {
        match self {
            Self::Context(e) | Self::Replay { source: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Check if the error is a missing record or delegation
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        use ContextError::{DelegationNotFound, NotFound};
        matches!(self.as_context(), Some(NotFound(_) | DelegationNotFound(_)))
    }

    /// Check if local state cannot be trusted
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Sync(e) => e.is_corruption(),
            Self::Replay { .. } => true,
            Self::Context(e) => e.is_integrity_error(),
            Self::Config(_) => false,
        }
    }
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::EntityKey;

    #[test]
    fn context_errors_pass_through() {
        let err = ServiceError::from(ContextError::NotFound(EntityKey::global("g")));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "context not found: global:g");
    }

    #[test]
    fn broken_chain_is_corruption() {
        let err = ServiceError::from(SyncError::BrokenChain {
            seq: 2,
            reason: "hash".into(),
        });
        assert!(err.is_corruption());
        assert!(!err.is_not_found());
    }
}
