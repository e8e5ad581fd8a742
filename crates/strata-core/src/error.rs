//! Error types for context operations
//!
//! Covers the structural and integrity failures that abort an operation:
//! - Missing or duplicate records
//! - Malformed hierarchy links
//! - Delegation direction and lifecycle violations
//!
//! `SyncDegraded` is part of the taxonomy but never aborts a caller; it is
//! only surfaced through sync health reports.

use crate::level::ContextLevel;
use crate::record::EntityKey;

/// Main context error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// Record or ancestor does not exist
    #[error("context not found: {0}")]
    NotFound(EntityKey),

    /// Record already exists
    #[error("context already exists: {0}")]
    AlreadyExists(EntityKey),

    /// Malformed hierarchy link
    #[error("invalid parent for {key}: {reason}")]
    InvalidParent {
        /// Record being created
        key: EntityKey,
        /// What is wrong with the link
        reason: String,
    },

    /// Delegation target is not strictly less specific than the source
    #[error("invalid delegation direction: {source_level} -> {target_level}")]
    InvalidDirection {
        /// Level of the proposing record
        source_level: ContextLevel,
        /// Requested target level
        target_level: ContextLevel,
    },

    /// Ancestor walk exceeded the hop cap (data corruption)
    #[error("inheritance chain from {key} exceeded {max_hops} hops")]
    InheritanceCycle {
        /// Record whose chain was walked
        key: EntityKey,
        /// Cap that was exceeded
        max_hops: usize,
    },

    /// Delete blocked by child records
    #[error("{key} still has {} dependent record(s)", .children.len())]
    HasDependents {
        /// Record that was to be deleted
        key: EntityKey,
        /// Children still referencing it
        children: Vec<EntityKey>,
    },

    /// Journal entry exceeded its retry budget (non-fatal)
    #[error("sync degraded for entry #{seq} on {key} after {attempts} attempts")]
    SyncDegraded {
        /// Journal sequence number
        seq: u64,
        /// Affected record
        key: EntityKey,
        /// Attempts made so far
        attempts: u32,
    },

    /// Unknown delegation id
    #[error("delegation not found: {0}")]
    DelegationNotFound(String),

    /// Delegation already approved or rejected
    #[error("delegation {id} is already {status}")]
    DelegationClosed {
        /// Delegation id
        id: String,
        /// Terminal status it is in
        status: String,
    },
}

impl ContextError {
    /// Create invalid parent error
    #[inline]
    pub fn invalid_parent(key: EntityKey, reason: impl Into<String>) -> Self {
        Self::InvalidParent {
            key,
            reason: reason.into(),
        }
    }

    /// Check if error signals corrupted hierarchy data rather than a bad request
    #[inline]
    #[must_use]
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, Self::InheritanceCycle { .. })
    }

    /// Check if the caller's operation was aborted
    #[inline]
    #[must_use]
    pub fn aborts_operation(&self) -> bool {
        !matches!(self, Self::SyncDegraded { .. })
    }
}

/// Result type alias for context operations
pub type ContextResult<T> = Result<T, ContextError>;
