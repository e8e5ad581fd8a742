//! Journal entry types and the hash chain

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use strata_core::{Actor, Document, EntityKey, Stamp};

/// `prev_hash` of the first entry
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Remote propagation state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    /// Not yet pushed
    Pending,
    /// Confirmed by the remote
    Synced,
    /// Last push failed, waiting for retry
    Failed,
}

impl SyncState {
    /// Upper-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Synced => "SYNCED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutation carried by an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalOp {
    /// Record creation
    Create {
        /// Parent id at the next less specific level
        parent_ref: Option<String>,
        /// Initial document
        data: Document,
    },
    /// Shallow patch of an existing record
    Update {
        /// Keys to overwrite
        patch: Document,
    },
    /// Record removal
    Delete,
    /// Delegation proposal; the entry key is the target record
    Propose {
        /// Delegation id
        delegation_id: String,
        /// Record the pattern was captured at
        source: EntityKey,
        /// Keys merged into the target on approval
        pattern_data: Document,
    },
    /// Delegation rejection; nothing is merged
    Reject {
        /// Delegation id
        delegation_id: String,
        /// Reason given by the decider
        reason: Option<String>,
    },
}

impl JournalOp {
    /// Short name used in logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete => "delete",
            Self::Propose { .. } => "propose",
            Self::Reject { .. } => "reject",
        }
    }

    /// Check if the op changes a record rather than a delegation
    #[must_use]
    pub fn is_record_write(&self) -> bool {
        matches!(
            self,
            Self::Create { .. } | Self::Update { .. } | Self::Delete
        )
    }
}

/// What caused a mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Origin {
    /// Caller write
    Direct,
    /// Approved delegation with this id
    Delegation(String),
}

/// One journaled mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonic sequence number, starting at 1
    pub seq: u64,
    /// Mutated record
    pub key: EntityKey,
    /// Mutation
    pub op: JournalOp,
    /// Cause of the mutation
    pub origin: Origin,
    /// Who made the change
    pub actor: Actor,
    /// When the entry was appended
    pub created_at: DateTime<Utc>,
    /// Remote propagation state
    pub sync_state: SyncState,
    /// Push attempts so far
    pub attempts: u32,
    /// Error of the last failed push
    pub last_error: Option<String>,
    /// Earliest time of the next retry
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Hash of the previous entry
    pub prev_hash: String,
    /// SHA-256 over this entry's immutable fields and `prev_hash`
    pub hash: String,
}

/// Immutable part of an entry, as hashed
#[derive(Serialize)]
struct Chained<'a> {
    seq: u64,
    key: &'a EntityKey,
    op: &'a JournalOp,
    origin: &'a Origin,
    actor: &'a Actor,
    created_at: &'a DateTime<Utc>,
    prev_hash: &'a str,
}

impl JournalEntry {
    /// Build a PENDING entry linked to `prev_hash`
    ///
    /// # Errors
    /// Returns the serializer error if the op cannot be encoded.
    pub fn new(
        seq: u64,
        key: EntityKey,
        op: JournalOp,
        origin: Origin,
        stamp: Stamp,
        prev_hash: String,
    ) -> serde_json::Result<Self> {
        let mut entry = Self {
            seq,
            key,
            op,
            origin,
            actor: stamp.actor,
            created_at: stamp.at,
            sync_state: SyncState::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            prev_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash()?;
        Ok(entry)
    }

    /// Recompute the chain hash from the immutable fields
    ///
    /// # Errors
    /// Returns the serializer error if the entry cannot be encoded.
    pub fn compute_hash(&self) -> serde_json::Result<String> {
        let bytes = serde_json::to_vec(&Chained {
            seq: self.seq,
            key: &self.key,
            op: &self.op,
            origin: &self.origin,
            actor: &self.actor,
            created_at: &self.created_at,
            prev_hash: &self.prev_hash,
        })?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Actor and time of the original write
    #[must_use]
    pub fn stamp(&self) -> Stamp {
        Stamp {
            actor: self.actor.clone(),
            at: self.created_at,
        }
    }

    /// Check if the remote confirmed this entry
    #[inline]
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.sync_state == SyncState::Synced
    }

    /// Check if the entry may be pushed at `now`
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_synced() && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    pub(crate) fn apply_status(&mut self, status: &StatusUpdate) {
        self.sync_state = status.sync_state;
        self.attempts = status.attempts;
        self.last_error.clone_from(&status.last_error);
        self.next_attempt_at = status.next_attempt_at;
    }

    pub(crate) fn status(&self) -> StatusUpdate {
        StatusUpdate {
            seq: self.seq,
            sync_state: self.sync_state,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            next_attempt_at: self.next_attempt_at,
        }
    }
}

/// Sync-state change of an existing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StatusUpdate {
    pub(crate) seq: u64,
    pub(crate) sync_state: SyncState,
    pub(crate) attempts: u32,
    pub(crate) last_error: Option<String>,
    pub(crate) next_attempt_at: Option<DateTime<Utc>>,
}

/// One line of the journal file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "line", rename_all = "snake_case")]
pub(crate) enum JournalLine {
    Entry(JournalEntry),
    Status(StatusUpdate),
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::ContextLevel;

    fn entry(seq: u64, prev: &str) -> JournalEntry {
        JournalEntry::new(
            seq,
            EntityKey::new(ContextLevel::Project, "p1"),
            JournalOp::Update {
                patch: Document::new(),
            },
            Origin::Direct,
            Stamp::now(Actor::new("tester")),
            prev.to_string(),
        )
        .unwrap()
    }

    #[test]
    fn hash_covers_prev_hash() {
        let a = entry(1, GENESIS_HASH);
        let mut b = a.clone();
        b.prev_hash = "ff".repeat(32);
        assert_ne!(a.hash, b.compute_hash().unwrap());
    }

    #[test]
    fn hash_ignores_sync_state() {
        let mut e = entry(1, GENESIS_HASH);
        e.sync_state = SyncState::Failed;
        e.attempts = 3;
        assert_eq!(e.hash, e.compute_hash().unwrap());
    }

    #[test]
    fn due_respects_backoff() {
        let mut e = entry(1, GENESIS_HASH);
        let now = Utc::now();
        assert!(e.is_due(now));

        let backoff = chrono::Duration::from_std(std::time::Duration::from_secs(10))
            .unwrap();
        e.next_attempt_at = Some(now + backoff);
        assert!(!e.is_due(now));

        e.sync_state = SyncState::Synced;
        e.next_attempt_at = None;
        assert!(!e.is_due(now));
    }

    #[test]
    fn line_roundtrip_keeps_hash_valid() {
        let e = entry(1, GENESIS_HASH);
        let text = serde_json::to_string(&JournalLine::Entry(e.clone()))
            .unwrap();
        assert!(text.contains("\"line\":\"entry\""));

        let JournalLine::Entry(back) = serde_json::from_str(&text).unwrap() else {
            panic!("expected entry line");
        };
        assert_eq!(back, e);
        assert_eq!(back.compute_hash().unwrap(), e.hash);
    }

    #[test]
    fn delegation_ops_are_tagged_and_not_record_writes() {
        let op = JournalOp::Propose {
            delegation_id: "01J0000000000000000000000".into(),
            source: EntityKey::new(ContextLevel::Task, "t1"),
            pattern_data: Document::new(),
        };
        let text = serde_json::to_string(&op).unwrap();

        assert!(text.contains("\"kind\":\"propose\""), "{text}");
        assert!(!op.is_record_write());
        assert!(JournalOp::Delete.is_record_write());
        assert_eq!(
            JournalOp::Reject {
                delegation_id: "x".into(),
                reason: None
            }
            .name(),
            "reject"
        );
    }

    #[test]
    fn state_serializes_upper_case() {
        assert_eq!(
            serde_json::to_string(&SyncState::Failed).unwrap(),
            "\"FAILED\""
        );
    }
}
