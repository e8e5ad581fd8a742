//! Remote sync endpoint

use crate::entry::{JournalEntry, JournalOp, Origin};
use crate::error::RemoteError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strata_core::{Actor, EntityKey};

/// Change sent to the remote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePush {
    /// Journal sequence number, usable as an idempotency key
    pub seq: u64,
    /// Mutated record
    pub key: EntityKey,
    /// Raw mutation
    pub op: JournalOp,
    /// Cause of the mutation
    pub origin: Origin,
    /// Who made the change
    pub actor: Actor,
}

impl From<&JournalEntry> for RemotePush {
    fn from(entry: &JournalEntry) -> Self {
        Self {
            seq: entry.seq,
            key: entry.key.clone(),
            op: entry.op.clone(),
            origin: entry.origin.clone(),
            actor: entry.actor.clone(),
        }
    }
}

/// Remote confirmation of a push
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAck {
    /// Identifier assigned by the remote, if any
    pub remote_ref: Option<String>,
}

/// Remote endpoint that journal entries are propagated to
///
/// Implementations must tolerate the same `seq` being pushed more than once.
#[async_trait]
pub trait RemoteSync: Send + Sync {
    /// Push one change
    async fn push(&self, change: &RemotePush) -> Result<RemoteAck, RemoteError>;

    /// Name used in logs
    fn name(&self) -> &str {
        "remote"
    }
}

/// Endpoint that acknowledges everything without leaving the process
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalOnly;

#[async_trait]
impl RemoteSync for LocalOnly {
    async fn push(&self, _change: &RemotePush) -> Result<RemoteAck, RemoteError> {
        Ok(RemoteAck::default())
    }

    fn name(&self) -> &str {
        "local-only"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{ContextLevel, Document, Stamp};

    #[tokio::test]
    async fn local_only_acks() {
        let entry = JournalEntry::new(
            1,
            EntityKey::new(ContextLevel::Task, "t1"),
            JournalOp::Update {
                patch: Document::new(),
            },
            Origin::Delegation("01J0".into()),
            Stamp::now(Actor::new("tester")),
            crate::entry::GENESIS_HASH.to_string(),
        )
        .unwrap();

        let push = RemotePush::from(&entry);
        assert_eq!(push.seq, 1);
        assert_eq!(push.origin, Origin::Delegation("01J0".into()));
        assert!(LocalOnly.push(&push).await.is_ok());
        assert_eq!(LocalOnly.name(), "local-only");
    }
}
