//! Integration tests for journal durability across restarts.
//!
//! A process writes entries, fails to push some of them, and exits. A new
//! process opens the same journal and must pick up exactly where the old one
//! stopped: same sequence numbers, same sync states, unbroken hash chain.

use async_trait::async_trait;
use std::sync::Arc;
use strata_core::{Actor, ContextLevel, Document, EntityKey, Stamp, SyncConfig};
use strata_sync::{
    Journal, JournalOp, LocalOnly, Origin, RemoteAck, RemoteError, RemotePush, RemoteSync,
    SyncEngine, SyncState, JOURNAL_FILE,
};
use tempfile::TempDir;

struct Offline;

#[async_trait]
impl RemoteSync for Offline {
    async fn push(&self, _change: &RemotePush) -> Result<RemoteAck, RemoteError> {
        Err(RemoteError::Unavailable("network down".into()))
    }
}

fn config() -> SyncConfig {
    SyncConfig {
        eager: false,
        push_timeout_ms: 100,
        ..SyncConfig::default()
    }
}

fn write(journal: &Journal, id: &str, op: JournalOp) -> u64 {
    journal
        .append(
            EntityKey::new(ContextLevel::Branch, id),
            op,
            Origin::Direct,
            Stamp::now(Actor::new("restart-test")),
        )
        .unwrap()
        .seq
}

/// Tenet: entries that failed before a restart are retried after it.
#[tokio::test]
async fn failed_entries_resume_after_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(JOURNAL_FILE);

    {
        let journal = Arc::new(Journal::open(&path).unwrap());
        let engine = SyncEngine::new(Arc::clone(&journal), Arc::new(Offline), config());
        write(
            &journal,
            "br1",
            JournalOp::Create {
                parent_ref: Some("p1".into()),
                data: Document::new(),
            },
        );
        write(&journal, "br1", JournalOp::Delete);

        let report = engine.sweep(true).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
    }

    let journal = Arc::new(Journal::open(&path).unwrap());
    let entries = journal.entries();
    assert_eq!(entries[0].sync_state, SyncState::Failed);
    assert_eq!(entries[0].attempts, 1);
    assert_eq!(entries[1].sync_state, SyncState::Pending);

    let engine = SyncEngine::new(Arc::clone(&journal), Arc::new(LocalOnly), config());
    let report = engine.sweep(true).await.unwrap();

    assert_eq!(report.synced, 2);
    assert!(engine.health().is_fully_synced());
    journal.verify().unwrap();
}

/// Tenet: synced entries are kept, so the journal is a complete history.
#[tokio::test]
async fn synced_entries_are_never_removed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(JOURNAL_FILE);

    {
        let journal = Arc::new(Journal::open(&path).unwrap());
        let engine = SyncEngine::new(Arc::clone(&journal), Arc::new(LocalOnly), config());
        for id in ["a", "b", "c"] {
            let seq = write(
                &journal,
                id,
                JournalOp::Update {
                    patch: Document::new(),
                },
            );
            engine.push_entry(seq).await.unwrap();
        }
    }

    let journal = Journal::open(&path).unwrap();
    assert_eq!(journal.len(), 3);
    assert_eq!(journal.counts().synced, 3);
    assert_eq!(journal.last_seq(), 3);
}

/// Tenet: a write cut short by a crash does not lock out the journal.
#[tokio::test]
async fn torn_final_line_is_dropped_on_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(JOURNAL_FILE);

    {
        let journal = Journal::open(&path).unwrap();
        write(
            &journal,
            "br1",
            JournalOp::Update {
                patch: Document::new(),
            },
        );
    }
    let mut text = std::fs::read_to_string(&path).unwrap();
    let intact = text.len();
    text.push_str(r#"{"line":"entry","seq":2,"ke"#);
    std::fs::write(&path, text).unwrap();

    let journal = Arc::new(Journal::open(&path).unwrap());
    assert_eq!(journal.len(), 1);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), intact as u64);

    let seq = write(&journal, "br1", JournalOp::Delete);
    assert_eq!(seq, 2);
    drop(journal);

    let journal = Journal::open(&path).unwrap();
    assert_eq!(journal.len(), 2);
    journal.verify().unwrap();
}
