//! Strata Sync
//!
//! Durable write journal and best-effort remote propagation.
//!
//! # Write protocol
//!
//! ```text
//! caller write ──► Journal::append (PENDING, fsynced)
//!                      │
//!                      ├──► store mutation + cache invalidation (caller side)
//!                      │
//!                      └──► SyncEngine::spawn_push ──► RemoteSync::push
//!                                 │ ok                      │ err / timeout
//!                                 ▼                         ▼
//!                              SYNCED            FAILED, next_attempt_at = now + backoff
//!                                                           │
//!                                  SyncWorker sweep ◄───────┘
//! ```
//!
//! The journal is never truncated. Synced entries stay in place and the
//! whole file is replayed on startup to rebuild the store.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod engine;
pub mod entry;
pub mod error;
pub mod journal;
pub mod remote;

// Re-exports
pub use engine::{PushOutcome, SweepReport, SyncEngine, SyncHealth, SyncWarning, SyncWorker};
pub use entry::{JournalEntry, JournalOp, Origin, SyncState, GENESIS_HASH};
pub use error::{RemoteError, SyncError, SyncResult};
pub use journal::{Journal, JournalCounts, JOURNAL_FILE};
pub use remote::{LocalOnly, RemoteAck, RemotePush, RemoteSync};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
