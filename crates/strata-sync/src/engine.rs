//! Remote propagation of journal entries
//!
//! Entries are pushed in two ways:
//!
//! - **Eager**: right after a local write, a spawned task pushes the new
//!   entry, bounded by `push_timeout`.
//! - **Sweep**: a background worker wakes every `sweep_interval` and pushes
//!   every due PENDING or FAILED entry in sequence order. Once an entry for
//!   a key fails or is not yet due, later entries for the same key wait for
//!   the next sweep so the remote sees each key's changes in order.
//!
//! A failed push schedules the next attempt with capped exponential
//! backoff. Entries that failed more than `max_attempts` times are reported
//! as degraded but keep being retried at the maximum backoff.

use crate::error::{SyncError, SyncResult};
use crate::journal::{Journal, JournalCounts};
use crate::remote::{RemotePush, RemoteSync};
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use strata_core::{ContextError, EntityKey, SyncConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Result of one push attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Remote confirmed the entry
    Synced,
    /// Push failed; the entry is FAILED and scheduled for retry
    Failed(String),
    /// Entry was synced, in flight, or queued behind an earlier entry of its key
    Skipped,
}

/// Summary of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries confirmed during this sweep
    pub synced: usize,
    /// Entries that failed again
    pub failed: usize,
    /// Entries left for a later sweep
    pub deferred: usize,
}

impl SweepReport {
    /// Push attempts made
    #[inline]
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.synced + self.failed
    }
}

/// An entry that exhausted its attempt budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncWarning {
    /// Journal sequence number
    pub seq: u64,
    /// Mutated record
    pub key: EntityKey,
    /// Attempts so far
    pub attempts: u32,
    /// Error of the last attempt
    pub last_error: Option<String>,
}

impl SyncWarning {
    /// Same warning as an error value
    #[must_use]
    pub fn to_error(&self) -> ContextError {
        ContextError::SyncDegraded {
            seq: self.seq,
            key: self.key.clone(),
            attempts: self.attempts,
        }
    }
}

/// Snapshot of remote propagation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncHealth {
    /// Name of the remote endpoint
    pub remote: String,
    /// Entry counts by state
    pub counts: JournalCounts,
    /// Degraded entries, in sequence order
    pub warnings: Vec<SyncWarning>,
}

impl SyncHealth {
    /// True if every entry is synced
    #[must_use]
    pub fn is_fully_synced(&self) -> bool {
        self.counts.pending == 0 && self.counts.failed == 0
    }

    /// True if no entry is degraded
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Pushes journal entries to a [`RemoteSync`] endpoint
pub struct SyncEngine {
    journal: Arc<Journal>,
    remote: Arc<dyn RemoteSync>,
    config: SyncConfig,
    eager_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("remote", &self.remote.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Create engine over a journal and remote endpoint
    #[must_use]
    pub fn new(journal: Arc<Journal>, remote: Arc<dyn RemoteSync>, config: SyncConfig) -> Self {
        Self {
            journal,
            remote,
            config,
            eager_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Journal being propagated
    #[inline]
    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// Sync settings
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Push one entry now
    ///
    /// A remote failure or timeout is not an error: it is recorded on the
    /// entry and reported as [`PushOutcome::Failed`].
    ///
    /// # Errors
    /// - `SyncError::UnknownEntry` if `seq` is not in the journal
    /// - `SyncError::Io` if the new sync state cannot be persisted
    pub async fn push_entry(&self, seq: u64) -> SyncResult<PushOutcome> {
        if !self.journal.claim(seq) {
            return Ok(PushOutcome::Skipped);
        }
        let outcome = self.attempt(seq).await;
        self.journal.release(seq);
        outcome
    }

    /// Push `seq` in a spawned task (eager mode)
    ///
    /// If an earlier entry of the same key is still unsynced, `seq` is left
    /// to whichever push settles that entry: a successful push continues
    /// with the key's next never-pushed entry, and the sweep handles the rest.
    pub fn spawn_push(self: &Arc<Self>, seq: u64) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if let Err(e) = engine.push_in_order(seq).await {
                tracing::warn!(seq, error = %e, "eager push could not record its outcome");
            }
        });

        let mut tasks = self.eager_tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Wait for every spawned eager push to finish
    pub async fn settle(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.eager_tasks.lock());
        for result in join_all(tasks).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "eager push task panicked");
            }
        }
    }

    /// Push every due unsynced entry once, in sequence order
    ///
    /// `force` ignores backoff schedules.
    ///
    /// # Errors
    /// Propagates journal errors; remote failures only count as `failed`.
    pub async fn sweep(&self, force: bool) -> SyncResult<SweepReport> {
        let now = Utc::now();
        let mut blocked: HashSet<EntityKey> = HashSet::new();
        let mut report = SweepReport::default();

        for entry in self.journal.unsynced() {
            let waiting = self.journal.is_in_flight(entry.seq) || (!force && !entry.is_due(now));
            if waiting || blocked.contains(&entry.key) {
                blocked.insert(entry.key);
                report.deferred += 1;
                continue;
            }

            match self.push_entry(entry.seq).await? {
                PushOutcome::Synced => report.synced += 1,
                PushOutcome::Failed(_) => {
                    report.failed += 1;
                    blocked.insert(entry.key);
                }
                PushOutcome::Skipped => {
                    report.deferred += 1;
                    blocked.insert(entry.key);
                }
            }
        }

        if report.attempted() > 0 || report.deferred > 0 {
            tracing::debug!(
                synced = report.synced,
                failed = report.failed,
                deferred = report.deferred,
                force,
                "sync sweep finished"
            );
        }
        Ok(report)
    }

    /// Current propagation state
    #[must_use]
    pub fn health(&self) -> SyncHealth {
        let warnings = self
            .journal
            .unsynced()
            .into_iter()
            .filter(|entry| entry.attempts > self.config.max_attempts)
            .map(|entry| SyncWarning {
                seq: entry.seq,
                key: entry.key,
                attempts: entry.attempts,
                last_error: entry.last_error,
            })
            .collect();

        SyncHealth {
            remote: self.remote.name().to_string(),
            counts: self.journal.counts(),
            warnings,
        }
    }

    /// Start the background retry worker
    #[must_use]
    pub fn start_worker(self: &Arc<Self>) -> SyncWorker {
        let (shutdown, mut stop) = watch::channel(false);
        let engine = Arc::clone(self);
        let period = self.config.sweep_interval().max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.sweep(false).await {
                            tracing::warn!(error = %e, "sync sweep failed");
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("sync worker stopped");
        });

        tracing::info!(
            interval_ms = self.config.sweep_interval_ms,
            "sync worker started"
        );
        SyncWorker { shutdown, handle }
    }

    async fn push_in_order(&self, seq: u64) -> SyncResult<()> {
        let mut next = Some(seq);
        while let Some(seq) = next {
            if self.push_entry(seq).await? != PushOutcome::Synced {
                break;
            }
            next = self.journal.next_pending_after(seq);
        }
        Ok(())
    }

    async fn attempt(&self, seq: u64) -> SyncResult<PushOutcome> {
        let entry = self.journal.get(seq).ok_or(SyncError::UnknownEntry(seq))?;
        let change = RemotePush::from(&entry);

        let push = self.remote.push(&change);
        let result = match tokio::time::timeout(self.config.push_timeout(), push).await {
            Ok(Ok(_ack)) => Ok(()),
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::Timeout {
                seq,
                timeout_ms: self.config.push_timeout_ms,
            }),
        };

        match result {
            Ok(()) => {
                self.journal.mark_synced(seq)?;
                tracing::debug!(seq, key = %entry.key, remote = self.remote.name(), "entry synced");
                Ok(PushOutcome::Synced)
            }
            Err(err) => {
                let attempts = entry.attempts.saturating_add(1);
                let delay = chrono::Duration::from_std(self.config.backoff(attempts))
                    .unwrap_or_else(|_| chrono::Duration::zero());
                let message = err.to_string();
                self.journal.mark_failed(seq, &message, Utc::now() + delay)?;

                if attempts > self.config.max_attempts {
                    tracing::warn!(
                        seq,
                        key = %entry.key,
                        attempts,
                        error = %message,
                        "sync degraded"
                    );
                } else {
                    tracing::warn!(
                        seq,
                        key = %entry.key,
                        attempts,
                        error = %message,
                        "push failed, will retry"
                    );
                }
                Ok(PushOutcome::Failed(message))
            }
        }
    }
}

/// Handle of the background retry worker
#[derive(Debug)]
pub struct SyncWorker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    /// Stop the worker and wait for it to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "sync worker panicked");
        }
    }

    /// Check if the worker task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
