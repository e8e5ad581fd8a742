//! Testing utilities for the Strata workspace
//!
//! Shared fixtures and scripted remote endpoints.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use strata_core::{document_from_value, Actor, ContextLevel, Document, EntityKey, SyncConfig};
use strata_sync::{RemoteAck, RemoteError, RemotePush, RemoteSync};

/// JSON object literal to [`Document`]; panics on non-objects
pub fn doc(value: serde_json::Value) -> Document {
    document_from_value(value).expect("fixture documents must be JSON objects")
}

pub fn actor(name: &str) -> Actor {
    Actor::new(name)
}

pub fn key(level: ContextLevel, id: &str) -> EntityKey {
    EntityKey::new(level, id)
}

pub fn global(id: &str) -> EntityKey {
    EntityKey::global(id)
}

pub fn project(id: &str) -> EntityKey {
    key(ContextLevel::Project, id)
}

pub fn branch(id: &str) -> EntityKey {
    key(ContextLevel::Branch, id)
}

pub fn task(id: &str) -> EntityKey {
    key(ContextLevel::Task, id)
}

/// Sync settings for tests: no eager push, short timeouts, long backoff
///
/// With the long backoff, only `sync_now` retries within a test.
pub fn manual_sync() -> SyncConfig {
    SyncConfig {
        eager: false,
        push_timeout_ms: 200,
        sweep_interval_ms: 20,
        base_backoff_ms: 60_000,
        max_backoff_ms: 60_000,
        max_attempts: 3,
    }
}

/// Remote that fails a configurable number of pushes, then records them
#[derive(Debug, Default)]
pub struct ScriptedRemote {
    failures_left: AtomicUsize,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    pushed: Mutex<Vec<RemotePush>>,
}

impl ScriptedRemote {
    /// Accepts every push
    pub fn healthy() -> Self {
        Self::default()
    }

    /// Fails the next `failures` pushes
    pub fn failing(failures: usize) -> Self {
        let remote = Self::default();
        remote.fail_next(failures);
        remote
    }

    /// Fails every push until [`Self::fail_next`] resets it
    pub fn offline() -> Self {
        Self::failing(usize::MAX)
    }

    /// Answer only after `delay`
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    pub fn fail_next(&self, failures: usize) {
        self.failures_left.store(failures, Ordering::SeqCst);
    }

    /// Push attempts, successful or not
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Accepted pushes, in arrival order
    pub fn pushed(&self) -> Vec<RemotePush> {
        self.pushed.lock().clone()
    }

    pub fn pushed_seqs(&self) -> Vec<u64> {
        self.pushed.lock().iter().map(|p| p.seq).collect()
    }
}

#[async_trait]
impl RemoteSync for ScriptedRemote {
    async fn push(&self, change: &RemotePush) -> Result<RemoteAck, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok();
        if failing {
            return Err(RemoteError::Unavailable("scripted outage".into()));
        }

        self.pushed.lock().push(change.clone());
        Ok(RemoteAck {
            remote_ref: Some(format!("remote-{}", change.seq)),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
