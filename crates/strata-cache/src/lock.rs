//! Per-key async locks
//!
//! Every read that may resolve and every write on a key runs under that
//! key's lock. When several locks are needed they are taken in ascending
//! [`EntityKey`] order (less specific levels first), which rules out
//! lock-order cycles between writers and invalidations.

use dashmap::DashMap;
use std::sync::Arc;
use strata_core::EntityKey;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Registry = DashMap<EntityKey, Arc<Mutex<()>>>;

/// Proof that the lock for `key` is held
///
/// Dropping the last guard of a key nobody waits on removes the key from
/// the registry.
#[derive(Debug)]
pub struct KeyGuard {
    key: EntityKey,
    guard: Option<OwnedMutexGuard<()>>,
    registry: Arc<Registry>,
}

impl KeyGuard {
    /// Key this guard locks
    #[inline]
    #[must_use]
    pub fn key(&self) -> &EntityKey {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters and holders own a clone, so a count of one means idle.
        // `lock` clones under the same shard lock, so this cannot race it.
        self.registry
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Registry of per-key mutexes
///
/// Only keys that are held or waited on have an entry.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Arc<Registry>,
}

impl KeyLocks {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock of one key
    pub async fn lock(&self, key: &EntityKey) -> KeyGuard {
        let mutex = self.locks.entry(key.clone()).or_default().value().clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            key: key.clone(),
            guard: Some(guard),
            registry: Arc::clone(&self.locks),
        }
    }

    /// Take the locks of several keys in ascending key order
    ///
    /// Duplicates are locked once. The caller must not already hold any of
    /// these keys, nor any key ordered after the smallest of them.
    pub async fn lock_all(&self, keys: impl IntoIterator<Item = EntityKey>) -> Vec<KeyGuard> {
        let mut keys: Vec<EntityKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.lock(key).await);
        }
        guards
    }

    /// Number of keys currently held or waited on
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Check if no key is held or waited on
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use strata_core::ContextLevel;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyLocks::new());
        let key = EntityKey::global("g1");

        let guard = locks.lock(&key).await;

        let contender = {
            let locks = Arc::clone(&locks);
            let key = key.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&key).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _a = locks.lock(&EntityKey::global("a")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(&EntityKey::global("b")),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn lock_all_sorts_and_dedups() {
        let locks = KeyLocks::new();
        let guards = locks
            .lock_all(vec![
                EntityKey::new(ContextLevel::Task, "t"),
                EntityKey::global("g"),
                EntityKey::new(ContextLevel::Task, "t"),
            ])
            .await;

        let keys: Vec<&EntityKey> = guards.iter().map(KeyGuard::key).collect();
        assert_eq!(
            keys,
            vec![
                &EntityKey::global("g"),
                &EntityKey::new(ContextLevel::Task, "t")
            ]
        );
    }

    #[tokio::test]
    async fn released_keys_leave_the_registry() {
        let locks = KeyLocks::new();
        let held = locks.lock(&EntityKey::global("held")).await;
        for n in 0..1_000 {
            drop(locks.lock(&EntityKey::global(format!("free-{n}"))).await);
        }

        assert_eq!(locks.len(), 1);
        drop(held);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn waiter_keeps_entry_alive() {
        let locks = Arc::new(KeyLocks::new());
        let key = EntityKey::global("g1");
        let guard = locks.lock(&key).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            let key = key.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&key).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The waiter must get the same mutex, not a fresh one.
        drop(guard);
        assert_eq!(locks.len(), 1);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
