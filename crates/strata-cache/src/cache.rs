//! Resolution cache using moka
//!
//! Memoizes [`ResolvedContext`] values by [`EntityKey`] and tracks, for each
//! key, which cached resolutions consulted it. Invalidating a key removes
//! its own entry and every entry that inherited from it.
//!
//! # Consistency
//!
//! A miss resolves and inserts while holding the key's lock. Invalidation
//! holds the written key's lock and the locks of all dependents while
//! removing them, so readers never see a half-invalidated hierarchy.
//!
//! A resolution that started before an invalidation could still register
//! itself after the invalidation collected its dependents. To close that
//! window every invalidation stamps the written key with a tick of a
//! monotonic clock, and a miss only inserts its result if none of its
//! dependencies was stamped after it started. The skipped result is still
//! returned; the next read resolves again. Writes elsewhere in the
//! hierarchy never block caching.
//!
//! # Bounded bookkeeping
//!
//! Every cached value carries a generation. Whenever moka drops a value,
//! for whatever cause, the listener unregisters that generation from the
//! reverse index, so the index only describes live entries.

use crate::lock::{KeyGuard, KeyLocks};
use dashmap::DashMap;
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_core::{EntityKey, ResolvedContext};

/// Consulted key -> (cached key -> generation of its cached value)
type DependentsIndex = DashMap<EntityKey, HashMap<EntityKey, u64>>;

/// Statistics for cache performance monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries in cache
    pub entry_count: u64,
    /// Lookups answered from cache
    pub hits: u64,
    /// Lookups that had to resolve
    pub misses: u64,
    /// Entries removed by dependency invalidation
    pub invalidated: u64,
    /// Entries removed by LRU pressure
    pub evicted: u64,
}

#[derive(Debug, Clone)]
struct CachedResolution {
    generation: u64,
    resolved: Arc<ResolvedContext>,
}

/// Dependency-tracked cache of resolved contexts
#[derive(Debug)]
pub struct ResolutionCache {
    entries: Cache<EntityKey, CachedResolution>,
    dependents: Arc<DependentsIndex>,
    locks: KeyLocks,

    /// Ticks once per invalidation
    clock: AtomicU64,
    /// Tick of the latest invalidation of each key, kept while misses run
    epochs: DashMap<EntityKey, u64>,
    resolving: AtomicU64,
    next_generation: AtomicU64,

    hits: AtomicU64,
    misses: AtomicU64,
    invalidated: AtomicU64,
    evicted: Arc<AtomicU64>,
}

impl ResolutionCache {
    /// Create cache holding at most `max_capacity` resolutions
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        let evicted = Arc::new(AtomicU64::new(0));
        let dependents = Arc::new(DependentsIndex::new());

        let listener_count = Arc::clone(&evicted);
        let listener_index = Arc::clone(&dependents);
        let entries = Cache::builder()
            .max_capacity(max_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |key: Arc<EntityKey>, value: CachedResolution, cause| {
                if matches!(cause, RemovalCause::Size) {
                    listener_count.fetch_add(1, Ordering::Relaxed);
                }
                unregister(
                    &listener_index,
                    &key,
                    value.generation,
                    value.resolved.dependency_set(),
                );
            })
            .build();

        Self {
            entries,
            dependents,
            locks: KeyLocks::new(),
            clock: AtomicU64::new(0),
            epochs: DashMap::new(),
            resolving: AtomicU64::new(0),
            next_generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidated: AtomicU64::new(0),
            evicted,
        }
    }

    /// Per-key locks shared with writers
    #[inline]
    #[must_use]
    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    /// Take the lock of `key`
    pub async fn lock(&self, key: &EntityKey) -> KeyGuard {
        self.locks.lock(key).await
    }

    /// Return the cached resolution of `key`, or resolve and cache it
    ///
    /// `force_refresh` always calls `resolve` and replaces the entry.
    ///
    /// # Errors
    /// Propagates the error of `resolve`; nothing is cached in that case.
    pub async fn get_or_resolve<E, F>(
        &self,
        key: &EntityKey,
        force_refresh: bool,
        resolve: F,
    ) -> Result<Arc<ResolvedContext>, E>
    where
        F: FnOnce() -> Result<ResolvedContext, E>,
    {
        let guard = self.locks.lock(key).await;
        self.get_or_resolve_locked(&guard, force_refresh, resolve)
            .await
    }

    /// Same as [`Self::get_or_resolve`] for a caller already holding the key's lock
    ///
    /// # Errors
    /// Propagates the error of `resolve`.
    pub async fn get_or_resolve_locked<E, F>(
        &self,
        guard: &KeyGuard,
        force_refresh: bool,
        resolve: F,
    ) -> Result<Arc<ResolvedContext>, E>
    where
        F: FnOnce() -> Result<ResolvedContext, E>,
    {
        let key = guard.key();

        if !force_refresh {
            if let Some(hit) = self.entries.get(key).await {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "resolution cache hit");
                return Ok(hit.resolved);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let _resolving = Resolving::enter(&self.resolving);
        let started = self.clock.load(Ordering::SeqCst);
        let resolved = Arc::new(resolve()?);
        self.admit(key, started, &resolved).await;
        Ok(resolved)
    }

    async fn admit(&self, key: &EntityKey, started: u64, resolved: &Arc<ResolvedContext>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let dependencies = resolved.dependency_set();
        for dependency in &dependencies {
            self.dependents
                .entry(dependency.clone())
                .or_default()
                .insert(key.clone(), generation);
        }

        let stale = dependencies.iter().any(|dependency| {
            self.epochs
                .get(dependency)
                .is_some_and(|epoch| *epoch > started)
        });

        if stale {
            unregister(&self.dependents, key, generation, dependencies);
            self.entries.invalidate(key).await;
            tracing::debug!(key = %key, "resolution raced an invalidation, not cached");
        } else {
            let value = CachedResolution {
                generation,
                resolved: Arc::clone(resolved),
            };
            self.entries.insert(key.clone(), value).await;
            tracing::debug!(key = %key, generation, "resolution cached");
        }
    }

    /// Remove the entry of `key` and every entry that depends on it
    ///
    /// Returns the number of keys invalidated.
    pub async fn invalidate(&self, key: &EntityKey) -> usize {
        let guard = self.locks.lock(key).await;
        self.invalidate_locked(&guard).await
    }

    /// Same as [`Self::invalidate`] for a caller already holding the key's lock
    pub async fn invalidate_locked(&self, guard: &KeyGuard) -> usize {
        let key = guard.key();
        let epoch = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.epochs.insert(key.clone(), epoch);

        let dependents: Vec<EntityKey> = self
            .dependents
            .remove(key)
            .map(|(_, map)| map.into_keys().filter(|k| k != key).collect())
            .unwrap_or_default();

        // Dependents inherited from `key`, so they all order after it.
        let _dependent_guards = self.locks.lock_all(dependents.iter().cloned()).await;

        self.entries.invalidate(key).await;
        for dependent in &dependents {
            self.entries.invalidate(dependent).await;
        }

        // A miss that starts from here on reads a clock at or past `epoch`.
        if self.resolving.load(Ordering::SeqCst) == 0 {
            self.epochs.remove_if(key, |_, tick| *tick == epoch);
        }

        let count = dependents.len() + 1;
        self.invalidated.fetch_add(count as u64, Ordering::Relaxed);
        tracing::debug!(
            key = %key,
            dependents = dependents.len(),
            "resolution cache invalidated"
        );
        count
    }

    /// Drop every cached resolution
    pub fn invalidate_all(&self) {
        self.clock.fetch_add(1, Ordering::SeqCst);
        self.entries.invalidate_all();
        self.dependents.clear();
        self.epochs.clear();
    }

    /// Check if a resolution of `key` is cached
    #[inline]
    #[must_use]
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Cached keys that depend on `key`, sorted
    #[must_use]
    pub fn dependents_of(&self, key: &EntityKey) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self
            .dependents
            .get(key)
            .map(|map| map.keys().filter(|k| *k != key).cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Number of keys with at least one registered dependent
    #[inline]
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.dependents.len()
    }

    /// Get cache statistics
    ///
    /// Flushes moka's pending maintenance first so counts are exact.
    pub async fn stats(&self) -> CacheStats {
        self.entries.run_pending_tasks().await;
        CacheStats {
            entry_count: self.entries.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

impl Default for ResolutionCache {
    /// Create cache with default capacity (10,000 entries)
    fn default() -> Self {
        Self::new(10_000)
    }
}

/// Remove `key` from the dependents of each dependency, if still at `generation`
fn unregister(
    index: &DependentsIndex,
    key: &EntityKey,
    generation: u64,
    dependencies: impl IntoIterator<Item = EntityKey>,
) {
    for dependency in dependencies {
        let emptied = match index.get_mut(&dependency) {
            Some(mut dependents) => {
                if dependents.get(key) == Some(&generation) {
                    dependents.remove(key);
                }
                dependents.is_empty()
            }
            None => false,
        };
        if emptied {
            index
                .remove_if(&dependency, |_, dependents| dependents.is_empty());
        }
    }
}

/// Counts a running miss for as long as it lives
struct Resolving<'a>(&'a AtomicU64);

impl<'a> Resolving<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Resolving<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
