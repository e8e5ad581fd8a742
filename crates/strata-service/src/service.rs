//! Context service
//!
//! [`ContextService`] is the caller-facing API. It owns one instance of each
//! component and runs every mutation through the same protocol:
//!
//! 1. take the per-key locks the mutation needs (ascending key order)
//! 2. validate against the store
//! 3. append a PENDING journal entry
//! 4. apply the entry to the store
//! 5. invalidate dependent cache entries
//! 6. schedule a remote push off the caller's path
//!
//! Validation happens under the same locks that every conflicting mutation
//! takes, so an entry that reached the journal always applies cleanly, both
//! now and when the journal is replayed on the next start.
//!
//! Delegation proposals and rejections are journaled too, keyed by the
//! target record. An approval is the journaled update it applies, tagged
//! with the delegation id. Replay rebuilds the delegation registry from
//! those entries alongside the store.

use crate::delegation::{Delegation, DelegationId, DelegationManager, DelegationStatus};
use crate::error::{ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use strata_cache::{CacheStats, KeyGuard, ResolutionCache};
use strata_core::{
    Actor, ContextError, ContextLevel, ContextRecord, ContextResult, Document, EntityKey,
    ResolvedContext, ResolvedSource, Stamp, StrataConfig,
};
use strata_store::{ContextStore, PlannedParent, Resolver};
use strata_sync::{
    Journal, JournalEntry, JournalOp, LocalOnly, Origin, RemoteSync, SweepReport, SyncEngine,
    SyncHealth, SyncWorker, JOURNAL_FILE,
};

/// Read options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOptions {
    /// Merge ancestors into the result
    pub include_inherited: bool,
    /// Bypass and replace the cached resolution
    pub force_refresh: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            include_inherited: true,
            force_refresh: false,
        }
    }
}

impl GetOptions {
    /// Only the record's own data
    #[must_use]
    pub fn own_only() -> Self {
        Self {
            include_inherited: false,
            force_refresh: false,
        }
    }

    /// With cache bypass
    #[must_use]
    pub fn with_force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }
}

/// Result of a read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextView {
    /// Record that was read
    pub key: EntityKey,
    /// Effective document
    pub data: Document,
    /// Version of the record itself
    pub version: u64,
    /// Own document of each consulted level, when inheritance was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inherited: Option<BTreeMap<ContextLevel, Document>>,
    /// Consulted records, least specific first
    pub sources: Vec<ResolvedSource>,
}

impl ContextView {
    fn from_resolved(resolved: &ResolvedContext, include_inherited: bool) -> Self {
        Self {
            key: resolved.key.clone(),
            data: resolved.data.clone(),
            version: resolved.version(),
            inherited: include_inherited.then(|| resolved.inherited.clone()),
            sources: resolved.sources.clone(),
        }
    }
}

/// Hierarchical context service
pub struct ContextService {
    config: StrataConfig,
    store: Arc<ContextStore>,
    resolver: Resolver,
    cache: ResolutionCache,
    sync: Arc<SyncEngine>,
    delegations: DelegationManager,
}

impl std::fmt::Debug for ContextService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextService")
            .field("records", &self.store.len())
            .field("journal", &self.sync.journal().path())
            .field("sync", &self.sync)
            .finish_non_exhaustive()
    }
}

impl ContextService {
    /// Open a service, replaying the journal in `config.data_dir` if set
    ///
    /// # Errors
    /// - `ServiceError::Config` if the configuration is invalid
    /// - `ServiceError::Sync` if the journal cannot be opened or its hash chain is broken
    /// - `ServiceError::Replay` if a journal entry does not apply
    pub fn open(config: StrataConfig, remote: Arc<dyn RemoteSync>) -> ServiceResult<Self> {
        config.validate()?;

        let journal = match &config.data_dir {
            Some(dir) => Journal::open(dir.join(JOURNAL_FILE))?,
            None => Journal::in_memory(),
        };
        let journal = Arc::new(journal);

        let store = Arc::new(ContextStore::new(config.store.clone()));
        let delegations = DelegationManager::new();
        for entry in journal.entries() {
            replay_entry(&store, &delegations, &entry).map_err(|source| {
                ServiceError::Replay {
                    seq: entry.seq,
                    source,
                }
            })?;
        }

        let sync = Arc::new(SyncEngine::new(Arc::clone(&journal), remote, config.sync));
        let health = sync.health();
        tracing::info!(
            records = store.len(),
            delegations = delegations.len(),
            journal_entries = journal.len(),
            unsynced = health.counts.pending + health.counts.failed,
            remote = %health.remote,
            "context service opened"
        );

        Ok(Self {
            resolver: Resolver::new(Arc::clone(&store)),
            cache: ResolutionCache::new(config.cache.capacity),
            store,
            sync,
            delegations,
            config,
        })
    }

    /// Open an in-memory service without a remote
    ///
    /// # Errors
    /// - `ServiceError::Config` if the configuration is invalid
    pub fn in_memory(config: StrataConfig) -> ServiceResult<Self> {
        let config = StrataConfig {
            data_dir: None,
            ..config
        };
        Self::open(config, Arc::new(LocalOnly))
    }

    /// Create a record
    ///
    /// With `store.auto_create_parents`, missing ancestors are created first
    /// with empty data, each as its own journal entry.
    ///
    /// # Errors
    /// - `ContextError::AlreadyExists` if the key is taken
    /// - `ContextError::InvalidParent` if the parent link is malformed or missing
    /// - `ServiceError::Sync` if the journal cannot be written
    pub async fn create(
        &self,
        key: EntityKey,
        parent_ref: Option<String>,
        data: Document,
        actor: &Actor,
    ) -> ServiceResult<ContextRecord> {
        let stamp = Stamp::now(actor.clone());
        let (plan, _guards) = self.lock_for_create(&key, parent_ref.as_deref()).await?;
        if self.store.contains(&key) {
            return Err(ContextError::AlreadyExists(key).into());
        }

        let mut seqs = Vec::with_capacity(plan.len() + 1);
        for parent in plan {
            self.store
                .check_create(&parent.key, parent.parent_ref.as_deref())?;
            let op = JournalOp::Create {
                parent_ref: parent.parent_ref,
                data: Document::new(),
            };
            let (entry, _) = self.commit(parent.key, op, Origin::Direct, &stamp)?;
            tracing::info!(key = %entry.key, child = %key, "missing parent created");
            seqs.push(entry.seq);
        }

        self.store.check_create(&key, parent_ref.as_deref())?;
        let op = JournalOp::Create { parent_ref, data };
        let (entry, record) = self.commit(key, op, Origin::Direct, &stamp)?;
        seqs.push(entry.seq);

        for seq in seqs {
            self.schedule_push(seq);
        }

        tracing::info!(key = %entry.key, seq = entry.seq, actor = %actor, "context created");
        Ok(record)
    }

    /// Read a record, merged with its ancestors unless `include_inherited` is off
    ///
    /// Only inherited reads are cached.
    ///
    /// # Errors
    /// - `ContextError::NotFound` if the record or an ancestor is missing
    /// - `ContextError::InheritanceCycle` if the chain is corrupt
    pub async fn get(&self, key: &EntityKey, options: GetOptions) -> ServiceResult<ContextView> {
        if !options.include_inherited {
            let resolved = self.resolver.resolve(key, false)?;
            return Ok(ContextView::from_resolved(&resolved, false));
        }

        let force = options.force_refresh;
        let resolved = self
            .cache
            .get_or_resolve(key, force, || self.resolver.resolve(key, true))
            .await?;
        Ok(ContextView::from_resolved(&resolved, true))
    }

    /// Shallow-merge `patch` into a record
    ///
    /// Concurrent updates of one record are applied one after the other;
    /// the last patch wins on colliding keys.
    ///
    /// # Errors
    /// - `ContextError::NotFound` if the record does not exist
    /// - `ServiceError::Sync` if the journal cannot be written
    pub async fn update(
        &self,
        key: &EntityKey,
        patch: Document,
        actor: &Actor,
    ) -> ServiceResult<ContextRecord> {
        let stamp = Stamp::now(actor.clone());
        let guard = self.cache.lock(key).await;

        let record = self
            .apply_locked(&guard, JournalOp::Update { patch }, Origin::Direct, &stamp)
            .await?;
        tracing::info!(key = %key, version = record.version(), actor = %actor, "context updated");
        Ok(record)
    }

    /// Delete a record that has no children
    ///
    /// # Errors
    /// - `ContextError::NotFound` if the record does not exist
    /// - `ContextError::HasDependents` if children still reference it
    /// - `ServiceError::Sync` if the journal cannot be written
    pub async fn delete(&self, key: &EntityKey, actor: &Actor) -> ServiceResult<ContextRecord> {
        let stamp = Stamp::now(actor.clone());
        let guard = self.cache.lock(key).await;
        self.store.check_delete(key)?;

        let (entry, record) =
            self.commit(key.clone(), JournalOp::Delete, Origin::Direct, &stamp)?;
        self.cache.invalidate_locked(&guard).await;
        self.schedule_push(entry.seq);

        tracing::info!(key = %key, seq = entry.seq, actor = %actor, "context deleted");
        Ok(record)
    }

    /// Propose merging `pattern_data` from `source` into its ancestor at `target_level`
    ///
    /// The proposal is journaled before it is returned.
    ///
    /// # Errors
    /// - `ContextError::InvalidDirection` unless `target_level` is less specific than the source
    /// - `ContextError::NotFound` if the source or an ancestor is missing
    /// - `ServiceError::Sync` if the journal cannot be written
    pub fn propose_delegation(
        &self,
        source: EntityKey,
        target_level: ContextLevel,
        pattern_data: Document,
        actor: &Actor,
    ) -> ServiceResult<Delegation> {
        let stamp = Stamp::now(actor.clone());
        let delegation =
            DelegationManager::prepare(&self.store, source, target_level, pattern_data, &stamp)?;

        let op = JournalOp::Propose {
            delegation_id: delegation.id.to_string(),
            source: delegation.source.clone(),
            pattern_data: delegation.pattern_data.clone(),
        };
        let entry = self
            .sync
            .journal()
            .append(delegation.target.clone(), op, Origin::Direct, stamp)?;
        self.delegations.record(delegation.clone());
        self.schedule_push(entry.seq);
        Ok(delegation)
    }

    /// Approve a pending delegation and merge its pattern into the target
    ///
    /// # Errors
    /// - `ContextError::DelegationNotFound` for an unknown id
    /// - `ContextError::DelegationClosed` if it was already decided
    /// - `ContextError::NotFound` if the target no longer exists
    pub async fn approve(&self, id: DelegationId, actor: &Actor) -> ServiceResult<Delegation> {
        let stamp = Stamp::now(actor.clone());
        let target = self.delegations.get(id)?.target;
        let guard = self.cache.lock(&target).await;

        let delegation = self.delegations.pending(id)?;
        let op = JournalOp::Update {
            patch: delegation.pattern_data,
        };
        let record = self
            .apply_locked(&guard, op, Origin::Delegation(id.to_string()), &stamp)
            .await?;
        let approved = self
            .delegations
            .decide(id, DelegationStatus::Approved, &stamp, None)?;

        tracing::info!(
            id = %id,
            target = %target,
            version = record.version(),
            "delegation applied"
        );
        Ok(approved)
    }

    /// Reject a pending delegation; the target record is left untouched
    ///
    /// # Errors
    /// - `ContextError::DelegationNotFound` for an unknown id
    /// - `ContextError::DelegationClosed` if it was already decided
    /// - `ServiceError::Sync` if the journal cannot be written
    pub async fn reject(
        &self,
        id: DelegationId,
        actor: &Actor,
        reason: Option<String>,
    ) -> ServiceResult<Delegation> {
        let stamp = Stamp::now(actor.clone());
        let target = self.delegations.get(id)?.target;
        let _guard = self.cache.lock(&target).await;

        self.delegations.pending(id)?;
        let op = JournalOp::Reject {
            delegation_id: id.to_string(),
            reason: reason.clone(),
        };
        let origin = Origin::Delegation(id.to_string());
        let entry = self
            .sync
            .journal()
            .append(target, op, origin, stamp.clone())?;
        let rejected = self
            .delegations
            .decide(id, DelegationStatus::Rejected, &stamp, reason)?;
        self.schedule_push(entry.seq);
        Ok(rejected)
    }

    /// Get delegation by id
    ///
    /// # Errors
    /// - `ContextError::DelegationNotFound` for an unknown id
    pub fn delegation(&self, id: DelegationId) -> ServiceResult<Delegation> {
        Ok(self.delegations.get(id)?)
    }

    /// Delegations, optionally filtered by status
    #[must_use]
    pub fn delegations(&self, status: Option<DelegationStatus>) -> Vec<Delegation> {
        self.delegations.list(status)
    }

    /// Wait for eager pushes, then push every unsynced entry ignoring backoff
    ///
    /// # Errors
    /// - `ServiceError::Sync` if sync states cannot be persisted
    pub async fn sync_now(&self) -> ServiceResult<SweepReport> {
        self.sync.settle().await;
        Ok(self.sync.sweep(true).await?)
    }

    /// Remote propagation state and degraded-entry warnings
    #[must_use]
    pub fn sync_health(&self) -> SyncHealth {
        self.sync.health()
    }

    /// Start the periodic retry worker
    #[must_use]
    pub fn start_background_sync(&self) -> SyncWorker {
        self.sync.start_worker()
    }

    /// Cache statistics
    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Number of resolutions performed (cache misses plus own-only reads)
    #[must_use]
    pub fn resolutions(&self) -> u64 {
        self.resolver.resolutions()
    }

    /// Direct children of a record
    #[must_use]
    pub fn children(&self, key: &EntityKey) -> Vec<EntityKey> {
        self.store.children(key)
    }

    /// All records at one level
    #[must_use]
    pub fn keys_at(&self, level: ContextLevel) -> Vec<EntityKey> {
        self.store.keys_at(level)
    }

    /// Write journal
    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        self.sync.journal()
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    /// Update path shared by caller writes and approved delegations
    async fn apply_locked(
        &self,
        guard: &KeyGuard,
        op: JournalOp,
        origin: Origin,
        stamp: &Stamp,
    ) -> ServiceResult<ContextRecord> {
        let key = guard.key();
        self.store.get(key)?;

        let (entry, record) = self.commit(key.clone(), op, origin, stamp)?;
        self.cache.invalidate_locked(guard).await;
        self.schedule_push(entry.seq);
        Ok(record)
    }

    /// Journal and apply one validated mutation
    fn commit(
        &self,
        key: EntityKey,
        op: JournalOp,
        origin: Origin,
        stamp: &Stamp,
    ) -> ServiceResult<(JournalEntry, ContextRecord)> {
        let entry = self.sync.journal().append(key, op, origin, stamp.clone())?;
        let record = apply_entry(&self.store, &entry).map_err(|e| {
            tracing::error!(
                seq = entry.seq,
                key = %entry.key,
                error = %e,
                "journaled mutation did not apply"
            );
            e
        })?;
        Ok((entry, record))
    }

    fn schedule_push(&self, seq: u64) {
        if self.config.sync.eager {
            self.sync.spawn_push(seq);
        }
    }

    /// Lock `key`, its parent and any ancestors that will be created for it
    ///
    /// The plan is recomputed once the locks are held; if it now needs a key
    /// that is not locked, the locks are dropped and taken again.
    async fn lock_for_create(
        &self,
        key: &EntityKey,
        parent_ref: Option<&str>,
    ) -> ContextResult<(Vec<PlannedParent>, Vec<KeyGuard>)> {
        let mut wanted = self.create_lock_set(key, parent_ref)?;
        loop {
            let guards = self.cache.locks().lock_all(wanted.iter().cloned()).await;
            let needed = self.create_lock_set(key, parent_ref)?;
            if needed.is_subset(&wanted) {
                return Ok((self.plan(key, parent_ref)?, guards));
            }
            drop(guards);
            wanted.extend(needed);
        }
    }

    fn plan(
        &self,
        key: &EntityKey,
        parent_ref: Option<&str>,
    ) -> ContextResult<Vec<PlannedParent>> {
        if self.store.config().auto_create_parents {
            self.store.plan_missing_parents(key, parent_ref)
        } else {
            Ok(Vec::new())
        }
    }

    fn create_lock_set(
        &self,
        key: &EntityKey,
        parent_ref: Option<&str>,
    ) -> ContextResult<BTreeSet<EntityKey>> {
        let mut keys = BTreeSet::from([key.clone()]);
        if let Some(parent) = parent_ref.and_then(|id| key.parent_key(id)) {
            keys.insert(parent);
        }
        for planned in self.plan(key, parent_ref)? {
            if let Some(grandparent) = planned
                .parent_ref
                .as_deref()
                .and_then(|id| planned.key.parent_key(id))
            {
                keys.insert(grandparent);
            }
            keys.insert(planned.key);
        }
        Ok(keys)
    }
}

/// Apply one journal entry to the store
///
/// Returns the written record, or the removed one for deletes. Delegation
/// events leave the store alone and return the current target.
fn apply_entry(store: &ContextStore, entry: &JournalEntry) -> ContextResult<ContextRecord> {
    let stamp = entry.stamp();
    match &entry.op {
        JournalOp::Create { parent_ref, data } => {
            store.create(entry.key.clone(), parent_ref.clone(), data.clone(), &stamp)
        }
        JournalOp::Update { patch } => store.update(&entry.key, patch, &stamp),
        JournalOp::Delete => store.delete(&entry.key),
        JournalOp::Propose { .. } | JournalOp::Reject { .. } => store.get(&entry.key),
    }
}

/// Rebuild store and delegation state from one journal entry
fn replay_entry(
    store: &ContextStore,
    delegations: &DelegationManager,
    entry: &JournalEntry,
) -> ContextResult<()> {
    let stamp = entry.stamp();
    match &entry.op {
        JournalOp::Propose {
            delegation_id,
            source,
            pattern_data,
        } => {
            delegations.record(Delegation::pending(
                delegation_id.parse()?,
                source.clone(),
                entry.key.clone(),
                pattern_data.clone(),
                &stamp,
            ));
        }
        JournalOp::Reject {
            delegation_id,
            reason,
        } => {
            let id: DelegationId = delegation_id.parse()?;
            delegations
                .decide(id, DelegationStatus::Rejected, &stamp, reason.clone())?;
        }
        op => {
            apply_entry(store, entry)?;
            if let (JournalOp::Update { .. }, Origin::Delegation(id)) = (op, &entry.origin) {
                let id: DelegationId = id.parse()?;
                // Journals written before proposals were journaled lack the proposal.
                if delegations.get(id).is_ok() {
                    delegations
                        .decide(id, DelegationStatus::Approved, &stamp, None)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use strata_core::document_from_value;

    fn doc(value: serde_json::Value) -> Document {
        document_from_value(value).unwrap()
    }

    fn alice() -> Actor {
        Actor::new("alice")
    }

    fn service() -> ContextService {
        ContextService::in_memory(StrataConfig::default().with_eager_sync(false)).unwrap()
    }

    fn key(level: ContextLevel, id: &str) -> EntityKey {
        EntityKey::new(level, id)
    }

    #[tokio::test]
    async fn own_only_read_skips_cache() {
        let svc = service();
        let g1 = EntityKey::global("g1");
        svc.create(g1, None, doc(json!({"a": 1})), &alice())
            .await
            .unwrap();
        let p1 = key(ContextLevel::Project, "p1");
        svc.create(p1, Some("g1".into()), doc(json!({"b": 2})), &alice())
            .await
            .unwrap();

        let view = svc
            .get(&key(ContextLevel::Project, "p1"), GetOptions::own_only())
            .await
            .unwrap();

        assert_eq!(view.data, doc(json!({"b": 2})));
        assert!(view.inherited.is_none());
        assert_eq!(svc.cache_stats().await.entry_count, 0);
    }

    #[tokio::test]
    async fn create_journals_before_returning() {
        let svc = service();
        svc.create(EntityKey::global("g1"), None, Document::new(), &alice())
            .await
            .unwrap();

        let entries = svc.journal().entries();
        assert_eq!(entries.len(), 1);
        assert!(matches!(
            entries[0].op,
            JournalOp::Create {
                parent_ref: None,
                ..
            }
        ));
        assert_eq!(entries[0].actor, alice());
    }

    #[tokio::test]
    async fn rejected_write_is_not_journaled() {
        let svc = service();
        let p1 = key(ContextLevel::Project, "p1");
        let result = svc
            .create(p1, Some("missing".into()), Document::new(), &alice())
            .await;

        assert!(matches!(
            result,
            Err(ServiceError::Context(ContextError::InvalidParent { .. }))
        ));
        assert!(svc.journal().is_empty());
    }

    #[tokio::test]
    async fn lazy_parents_are_created_and_journaled() {
        let svc = ContextService::in_memory(
            StrataConfig::default()
                .with_eager_sync(false)
                .with_auto_create_parents(true),
        )
        .unwrap();

        let br1 = key(ContextLevel::Branch, "br1");
        svc.create(br1.clone(), Some("p1".into()), Document::new(), &alice())
            .await
            .unwrap();

        let keys: Vec<EntityKey> = svc.journal().entries().into_iter().map(|e| e.key).collect();
        assert_eq!(
            keys,
            vec![
                EntityKey::global("global_singleton"),
                key(ContextLevel::Project, "p1"),
                key(ContextLevel::Branch, "br1"),
            ]
        );

        let view = svc.get(&br1, GetOptions::default()).await.unwrap();
        assert_eq!(view.sources.len(), 3);
    }

    #[tokio::test]
    async fn force_refresh_resolves_again() {
        let svc = service();
        svc.create(EntityKey::global("g1"), None, Document::new(), &alice())
            .await
            .unwrap();
        let g1 = EntityKey::global("g1");

        svc.get(&g1, GetOptions::default()).await.unwrap();
        svc.get(&g1, GetOptions::default()).await.unwrap();
        svc.get(&g1, GetOptions::default().with_force_refresh(true))
            .await
            .unwrap();

        assert_eq!(svc.resolutions(), 2);
    }

    #[tokio::test]
    async fn delegation_events_are_journaled_against_target() {
        let svc = service();
        let g1 = EntityKey::global("g1");
        svc.create(g1.clone(), None, Document::new(), &alice())
            .await
            .unwrap();
        let p1 = key(ContextLevel::Project, "p1");
        svc.create(p1.clone(), Some("g1".into()), Document::new(), &alice())
            .await
            .unwrap();

        let pattern = doc(json!({"lint": "strict"}));
        let d = svc
            .propose_delegation(p1, ContextLevel::Global, pattern, &alice())
            .unwrap();
        svc.reject(d.id, &alice(), Some("later".into()))
            .await
            .unwrap();

        let entries = svc.journal().entries();
        let ops: Vec<&str> = entries.iter().map(|e| e.op.name()).collect();
        assert_eq!(ops, vec!["create", "create", "propose", "reject"]);
        assert_eq!(entries[2].key, g1);
        assert_eq!(entries[3].origin, Origin::Delegation(d.id.to_string()));
        let own = svc.get(&g1, GetOptions::own_only()).await.unwrap();
        assert_eq!(own.version, 1);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let result = ContextService::in_memory(StrataConfig::default().with_cache_capacity(0));
        assert!(matches!(result, Err(ServiceError::Config(_))));
    }
}
