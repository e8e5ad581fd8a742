//! Delegation manager
//!
//! A delegation proposes that a pattern captured at a specific level be
//! merged into one of its ancestors. Proposals wait for an explicit decision:
//!
//! ```text
//! PENDING ──approve──► APPROVED
//!    │
//!    └────reject────► REJECTED
//! ```
//!
//! Both decisions are terminal. The service journals every proposal and
//! decision and applies an approved pattern through the journaled update
//! path; this module only tracks the proposals and their lifecycle, and is
//! rebuilt from the journal on start.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strata_core::{Actor, ContextError, ContextLevel, ContextResult, Document, EntityKey, Stamp};
use strata_store::ContextStore;
use ulid::Ulid;

/// Unique delegation identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DelegationId(pub Ulid);

impl DelegationId {
    /// Generate new delegation ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for DelegationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DelegationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DelegationId {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s.trim())
            .map(Self)
            .map_err(|_| ContextError::DelegationNotFound(s.to_string()))
    }
}

/// Lifecycle state of a delegation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelegationStatus {
    /// Waiting for a decision
    Pending,
    /// Pattern was merged into the target
    Approved,
    /// Pattern was discarded
    Rejected,
}

impl DelegationStatus {
    /// States reachable from `self`
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [DelegationStatus] {
        match self {
            Self::Pending => &[Self::Approved, Self::Rejected],
            Self::Approved | Self::Rejected => &[],
        }
    }

    /// Check if no further transition is possible
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Upper-case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a status change of delegation `id`
///
/// # Errors
/// - `ContextError::DelegationClosed` if `to` is not reachable from `from`
pub fn validate_transition(
    id: DelegationId,
    from: DelegationStatus,
    to: DelegationStatus,
) -> ContextResult<()> {
    if from.allowed_transitions().contains(&to) {
        Ok(())
    } else {
        Err(ContextError::DelegationClosed {
            id: id.to_string(),
            status: from.to_string(),
        })
    }
}

/// Proposal to merge a pattern into an ancestor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delegation {
    /// Unique id
    pub id: DelegationId,
    /// Record the pattern was captured at
    pub source: EntityKey,
    /// Ancestor of `source` that receives the pattern
    pub target: EntityKey,
    /// Keys to merge into the target
    pub pattern_data: Document,
    /// Lifecycle state
    pub status: DelegationStatus,
    /// When the proposal was made
    pub created_at: DateTime<Utc>,
    /// Who proposed it
    pub proposed_by: Actor,
    /// Who decided, once decided
    pub decided_by: Option<Actor>,
    /// When it was decided
    pub decided_at: Option<DateTime<Utc>>,
    /// Reason given on rejection
    pub reason: Option<String>,
}

impl Delegation {
    /// Undecided proposal made at `stamp`
    #[must_use]
    pub fn pending(
        id: DelegationId,
        source: EntityKey,
        target: EntityKey,
        pattern_data: Document,
        stamp: &Stamp,
    ) -> Self {
        Self {
            id,
            source,
            target,
            pattern_data,
            status: DelegationStatus::Pending,
            created_at: stamp.at,
            proposed_by: stamp.actor.clone(),
            decided_by: None,
            decided_at: None,
            reason: None,
        }
    }
}

/// Registry of delegations
#[derive(Debug, Default)]
pub struct DelegationManager {
    delegations: DashMap<DelegationId, Delegation>,
}

impl DelegationManager {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a PENDING proposal from `source` to its ancestor at `target_level`
    ///
    /// # Errors
    /// See [`Self::prepare`].
    pub fn propose(
        &self,
        store: &ContextStore,
        source: EntityKey,
        target_level: ContextLevel,
        pattern_data: Document,
        stamp: &Stamp,
    ) -> ContextResult<Delegation> {
        let delegation = Self::prepare(store, source, target_level, pattern_data, stamp)?;
        self.record(delegation.clone());
        Ok(delegation)
    }

    /// Build a PENDING proposal without recording it
    ///
    /// # Errors
    /// - `ContextError::InvalidDirection` unless `target_level` is strictly less specific
    /// - `ContextError::NotFound` if the source or one of its ancestors is missing
    pub fn prepare(
        store: &ContextStore,
        source: EntityKey,
        target_level: ContextLevel,
        pattern_data: Document,
        stamp: &Stamp,
    ) -> ContextResult<Delegation> {
        if !target_level.is_ancestor_of(source.level) {
            return Err(ContextError::InvalidDirection {
                source_level: source.level,
                target_level,
            });
        }

        let target = ancestor_at(store, &source, target_level)?;
        Ok(Delegation::pending(
            DelegationId::new(),
            source,
            target,
            pattern_data,
            stamp,
        ))
    }

    /// Track a delegation, replacing any with the same id
    pub fn record(&self, delegation: Delegation) {
        tracing::info!(
            id = %delegation.id,
            source = %delegation.source,
            target = %delegation.target,
            status = %delegation.status,
            "delegation recorded"
        );
        self.delegations.insert(delegation.id, delegation);
    }

    /// Get delegation by id
    ///
    /// # Errors
    /// - `ContextError::DelegationNotFound` for an unknown id
    pub fn get(&self, id: DelegationId) -> ContextResult<Delegation> {
        self.delegations
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ContextError::DelegationNotFound(id.to_string()))
    }

    /// Get delegation by id if it can still be decided
    ///
    /// # Errors
    /// - `ContextError::DelegationNotFound` for an unknown id
    /// - `ContextError::DelegationClosed` if it was already decided
    pub fn pending(&self, id: DelegationId) -> ContextResult<Delegation> {
        let delegation = self.get(id)?;
        if delegation.status.is_terminal() {
            return Err(ContextError::DelegationClosed {
                id: id.to_string(),
                status: delegation.status.to_string(),
            });
        }
        Ok(delegation)
    }

    /// Move a delegation to a terminal state
    ///
    /// # Errors
    /// - `ContextError::DelegationNotFound` for an unknown id
    /// - `ContextError::DelegationClosed` if the transition is not allowed
    pub fn decide(
        &self,
        id: DelegationId,
        to: DelegationStatus,
        stamp: &Stamp,
        reason: Option<String>,
    ) -> ContextResult<Delegation> {
        let mut entry = self
            .delegations
            .get_mut(&id)
            .ok_or_else(|| ContextError::DelegationNotFound(id.to_string()))?;

        validate_transition(id, entry.status, to)?;
        entry.status = to;
        entry.decided_by = Some(stamp.actor.clone());
        entry.decided_at = Some(stamp.at);
        entry.reason = reason;

        let decided = entry.value().clone();
        drop(entry);

        tracing::info!(id = %id, status = %to, by = %stamp.actor, "delegation decided");
        Ok(decided)
    }

    /// Delegations, optionally filtered by status, oldest first
    #[must_use]
    pub fn list(&self, status: Option<DelegationStatus>) -> Vec<Delegation> {
        let mut all: Vec<Delegation> = self
            .delegations
            .iter()
            .filter(|entry| status.map_or(true, |s| entry.status == s))
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(|d| d.id);
        all
    }

    /// Number of delegations
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.delegations.len()
    }

    /// Check if there are no delegations
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delegations.is_empty()
    }
}

/// Walk up from `source` to its ancestor at `level`
fn ancestor_at(
    store: &ContextStore,
    source: &EntityKey,
    level: ContextLevel,
) -> ContextResult<EntityKey> {
    let mut current = store.get(source)?;
    while current.level() != level {
        let parent = current.parent_key().ok_or_else(|| {
            ContextError::invalid_parent(
                current.key.clone(),
                "chain ends before the target level",
            )
        })?;
        current = store.get(&parent)?;
    }
    Ok(current.key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use ContextLevel::{Branch, Global, Project};

    fn stamp(who: &str) -> Stamp {
        Stamp::now(Actor::new(who))
    }

    fn store() -> ContextStore {
        let store = ContextStore::default();
        let s = stamp("seed");
        let chain = [
            (EntityKey::global("g1"), None),
            (EntityKey::new(ContextLevel::Project, "p1"), Some("g1")),
            (EntityKey::new(ContextLevel::Branch, "br1"), Some("p1")),
            (EntityKey::new(ContextLevel::Task, "t1"), Some("br1")),
        ];
        for (key, parent) in chain {
            store
                .create(key, parent.map(String::from), Document::new(), &s)
                .unwrap();
        }
        store
    }

    fn task() -> EntityKey {
        EntityKey::new(ContextLevel::Task, "t1")
    }

    /// Empty pattern proposed by "dev"
    fn propose(
        manager: &DelegationManager,
        store: &ContextStore,
        source: EntityKey,
        level: ContextLevel,
    ) -> ContextResult<Delegation> {
        manager.propose(store, source, level, Document::new(), &stamp("dev"))
    }

    #[test]
    fn transitions_from_pending_only() {
        use DelegationStatus::*;
        assert_eq!(Pending.allowed_transitions(), &[Approved, Rejected]);
        assert!(Approved.is_terminal());
        assert!(Rejected.is_terminal());

        let id = DelegationId::new();
        assert!(validate_transition(id, Pending, Approved).is_ok());
        assert!(matches!(
            validate_transition(id, Rejected, Approved),
            Err(ContextError::DelegationClosed { .. })
        ));
    }

    #[test]
    fn target_is_ancestor_at_requested_level() {
        let manager = DelegationManager::new();
        let store = store();
        let delegation = propose(&manager, &store, task(), Project).unwrap();

        let p1 = EntityKey::new(ContextLevel::Project, "p1");
        assert_eq!(delegation.target, p1);
        assert_eq!(delegation.status, DelegationStatus::Pending);
        assert_eq!(delegation.proposed_by, Actor::new("dev"));
    }

    #[test]
    fn downward_or_same_level_is_rejected() {
        let manager = DelegationManager::new();
        let store = store();
        let project = EntityKey::new(ContextLevel::Project, "p1");

        for target in [ContextLevel::Task, ContextLevel::Project] {
            let result = propose(&manager, &store, project.clone(), target);
            assert!(matches!(result, Err(ContextError::InvalidDirection { .. })));
        }
        assert!(manager.is_empty());
    }

    #[test]
    fn missing_source_is_not_found() {
        let manager = DelegationManager::new();
        let result = manager.propose(
            &store(),
            EntityKey::new(ContextLevel::Task, "ghost"),
            ContextLevel::Global,
            Document::new(),
            &stamp("dev"),
        );
        assert!(matches!(result, Err(ContextError::NotFound(_))));
    }

    #[test]
    fn decisions_are_final() {
        let manager = DelegationManager::new();
        let store = store();
        let d = propose(&manager, &store, task(), Global).unwrap();

        let reason = Some("too broad".to_string());
        let rejected = manager
            .decide(d.id, DelegationStatus::Rejected, &stamp("lead"), reason)
            .unwrap();
        assert_eq!(rejected.reason.as_deref(), Some("too broad"));
        assert_eq!(rejected.decided_by, Some(Actor::new("lead")));

        assert!(matches!(
            manager.decide(d.id, DelegationStatus::Approved, &stamp("lead"), None),
            Err(ContextError::DelegationClosed { .. })
        ));
        assert!(matches!(
            manager.pending(d.id),
            Err(ContextError::DelegationClosed { .. })
        ));
    }

    #[test]
    fn list_filters_by_status() {
        let manager = DelegationManager::new();
        let store = store();
        let a = propose(&manager, &store, task(), Branch).unwrap();
        let b = propose(&manager, &store, task(), Project).unwrap();
        manager
            .decide(a.id, DelegationStatus::Approved, &stamp("lead"), None)
            .unwrap();

        let pending: Vec<DelegationId> = manager
            .list(Some(DelegationStatus::Pending))
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(pending, vec![b.id]);
        assert_eq!(manager.list(None).len(), 2);
    }

    #[test]
    fn prepared_proposal_is_recorded_only_on_request() {
        let manager = DelegationManager::new();
        let store = store();
        let stamp = stamp("dev");
        let prepared = DelegationManager::prepare(&store, task(), Global, Document::new(), &stamp);
        let prepared = prepared.unwrap();
        assert!(manager.is_empty());
        assert_eq!(prepared.created_at, stamp.at);

        manager.record(prepared.clone());
        assert_eq!(manager.pending(prepared.id).unwrap(), prepared);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let manager = DelegationManager::new();
        assert!(matches!(
            manager.get(DelegationId::new()),
            Err(ContextError::DelegationNotFound(_))
        ));
        assert!(matches!(
            "not-a-ulid".parse::<DelegationId>(),
            Err(ContextError::DelegationNotFound(_))
        ));
    }
}
