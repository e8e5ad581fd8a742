//! Context record store
//!
//! Provides [`ContextStore`], the single owner of [`ContextRecord`] data.
//!
//! Records live in a [`DashMap`] keyed by [`EntityKey`]. A second map indexes
//! children by parent key so deletes can be checked for dependents without a
//! scan. Structural changes (create, delete) are serialized by one mutex so a
//! child can never be attached to a parent that is concurrently deleted;
//! updates only touch their own entry.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use strata_core::{
    ContextError, ContextLevel, ContextRecord, ContextResult, Document, EntityKey, Stamp,
    StoreConfig,
};

/// A parent record that must exist before a child can be created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedParent {
    /// Key of the missing record
    pub key: EntityKey,
    /// Parent link it will be created with
    pub parent_ref: Option<String>,
}

/// In-memory context store
#[derive(Debug)]
pub struct ContextStore {
    /// Records by key
    records: DashMap<EntityKey, ContextRecord>,

    /// Reverse index: parent key -> child keys
    children: DashMap<EntityKey, BTreeSet<EntityKey>>,

    /// Serializes create/delete
    structure: Mutex<()>,

    config: StoreConfig,
}

impl ContextStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            records: DashMap::new(),
            children: DashMap::new(),
            structure: Mutex::new(()),
            config,
        }
    }

    /// Store configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Get record by key
    ///
    /// # Errors
    /// - `ContextError::NotFound` if no record exists
    pub fn get(&self, key: &EntityKey) -> ContextResult<ContextRecord> {
        self.records
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ContextError::NotFound(key.clone()))
    }

    /// Check if record exists
    #[inline]
    #[must_use]
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.records.contains_key(key)
    }

    /// Create a new record
    ///
    /// # Errors
    /// - `ContextError::AlreadyExists` if the key is taken
    /// - `ContextError::InvalidParent` if the parent link is missing, present on
    ///   a global record, or points at a record that does not exist
    pub fn create(
        &self,
        key: EntityKey,
        parent_ref: Option<String>,
        data: Document,
        stamp: &Stamp,
    ) -> ContextResult<ContextRecord> {
        let _structure = self.structure.lock();
        let parent_key = self.check_create(&key, parent_ref.as_deref())?;

        let record = ContextRecord::new(key.clone(), parent_ref, data, stamp);
        self.records.insert(key.clone(), record.clone());

        if let Some(parent_key) = parent_key {
            self.children
                .entry(parent_key)
                .or_default()
                .insert(key.clone());
        }

        tracing::debug!(key = %key, "context record created");
        Ok(record)
    }

    /// Merge `patch` into the record's data (shallow overwrite) and bump its version
    ///
    /// # Errors
    /// - `ContextError::NotFound` if no record exists
    pub fn update(
        &self,
        key: &EntityKey,
        patch: &Document,
        stamp: &Stamp,
    ) -> ContextResult<ContextRecord> {
        let mut entry = self
            .records
            .get_mut(key)
            .ok_or_else(|| ContextError::NotFound(key.clone()))?;

        entry.apply_patch(patch, stamp);
        let updated = entry.value().clone();
        drop(entry);

        tracing::debug!(key = %key, version = updated.version(), "context record updated");
        Ok(updated)
    }

    /// Delete a record that no child references
    ///
    /// Children are never cascade-deleted.
    ///
    /// # Errors
    /// - `ContextError::NotFound` if no record exists
    /// - `ContextError::HasDependents` if child records still reference it
    pub fn delete(&self, key: &EntityKey) -> ContextResult<ContextRecord> {
        let _structure = self.structure.lock();
        self.check_delete(key)?;

        let (_, record) = self
            .records
            .remove(key)
            .ok_or_else(|| ContextError::NotFound(key.clone()))?;

        self.children.remove(key);
        if let Some(parent_key) = record.parent_key() {
            let now_empty = match self.children.get_mut(&parent_key) {
                Some(mut siblings) => {
                    siblings.remove(key);
                    siblings.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.children
                    .remove_if(&parent_key, |_, set| set.is_empty());
            }
        }

        tracing::debug!(key = %key, "context record deleted");
        Ok(record)
    }

    /// Check that `key` could be created under `parent_ref` right now
    ///
    /// Returns the parent key. Callers that journal a create before applying
    /// it use this while holding the locks that keep the answer valid.
    ///
    /// # Errors
    /// Same as [`Self::create`].
    pub fn check_create(
        &self,
        key: &EntityKey,
        parent_ref: Option<&str>,
    ) -> ContextResult<Option<EntityKey>> {
        let parent_key = Self::check_parent_link(key, parent_ref)?;

        if self.records.contains_key(key) {
            return Err(ContextError::AlreadyExists(key.clone()));
        }
        if let Some(parent_key) = &parent_key {
            if !self.records.contains_key(parent_key) {
                return Err(ContextError::invalid_parent(
                    key.clone(),
                    format!("parent {parent_key} does not exist"),
                ));
            }
        }
        Ok(parent_key)
    }

    /// Check that `key` exists and has no children
    ///
    /// # Errors
    /// Same as [`Self::delete`].
    pub fn check_delete(&self, key: &EntityKey) -> ContextResult<()> {
        if !self.records.contains_key(key) {
            return Err(ContextError::NotFound(key.clone()));
        }
        let children = self.children(key);
        if !children.is_empty() {
            return Err(ContextError::HasDependents {
                key: key.clone(),
                children,
            });
        }
        Ok(())
    }

    /// Direct children of a record, in key order
    #[must_use]
    pub fn children(&self, key: &EntityKey) -> Vec<EntityKey> {
        self.children
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All keys at one level, sorted
    #[must_use]
    pub fn keys_at(&self, level: ContextLevel) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self
            .records
            .iter()
            .filter(|entry| entry.key().level == level)
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Missing ancestors that must be created, least specific first,
    /// so that `key` can be attached under `parent_ref`
    ///
    /// A missing project parent of a branch is planned under the configured
    /// default global id.
    ///
    /// # Errors
    /// - `ContextError::InvalidParent` if the link itself is malformed
    pub fn plan_missing_parents(
        &self,
        key: &EntityKey,
        parent_ref: Option<&str>,
    ) -> ContextResult<Vec<PlannedParent>> {
        let mut planned = Vec::new();
        let Some(mut current) = Self::check_parent_link(key, parent_ref)? else {
            return Ok(planned);
        };

        while !self.records.contains_key(&current) {
            let grandparent = current
                .level
                .parent()
                .map(|level| EntityKey::new(level, self.default_parent_id(level)));
            planned.push(PlannedParent {
                key: current.clone(),
                parent_ref: grandparent.as_ref().map(|k| k.id.clone()),
            });
            match grandparent {
                Some(next) => current = next,
                None => break,
            }
        }

        planned.reverse();
        Ok(planned)
    }

    /// Total record count
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if store is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Validate the shape of a parent link and return the parent key
    fn check_parent_link(
        key: &EntityKey,
        parent_ref: Option<&str>,
    ) -> ContextResult<Option<EntityKey>> {
        match (key.level.parent(), parent_ref) {
            (None, None) => Ok(None),
            (None, Some(_)) => Err(ContextError::invalid_parent(
                key.clone(),
                "global records cannot have a parent",
            )),
            (Some(_), None) => Err(ContextError::invalid_parent(
                key.clone(),
                "parent_ref is required below the global level",
            )),
            (Some(_), Some(id)) if id.trim().is_empty() => Err(ContextError::invalid_parent(
                key.clone(),
                "parent_ref is empty",
            )),
            (Some(level), Some(id)) => Ok(Some(EntityKey::new(level, id))),
        }
    }

    fn default_parent_id(&self, level: ContextLevel) -> String {
        match level {
            ContextLevel::Global => self.config.default_global_id.clone(),
            other => format!("default_{other}"),
        }
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_core::{document_from_value, Actor};

    fn stamp() -> Stamp {
        Stamp::now(Actor::new("tester"))
    }

    fn doc(value: serde_json::Value) -> Document {
        document_from_value(value).unwrap()
    }

    fn key(level: ContextLevel, id: &str) -> EntityKey {
        EntityKey::new(level, id)
    }

    fn seeded() -> ContextStore {
        let store = ContextStore::default();
        let g1 = key(ContextLevel::Global, "g1");
        store
            .create(g1, None, doc(json!({"a": 1})), &stamp())
            .unwrap();
        store
            .create(
                key(ContextLevel::Project, "p1"),
                Some("g1".into()),
                doc(json!({"b": 2})),
                &stamp(),
            )
            .unwrap();
        store
    }

    #[test]
    fn create_and_get() {
        let store = seeded();
        let record = store.get(&key(ContextLevel::Project, "p1")).unwrap();

        assert_eq!(record.parent_ref.as_deref(), Some("g1"));
        assert_eq!(record.version(), 1);
        assert_eq!(record.data, doc(json!({"b": 2})));
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = ContextStore::default();
        let result = store.get(&key(ContextLevel::Task, "nope"));
        assert!(matches!(result, Err(ContextError::NotFound(_))));
    }

    #[test]
    fn create_rejects_duplicate() {
        let store = seeded();
        let g1 = key(ContextLevel::Global, "g1");
        let result = store.create(g1, None, Document::new(), &stamp());
        assert!(matches!(result, Err(ContextError::AlreadyExists(_))));
    }

    #[test]
    fn create_requires_parent_below_global() {
        let store = seeded();
        let p2 = key(ContextLevel::Project, "p2");
        let result = store.create(p2, None, Document::new(), &stamp());
        assert!(matches!(result, Err(ContextError::InvalidParent { .. })));

        let result = store.create(
            key(ContextLevel::Project, "p2"),
            Some("  ".into()),
            Document::new(),
            &stamp(),
        );
        assert!(matches!(result, Err(ContextError::InvalidParent { .. })));
    }

    #[test]
    fn create_rejects_parent_on_global() {
        let store = ContextStore::default();
        let result = store.create(
            key(ContextLevel::Global, "g1"),
            Some("other".into()),
            Document::new(),
            &stamp(),
        );
        assert!(matches!(result, Err(ContextError::InvalidParent { .. })));
    }

    #[test]
    fn create_rejects_missing_parent() {
        let store = seeded();
        let result = store.create(
            key(ContextLevel::Branch, "br1"),
            Some("missing".into()),
            Document::new(),
            &stamp(),
        );
        assert!(matches!(result, Err(ContextError::InvalidParent { .. })));
        assert!(!store.contains(&key(ContextLevel::Branch, "br1")));
    }

    #[test]
    fn update_merges_and_bumps_version() {
        let store = seeded();
        let p1 = key(ContextLevel::Project, "p1");
        let updated = store.update(&p1, &doc(json!({"c": 3})), &stamp()).unwrap();

        assert_eq!(updated.version(), 2);
        assert_eq!(updated.data, doc(json!({"b": 2, "c": 3})));
    }

    #[test]
    fn update_missing_is_not_found() {
        let store = seeded();
        let result = store
            .update(&key(ContextLevel::Task, "t"), &Document::new(), &stamp());
        assert!(matches!(result, Err(ContextError::NotFound(_))));
    }

    #[test]
    fn delete_with_children_is_rejected() {
        let store = seeded();
        let result = store.delete(&key(ContextLevel::Global, "g1"));

        match result {
            Err(ContextError::HasDependents { children, .. }) => {
                assert_eq!(children, vec![key(ContextLevel::Project, "p1")]);
            }
            other => panic!("expected HasDependents, got {other:?}"),
        }
    }

    #[test]
    fn delete_leaf_then_parent() {
        let store = seeded();
        store.delete(&key(ContextLevel::Project, "p1")).unwrap();
        assert!(store.children(&key(ContextLevel::Global, "g1")).is_empty());

        store.delete(&key(ContextLevel::Global, "g1")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn keys_at_filters_by_level() {
        let store = seeded();
        let p0 = key(ContextLevel::Project, "p0");
        store
            .create(p0, Some("g1".into()), Document::new(), &stamp())
            .unwrap();

        assert_eq!(
            store.keys_at(ContextLevel::Project),
            vec![key(ContextLevel::Project, "p0"), key(ContextLevel::Project, "p1")]
        );
    }

    #[test]
    fn plan_missing_parents_walks_to_default_global() {
        let store = ContextStore::default();
        let plan = store
            .plan_missing_parents(&key(ContextLevel::Branch, "br1"), Some("p9"))
            .unwrap();

        assert_eq!(
            plan,
            vec![
                PlannedParent {
                    key: key(ContextLevel::Global, "global_singleton"),
                    parent_ref: None,
                },
                PlannedParent {
                    key: key(ContextLevel::Project, "p9"),
                    parent_ref: Some("global_singleton".into()),
                },
            ]
        );
    }

    #[test]
    fn plan_missing_parents_stops_at_existing() {
        let store = seeded();
        let plan = store
            .plan_missing_parents(&key(ContextLevel::Branch, "br1"), Some("p1"))
            .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn checks_do_not_mutate() {
        let store = seeded();
        let br1 = key(ContextLevel::Branch, "br1");

        assert_eq!(
            store.check_create(&br1, Some("p1")).unwrap(),
            Some(key(ContextLevel::Project, "p1"))
        );
        assert!(!store.contains(&br1));
        assert!(matches!(
            store.check_create(&key(ContextLevel::Project, "p1"), Some("g1")),
            Err(ContextError::AlreadyExists(_))
        ));

        assert!(matches!(
            store.check_delete(&key(ContextLevel::Global, "g1")),
            Err(ContextError::HasDependents { .. })
        ));
        store
            .check_delete(&key(ContextLevel::Project, "p1"))
            .unwrap();
        assert_eq!(store.len(), 2);
    }
}
