//! Resolved (merged) context values

use crate::level::ContextLevel;
use crate::record::{Document, EntityKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A record consulted during resolution, with the version that was read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSource {
    /// Consulted record
    pub key: EntityKey,
    /// Version observed at resolution time
    pub version: u64,
}

/// Merged view of a record and its ancestors
///
/// Derived and never persisted. Carries no timestamps, so resolving the same
/// unchanged inputs twice yields equal values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedContext {
    /// Record that was resolved
    pub key: EntityKey,
    /// Merged document, most specific level wins
    pub data: Document,
    /// Own document of every consulted level
    pub inherited: BTreeMap<ContextLevel, Document>,
    /// Consulted records, least specific first
    pub sources: Vec<ResolvedSource>,
}

impl ResolvedContext {
    /// Keys whose mutation invalidates this resolution
    #[must_use]
    pub fn dependency_set(&self) -> Vec<EntityKey> {
        self.sources.iter().map(|s| s.key.clone()).collect()
    }

    /// Version of the resolved record itself
    #[must_use]
    pub fn version(&self) -> u64 {
        self.sources
            .iter()
            .find(|s| s.key == self.key)
            .map_or(0, |s| s.version)
    }

    /// True if `key` was consulted
    #[must_use]
    pub fn depends_on(&self, key: &EntityKey) -> bool {
        self.sources.iter().any(|s| &s.key == key)
    }
}
