//! Context records and their addressing
//!
//! - [`EntityKey`]: `(level, id)` address of a record
//! - [`Document`]: freeform JSON object carried by every record
//! - [`ContextRecord`]: a stored document plus hierarchy link and metadata
//! - [`Actor`]: validated identity supplied by the caller, kept for audit
//! - [`Stamp`]: actor plus time of a mutation

use crate::level::ContextLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Freeform key-value document
///
/// Backed by an ordered map, so serialization is deterministic.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Shallow merge: every top-level key of `patch` overwrites the same key in `base`
pub fn merge_shallow(base: &mut Document, patch: &Document) {
    for (key, value) in patch {
        base.insert(key.clone(), value.clone());
    }
}

/// Build a document from a JSON value, rejecting anything that is not an object
#[must_use]
pub fn document_from_value(value: serde_json::Value) -> Option<Document> {
    match value {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Address of a context record
///
/// Keys order by `(level, id)`; lock acquisition follows this order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Hierarchy level
    pub level: ContextLevel,
    /// Entity identifier, unique within its level
    pub id: String,
}

impl EntityKey {
    /// Create new key
    #[inline]
    #[must_use]
    pub fn new(level: ContextLevel, id: impl Into<String>) -> Self {
        Self {
            level,
            id: id.into(),
        }
    }

    /// Shorthand for a global key
    #[inline]
    #[must_use]
    pub fn global(id: impl Into<String>) -> Self {
        Self::new(ContextLevel::Global, id)
    }

    /// Key of the parent record given its id, `None` at the global level
    #[inline]
    #[must_use]
    pub fn parent_key(&self, parent_id: &str) -> Option<EntityKey> {
        self.level
            .parent()
            .map(|level| EntityKey::new(level, parent_id))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.level, self.id)
    }
}

/// Validated identity of the user or agent performing an operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(pub String);

impl Actor {
    /// Wrap an identity string
    #[inline]
    #[must_use]
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// Identity used for internal operations such as journal replay
    #[inline]
    #[must_use]
    pub fn system() -> Self {
        Self("system".to_string())
    }

    /// Identity string
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who performed a mutation and when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    /// Identity behind the mutation
    pub actor: Actor,
    /// Time the mutation was requested
    pub at: DateTime<Utc>,
}

impl Stamp {
    /// Stamp with the current time
    #[inline]
    #[must_use]
    pub fn now(actor: Actor) -> Self {
        Self {
            actor,
            at: Utc::now(),
        }
    }
}

/// Bookkeeping attached to every record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    /// Starts at 1, bumped on every update
    pub version: u64,
    /// Identity that created the record
    pub created_by: Actor,
    /// Identity behind the last update
    pub updated_by: Actor,
}

impl RecordMetadata {
    /// Metadata for a freshly created record
    #[must_use]
    pub fn new(stamp: &Stamp) -> Self {
        Self {
            created_at: stamp.at,
            updated_at: stamp.at,
            version: 1,
            created_by: stamp.actor.clone(),
            updated_by: stamp.actor.clone(),
        }
    }

    /// Record an update
    pub fn touch(&mut self, stamp: &Stamp) {
        self.updated_at = stamp.at;
        self.version += 1;
        self.updated_by = stamp.actor.clone();
    }
}

/// Stored context document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    /// Address of this record
    pub key: EntityKey,
    /// Id of the parent record at `key.level.parent()`; `None` only for global records
    pub parent_ref: Option<String>,
    /// Own document, without inherited keys
    pub data: Document,
    /// Timestamps and version counter
    pub metadata: RecordMetadata,
}

impl ContextRecord {
    /// Create new record with version 1
    #[must_use]
    pub fn new(key: EntityKey, parent_ref: Option<String>, data: Document, stamp: &Stamp) -> Self {
        Self {
            key,
            parent_ref,
            data,
            metadata: RecordMetadata::new(stamp),
        }
    }

    /// Level of this record
    #[inline]
    #[must_use]
    pub fn level(&self) -> ContextLevel {
        self.key.level
    }

    /// Current version
    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    /// Key of the parent record, if any
    #[must_use]
    pub fn parent_key(&self) -> Option<EntityKey> {
        self.parent_ref
            .as_deref()
            .and_then(|parent_id| self.key.parent_key(parent_id))
    }

    /// Apply a shallow patch and bump the version
    pub fn apply_patch(&mut self, patch: &Document, stamp: &Stamp) {
        merge_shallow(&mut self.data, patch);
        self.metadata.touch(stamp);
    }
}
