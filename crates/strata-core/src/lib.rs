//! Strata Core
//!
//! Shared vocabulary of the hierarchical context store.
//!
//! # Core Concepts
//!
//! - [`ContextLevel`]: Global → Project → Branch → Task, ordered by specificity
//! - [`EntityKey`]: `(level, id)` address of a record
//! - [`ContextRecord`]: stored document with parent link and version counter
//! - [`ResolvedContext`]: merged view of a record and its ancestors
//! - [`ContextError`]: structural and integrity failures
//! - [`StrataConfig`]: TOML-backed configuration
//!
//! # Example
//!
//! ```rust
//! use strata_core::{ContextLevel, EntityKey};
//!
//! let key = EntityKey::new(ContextLevel::Branch, "feature-x");
//! assert_eq!(key.level.parent(), Some(ContextLevel::Project));
//! assert_eq!(key.to_string(), "branch:feature-x");
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod config;
pub mod error;
pub mod level;
pub mod record;
pub mod resolved;

// Re-exports for convenience
pub use config::{CacheConfig, ConfigError, StoreConfig, StrataConfig, SyncConfig};
pub use error::{ContextError, ContextResult};
pub use level::{ContextLevel, ParseLevelError};
pub use record::{
    document_from_value, merge_shallow, Actor, ContextRecord, Document, EntityKey, RecordMetadata,
    Stamp,
};
pub use resolved::{ResolvedContext, ResolvedSource};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Strata types
    pub use crate::{
        Actor, ContextError, ContextLevel, ContextRecord, ContextResult, Document, EntityKey,
        ResolvedContext, Stamp, StrataConfig,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
