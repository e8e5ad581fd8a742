//! Strata Store
//!
//! Authoritative storage of context records and the inheritance resolver
//! that reads from it.
//!
//! # Architecture
//!
//! ```text
//! create/update/delete ──► ContextStore ◄── Resolver::resolve(key, include_inherited)
//!                         (records + child index)        │
//!                                                        ▼
//!                                              ResolvedContext (merged, with sources)
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use strata_core::{Actor, ContextLevel, Document, EntityKey, Stamp};
//! use strata_store::{ContextStore, Resolver};
//!
//! let store = Arc::new(ContextStore::default());
//! let stamp = Stamp::now(Actor::new("alice"));
//! store.create(EntityKey::global("g1"), None, Document::new(), &stamp).unwrap();
//! let p1 = EntityKey::new(ContextLevel::Project, "p1");
//! store.create(p1, Some("g1".into()), Document::new(), &stamp).unwrap();
//!
//! let resolver = Resolver::new(store);
//! let resolved = resolver
//!     .resolve(&EntityKey::new(ContextLevel::Project, "p1"), true)
//!     .unwrap();
//! assert_eq!(resolved.sources.len(), 2);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod resolver;
pub mod store;

// Re-exports
pub use resolver::{Resolver, MAX_HOPS};
pub use store::{ContextStore, PlannedParent};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
