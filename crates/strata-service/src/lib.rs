//! Strata Service
//!
//! Caller-facing API of the hierarchical context store.
//!
//! # Architecture
//!
//! ```text
//!                        ┌──────────────────────────┐
//!   create/update/  ───► │      ContextService      │ ◄─── get(key, GetOptions)
//!   delete/delegate      └──────────────────────────┘
//!                          │        │         │
//!            ┌─────────────┘        │         └──────────────┐
//!            ▼                      ▼                        ▼
//!   Journal + SyncEngine      ContextStore            ResolutionCache
//!   (durable, pushed to       (records)               (resolved views,
//!    RemoteSync)                  ▲                    dependency index)
//!                                 │                          │ miss
//!                                 └──────── Resolver ◄───────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use strata_core::{Actor, ContextLevel, Document, EntityKey, StrataConfig};
//! use strata_service::{ContextService, GetOptions};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let service = ContextService::in_memory(StrataConfig::default()).unwrap();
//! let alice = Actor::new("alice");
//!
//! service.create(EntityKey::global("g1"), None, Document::new(), &alice).await.unwrap();
//! let p1 = EntityKey::new(ContextLevel::Project, "p1");
//! service.create(p1, Some("g1".into()), Document::new(), &alice).await.unwrap();
//!
//! let view = service
//!     .get(&EntityKey::new(ContextLevel::Project, "p1"), GetOptions::default())
//!     .await
//!     .unwrap();
//! assert_eq!(view.version, 1);
//! # });
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod delegation;
pub mod error;
pub mod service;

// Re-exports
pub use delegation::{
    validate_transition, Delegation, DelegationId, DelegationManager, DelegationStatus,
};
pub use error::{ServiceError, ServiceResult};
pub use service::{ContextService, ContextView, GetOptions};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for callers of the service
    pub use crate::{
        ContextService, ContextView, Delegation, DelegationId, DelegationStatus, GetOptions,
        ServiceError, ServiceResult,
    };
    pub use strata_core::prelude::*;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
