//! Strata Cache
//!
//! Memoized inheritance resolution with precise invalidation.
//!
//! # Architecture
//!
//! ```text
//! get(key) ──► KeyLocks::lock(key) ──► moka hit? ──yes──► Arc<ResolvedContext>
//!                                         │ no
//!                                         ▼
//!                                  resolve() ──► record deps in reverse index
//!                                         │
//!                                         ▼
//!                                  insert (unless a dependency was written meanwhile)
//!
//! write(key) ──► KeyLocks::lock(key) ──► invalidate key + every cached dependent
//! ```
//!
//! # Example
//!
//! ```rust
//! use strata_cache::ResolutionCache;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let cache = ResolutionCache::new(1_000);
//! assert_eq!(cache.stats().await.entry_count, 0);
//! # });
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod cache;
pub mod lock;

// Re-exports
pub use cache::{CacheStats, ResolutionCache};
pub use lock::{KeyGuard, KeyLocks};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
