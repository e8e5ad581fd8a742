//! Inheritance resolver
//!
//! Computes the effective context of a record by walking its `parent_ref`
//! chain up to the global level and merging the documents least specific
//! first, so keys set at more specific levels win.
//!
//! Ancestors are read without locking; a concurrent ancestor update is picked
//! up by the next resolution once the cache entry is invalidated.

use crate::store::ContextStore;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_core::{
    merge_shallow, ContextError, ContextLevel, ContextRecord, ContextResult, Document, EntityKey,
    ResolvedContext, ResolvedSource,
};

/// Maximum parent hops before a chain is treated as corrupt
pub const MAX_HOPS: usize = ContextLevel::ALL.len();

/// Resolver over a shared [`ContextStore`]
#[derive(Debug)]
pub struct Resolver {
    store: Arc<ContextStore>,
    max_hops: usize,
    resolutions: AtomicU64,
}

impl Resolver {
    /// Create resolver with the default hop cap
    #[inline]
    #[must_use]
    pub fn new(store: Arc<ContextStore>) -> Self {
        Self::with_max_hops(store, MAX_HOPS)
    }

    /// Create resolver with a custom hop cap
    #[inline]
    #[must_use]
    pub fn with_max_hops(store: Arc<ContextStore>, max_hops: usize) -> Self {
        Self {
            store,
            max_hops,
            resolutions: AtomicU64::new(0),
        }
    }

    /// Resolve the context of `key`
    ///
    /// With `include_inherited == false` only the record's own data is
    /// returned, but the record must still exist.
    ///
    /// # Errors
    /// - `ContextError::NotFound` if the record or any ancestor is missing
    /// - `ContextError::InvalidParent` if a link does not lead to the global level
    /// - `ContextError::InheritanceCycle` if the walk exceeds the hop cap
    pub fn resolve(
        &self,
        key: &EntityKey,
        include_inherited: bool,
    ) -> ContextResult<ResolvedContext> {
        self.resolutions.fetch_add(1, Ordering::Relaxed);

        let record = self.store.get(key)?;
        let chain = if include_inherited {
            self.ancestor_chain(record)?
        } else {
            vec![record]
        };

        let resolved = merge_chain(key, &chain);
        tracing::debug!(
            key = %key,
            include_inherited,
            sources = resolved.sources.len(),
            "context resolved"
        );
        Ok(resolved)
    }

    /// Number of resolutions performed so far
    #[inline]
    #[must_use]
    pub fn resolutions(&self) -> u64 {
        self.resolutions.load(Ordering::Relaxed)
    }

    /// Store this resolver reads from
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// Chain from `record` up to its global ancestor, least specific first
    fn ancestor_chain(&self, record: ContextRecord) -> ContextResult<Vec<ContextRecord>> {
        let origin = record.key.clone();
        let mut chain = vec![record];
        let mut hops = 0;

        loop {
            let current = &chain[chain.len() - 1];
            let Some(parent_id) = current.parent_ref.as_deref() else {
                if current.level() != ContextLevel::Global {
                    return Err(ContextError::invalid_parent(
                        current.key.clone(),
                        "chain ends below the global level",
                    ));
                }
                break;
            };

            hops += 1;
            if hops > self.max_hops {
                return Err(ContextError::InheritanceCycle {
                    key: origin,
                    max_hops: self.max_hops,
                });
            }

            let parent_key = current.key.parent_key(parent_id).ok_or_else(|| {
                ContextError::invalid_parent(
                    current.key.clone(),
                    "global records cannot have a parent",
                )
            })?;
            let parent = self.store.get(&parent_key)?;
            chain.push(parent);
        }

        chain.reverse();
        Ok(chain)
    }
}

/// Merge a least-specific-first chain into a resolved context
fn merge_chain(key: &EntityKey, chain: &[ContextRecord]) -> ResolvedContext {
    let mut data = Document::new();
    let mut inherited = BTreeMap::new();
    let mut sources = Vec::with_capacity(chain.len());

    for record in chain {
        merge_shallow(&mut data, &record.data);
        inherited.insert(record.level(), record.data.clone());
        sources.push(ResolvedSource {
            key: record.key.clone(),
            version: record.version(),
        });
    }

    ResolvedContext {
        key: key.clone(),
        data,
        inherited,
        sources,
    }
}
