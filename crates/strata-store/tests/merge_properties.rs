//! Property tests for inheritance merging.
//!
//! These tests build random three-level hierarchies and check that the
//! resolved document always agrees with a by-hand "most specific wins"
//! lookup, no matter which keys collide.

use proptest::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_core::{Actor, ContextLevel, Document, EntityKey, Stamp};
use strata_store::{ContextStore, Resolver};

fn small_doc() -> impl Strategy<Value = BTreeMap<String, i64>> {
    prop::collection::btree_map("[a-e]", any::<i64>(), 0..5)
}

fn to_document(map: &BTreeMap<String, i64>) -> Document {
    map.iter()
        .map(|(k, v)| (k.clone(), Value::from(*v)))
        .collect()
}

proptest! {
    /// Tenet: for every key, the resolved value comes from the most specific
    /// level that defines it.
    #[test]
    fn most_specific_level_wins(
        global in small_doc(),
        project in small_doc(),
        branch in small_doc(),
    ) {
        let store = Arc::new(ContextStore::default());
        let stamp = Stamp::now(Actor::new("prop"));
        store
            .create(EntityKey::global("g"), None, to_document(&global), &stamp)
            .unwrap();
        let p = EntityKey::new(ContextLevel::Project, "p");
        store
            .create(p, Some("g".into()), to_document(&project), &stamp)
            .unwrap();
        let b = EntityKey::new(ContextLevel::Branch, "b");
        store
            .create(b, Some("p".into()), to_document(&branch), &stamp)
            .unwrap();

        let resolver = Resolver::new(store);
        let resolved = resolver
            .resolve(&EntityKey::new(ContextLevel::Branch, "b"), true)
            .unwrap();

        let mut keys: Vec<&String> = global
            .keys()
            .chain(project.keys())
            .chain(branch.keys())
            .collect();
        keys.sort();
        keys.dedup();
        prop_assert_eq!(resolved.data.len(), keys.len());

        for key in keys {
            let expected = branch
                .get(key)
                .or_else(|| project.get(key))
                .or_else(|| global.get(key));
            let actual = resolved.data.get(key).and_then(Value::as_i64);
            prop_assert_eq!(actual, expected.copied());
        }
    }

    /// Tenet: resolving without inheritance never leaks ancestor keys.
    #[test]
    fn own_view_matches_own_data(project in small_doc(), global in small_doc()) {
        let store = Arc::new(ContextStore::default());
        let stamp = Stamp::now(Actor::new("prop"));
        store
            .create(EntityKey::global("g"), None, to_document(&global), &stamp)
            .unwrap();
        let p = EntityKey::new(ContextLevel::Project, "p");
        store
            .create(p, Some("g".into()), to_document(&project), &stamp)
            .unwrap();

        let resolver = Resolver::new(store);
        let resolved = resolver
            .resolve(&EntityKey::new(ContextLevel::Project, "p"), false)
            .unwrap();

        prop_assert_eq!(resolved.data, to_document(&project));
    }
}
