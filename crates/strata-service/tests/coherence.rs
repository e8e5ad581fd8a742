//! Property tests for cache coherence.
//!
//! A random sequence of writes and reads runs against the service; after
//! every read the cached answer must equal a fresh resolution.

use proptest::prelude::*;
use serde_json::Value;
use strata_core::{Document, EntityKey, StrataConfig};
use strata_service::{ContextService, GetOptions};
use strata_test_utils::{actor, branch, global, manual_sync, project, task};

#[derive(Debug, Clone)]
enum Step {
    Write {
        target: usize,
        field: String,
        value: i64,
    },
    Read { target: usize },
}

fn keys() -> Vec<EntityKey> {
    vec![
        global("g1"),
        project("p1"),
        branch("br1"),
        task("t1"),
        global("g2"),
        project("p2"),
    ]
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..6usize, "[a-c]", any::<i64>()).prop_map(|(target, field, value)| Step::Write {
            target,
            field,
            value,
        }),
        (0..6usize).prop_map(|target| Step::Read { target }),
    ]
}

async fn seeded() -> ContextService {
    let svc = ContextService::in_memory(StrataConfig::default().with_sync(manual_sync()))
        .unwrap();
    let a = actor("seed");
    svc.create(global("g1"), None, Document::new(), &a)
        .await
        .unwrap();
    svc.create(project("p1"), Some("g1".into()), Document::new(), &a)
        .await
        .unwrap();
    svc.create(branch("br1"), Some("p1".into()), Document::new(), &a)
        .await
        .unwrap();
    svc.create(task("t1"), Some("br1".into()), Document::new(), &a)
        .await
        .unwrap();
    svc.create(global("g2"), None, Document::new(), &a)
        .await
        .unwrap();
    svc.create(project("p2"), Some("g2".into()), Document::new(), &a)
        .await
        .unwrap();
    svc
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Tenet: a cached read never differs from a forced resolution.
    #[test]
    fn cached_reads_match_fresh_resolution(steps in prop::collection::vec(step(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let svc = seeded().await;
            let keys = keys();
            let a = actor("prop");

            for step in steps {
                match step {
                    Step::Write { target, field, value } => {
                        let patch: Document = [(field, Value::from(value))].into_iter().collect();
                        svc.update(&keys[target], patch, &a).await.unwrap();
                    }
                    Step::Read { target } => {
                        let key = &keys[target];
                        let cached = svc.get(key, GetOptions::default()).await.unwrap();
                        let fresh = svc
                            .get(key, GetOptions::default().with_force_refresh(true))
                            .await
                            .unwrap();
                        prop_assert_eq!(&cached.data, &fresh.data);
                        prop_assert_eq!(&cached.sources, &fresh.sources);
                    }
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
