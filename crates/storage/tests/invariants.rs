//! Property tests: the storage invariants hold at every observable
//! moment of any add/update/remove sequence.

use std::sync::Arc;

use colstore_common::{KeySchema, Record, StoreError, Value};
use colstore_storage::{Collection, Database, MemoryEngine, UpdateOptions};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Add { id: i64, unique: i64, tag: i64 },
    Update { id: i64, unique: Option<i64>, tag: Option<i64> },
    Remove { id: i64 },
}

// Small domains on purpose: collisions are the interesting part.
fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..8i64, 0..6i64, 0..4i64)
            .prop_map(|(id, unique, tag)| Op::Add { id, unique, tag }),
        (
            0..8i64,
            proptest::option::of(0..6i64),
            proptest::option::of(0..4i64)
        )
            .prop_map(|(id, unique, tag)| Op::Update { id, unique, tag }),
        (0..8i64).prop_map(|id| Op::Remove { id }),
    ]
}

async fn apply(col: &Arc<dyn Collection>, op: &Op) -> Result<(), StoreError> {
    match op {
        Op::Add { id, unique, tag } => {
            col.add(Record::new().set("id", *id).set("u", *unique).set("tag", *tag))
                .await
        }
        Op::Update { id, unique, tag } => {
            let mut delta = Record::new();
            if let Some(unique) = unique {
                delta.insert("u", *unique);
            }
            if let Some(tag) = tag {
                delta.insert("tag", *tag);
            }
            col.update("id", &Value::Int(*id), delta, UpdateOptions::default())
                .await
        }
        Op::Remove { id } => col.remove("id", &Value::Int(*id)).await.map(|_| ()),
    }
}

async fn snapshot(col: &Arc<dyn Collection>) -> Vec<Record> {
    let mut all = col.get_all(None, None).await.unwrap();
    all.sort_by_key(|record| record.get("id").and_then(Value::as_int));
    all
}

async fn run_sequence(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let db = Database::new(Arc::new(MemoryEngine::new()));
    let col = db
        .collection_with_keys("subject", KeySchema::new().unique("u").index("tag"))
        .unwrap();

    for op in &ops {
        let before = snapshot(&col).await;
        if let Err(err) = apply(&col, op).await {
            // Atomicity: a rejected write is a duplicate, and it left
            // no trace.
            prop_assert!(err.is_duplicate(), "unexpected failure: {err:?}");
            prop_assert_eq!(&before, &snapshot(&col).await);
        }

        let all = snapshot(&col).await;

        // IDU: ids are unique.
        let mut ids: Vec<_> = all
            .iter()
            .map(|record| record.get("id").and_then(Value::as_int))
            .collect();
        ids.sort();
        ids.dedup();
        prop_assert_eq!(ids.len(), all.len());

        // UIU: no two records share a value of the unique attribute.
        let mut uniques: Vec<_> = all
            .iter()
            .filter_map(|record| record.get("u").and_then(Value::as_int))
            .collect();
        let held = uniques.len();
        uniques.sort();
        uniques.dedup();
        prop_assert_eq!(uniques.len(), held);

        // IVP: every record is reachable through each indexed value it
        // currently stores, and lookups return nothing stale.
        for record in &all {
            for attribute in ["u", "tag"] {
                if let Some(indexed) = record.get(attribute) {
                    let found = col.get_all(Some((attribute, indexed)), None).await.unwrap();
                    prop_assert!(found.contains(record));
                    prop_assert!(
                        found
                            .iter()
                            .all(|hit| hit.get(attribute) == Some(indexed))
                    );
                }
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn invariants_hold_under_any_sequence(ops in proptest::collection::vec(arb_op(), 1..32)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_sequence(ops))?;
    }
}
