//! Concurrent transactions against a single contended document.

use hawser_kv::{DocumentId, KvClient, MockCluster};
use hawser_transactions::{TransactionConfig, Transactions};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn doc_id(key: &str) -> DocumentId {
    DocumentId::in_default_collection("default", key)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_counter_increments_all_land() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed(doc_id("counter"), json!({"counter": 0}));

    let txns = Arc::new(Transactions::new(
        cluster.clone() as Arc<dyn KvClient>,
        TransactionConfig::default().with_expiration_time(Duration::from_secs(10)),
    ));

    const TASKS: usize = 2;
    const ITERATIONS: usize = 10;

    let mut handles = Vec::new();
    for _ in 0..TASKS {
        let txns = txns.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..ITERATIONS {
                txns.run(|ctx| async move {
                    let doc = ctx.get(&doc_id("counter")).await?;
                    let n = doc
                        .content()
                        .and_then(|c| c.get("counter"))
                        .and_then(|n| n.as_i64())
                        .unwrap_or(0);
                    ctx.replace(&doc, json!({"counter": n + 1})).await?;
                    Ok(())
                })
                .await
                .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Every increment landed exactly once.
    assert_eq!(
        cluster.get_live(&doc_id("counter")),
        Some(json!({"counter": (TASKS * ITERATIONS) as i64}))
    );
    // No staged state or ATR entries survive.
    assert!(cluster.xattr(&doc_id("counter"), "txn").is_none());
    txns.close();
}
