//! End-to-end transaction tests against the in-memory cluster.

use hawser_kv::{DocumentId, DurabilityLevel, KvClient, MockCluster};
use hawser_transactions::{
    AttemptHooks, ErrorClass, TransactionConfig, TransactionError, TransactionOperationFailed,
    Transactions,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn doc_id(key: &str) -> DocumentId {
    DocumentId::in_default_collection("default", key)
}

fn transactions(cluster: &Arc<MockCluster>) -> Transactions {
    Transactions::new(
        cluster.clone() as Arc<dyn KvClient>,
        TransactionConfig::default().with_durability_level(DurabilityLevel::Majority),
    )
}

#[tokio::test]
async fn test_insert_commits_and_is_visible_outside() {
    let cluster = Arc::new(MockCluster::new());
    let txns = transactions(&cluster);

    let result = txns
        .run(|ctx| async move {
            ctx.insert(&doc_id("a"), json!({"v": 1})).await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(cluster.get_live(&doc_id("a")), Some(json!({"v": 1})));
    assert!(result.unstaging_complete);
    assert_eq!(result.attempts.len(), 1);

    // The attempt's entry is gone from the ATR.
    let atr_key = result.atr_id.unwrap();
    let attempt_id = &result.attempts[0].attempt_id;
    let atr_doc = doc_id(&atr_key);
    assert!(cluster
        .xattr(&atr_doc, &format!("attempts.{}", attempt_id))
        .is_none());

    // No txn linkage survives on the committed document.
    assert!(cluster.xattr(&doc_id("a"), "txn").is_none());
    txns.close();
}

#[tokio::test]
async fn test_body_error_rolls_back_replace() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed(doc_id("a"), json!({"v": 1}));
    let txns = transactions(&cluster);

    let err = txns
        .run(|ctx| async move {
            let doc = ctx.get(&doc_id("a")).await?;
            ctx.replace(&doc, json!({"v": 2})).await?;
            Err(TransactionOperationFailed::custom("boom"))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TransactionError::Failed { .. }));
    // The original body is untouched and the staged write is gone.
    assert_eq!(cluster.get_live(&doc_id("a")), Some(json!({"v": 1})));
    assert!(cluster.xattr(&doc_id("a"), "txn").is_none());
    txns.close();
}

#[tokio::test]
async fn test_insert_then_remove_in_same_attempt() {
    let cluster = Arc::new(MockCluster::new());
    let txns = transactions(&cluster);

    txns.run(|ctx| async move {
        ctx.insert(&doc_id("b"), json!({"x": 1})).await?;
        let doc = ctx.get(&doc_id("b")).await?;
        ctx.remove(&doc).await?;
        Ok(())
    })
    .await
    .unwrap();

    assert!(cluster.get_live(&doc_id("b")).is_none());
    // The collapsed insert leaves no staged state behind.
    assert!(cluster.xattr(&doc_id("b"), "txn").is_none());
    txns.close();
}

#[tokio::test]
async fn test_double_insert_same_key_fails() {
    let cluster = Arc::new(MockCluster::new());
    let txns = transactions(&cluster);

    let err = txns
        .run(|ctx| async move {
            ctx.insert(&doc_id("c"), json!({"x": 1})).await?;
            ctx.insert(&doc_id("c"), json!({"y": 2})).await?;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TransactionError::Failed { .. }));
    assert!(cluster.get_live(&doc_id("c")).is_none());
    txns.close();
}

#[tokio::test]
async fn test_read_your_own_write() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed(doc_id("a"), json!({"v": 1}));
    let txns = transactions(&cluster);

    let observed = Arc::new(Mutex::new(None));
    let observed_in_body = observed.clone();
    txns.run(move |ctx| {
        let observed = observed_in_body.clone();
        async move {
            let doc = ctx.get(&doc_id("a")).await?;
            let staged = ctx.replace(&doc, json!({"v": 2})).await?;
            let reread = ctx.get(&doc_id("a")).await?;
            *observed.lock() = Some((
                staged.cas(),
                reread.cas(),
                reread.content().cloned(),
            ));
            Ok(())
        }
    })
    .await
    .unwrap();

    let (staged_cas, reread_cas, reread_content) = observed.lock().take().unwrap();
    assert_eq!(reread_content, Some(json!({"v": 2})));
    // Reading your own write does not bump the CAS.
    assert_eq!(staged_cas, reread_cas);
    txns.close();
}

#[tokio::test]
async fn test_own_remove_reads_as_absent() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed(doc_id("a"), json!({"v": 1}));
    let txns = transactions(&cluster);

    txns.run(|ctx| async move {
        let doc = ctx.get(&doc_id("a")).await?;
        ctx.remove(&doc).await?;
        assert!(ctx.get_optional(&doc_id("a")).await?.is_none());
        Ok(())
    })
    .await
    .unwrap();

    assert!(cluster.get_live(&doc_id("a")).is_none());
    txns.close();
}

#[tokio::test]
async fn test_staged_write_is_invisible_outside_until_commit() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed(doc_id("a"), json!({"v": 1}));
    let txns = transactions(&cluster);

    let cluster_in_body = cluster.clone();
    txns.run(move |ctx| {
        let cluster = cluster_in_body.clone();
        async move {
            let doc = ctx.get(&doc_id("a")).await?;
            ctx.replace(&doc, json!({"v": 2})).await?;
            ctx.insert(&doc_id("new"), json!({"n": 1})).await?;
            // A plain reader still sees the pre-transaction state.
            assert_eq!(cluster.get_live(&doc_id("a")), Some(json!({"v": 1})));
            assert!(cluster.get_live(&doc_id("new")).is_none());
            Ok(())
        }
    })
    .await
    .unwrap();

    assert_eq!(cluster.get_live(&doc_id("a")), Some(json!({"v": 2})));
    assert_eq!(cluster.get_live(&doc_id("new")), Some(json!({"n": 1})));
    txns.close();
}

#[tokio::test]
async fn test_insert_over_stale_tombstone() {
    let cluster = Arc::new(MockCluster::new());
    let cas = cluster.seed(doc_id("t"), json!({"old": true}));
    cluster
        .remove(&doc_id("t"), cas, DurabilityLevel::Majority)
        .await
        .unwrap();
    assert!(cluster.is_tombstone(&doc_id("t")));

    let txns = transactions(&cluster);
    txns.run(|ctx| async move {
        ctx.insert(&doc_id("t"), json!({"fresh": true})).await?;
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(cluster.get_live(&doc_id("t")), Some(json!({"fresh": true})));
    txns.close();
}

#[tokio::test]
async fn test_get_missing_doc() {
    let cluster = Arc::new(MockCluster::new());
    let txns = transactions(&cluster);

    let err = txns
        .run(|ctx| async move {
            ctx.get(&doc_id("nope")).await?;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TransactionError::Failed { .. }));

    txns.run(|ctx| async move {
        assert!(ctx.get_optional(&doc_id("nope")).await?.is_none());
        Ok(())
    })
    .await
    .unwrap();
    txns.close();
}

#[tokio::test]
async fn test_empty_transaction_commits_trivially() {
    let cluster = Arc::new(MockCluster::new());
    let txns = transactions(&cluster);

    let result = txns.run(|_ctx| async move { Ok(()) }).await.unwrap();
    assert!(result.atr_id.is_none());
    assert!(result.unstaging_complete);
    txns.close();
}

#[tokio::test]
async fn test_commit_twice_fails_without_rollback() {
    let cluster = Arc::new(MockCluster::new());
    let txns = transactions(&cluster);

    let err = txns
        .run(|ctx| async move {
            ctx.insert(&doc_id("x"), json!({"v": 1})).await?;
            ctx.commit().await?;
            ctx.commit().await?;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TransactionError::Failed { .. }));
    // The first commit stands.
    assert_eq!(cluster.get_live(&doc_id("x")), Some(json!({"v": 1})));
    txns.close();
}

#[tokio::test]
async fn test_rollback_after_commit_fails() {
    let cluster = Arc::new(MockCluster::new());
    let txns = transactions(&cluster);

    let err = txns
        .run(|ctx| async move {
            ctx.insert(&doc_id("y"), json!({"v": 1})).await?;
            ctx.commit().await?;
            ctx.rollback().await?;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TransactionError::Failed { .. }));
    assert_eq!(cluster.get_live(&doc_id("y")), Some(json!({"v": 1})));
    txns.close();
}

#[tokio::test]
async fn test_expiry_rolls_back_and_reports_expired() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed(doc_id("a"), json!({"v": 1}));
    let txns = Transactions::new(
        cluster.clone() as Arc<dyn KvClient>,
        TransactionConfig::default().with_expiration_time(std::time::Duration::from_millis(50)),
    );

    let err = txns
        .run(|ctx| async move {
            let doc = ctx.get(&doc_id("a")).await?;
            ctx.replace(&doc, json!({"v": 2})).await?;
            tokio::time::sleep(std::time::Duration::from_millis(120)).await;
            let doc = ctx.get(&doc_id("a")).await?;
            ctx.replace(&doc, json!({"v": 3})).await?;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TransactionError::Expired { .. }));
    // The staged first replace was rolled back.
    assert_eq!(cluster.get_live(&doc_id("a")), Some(json!({"v": 1})));
    assert!(cluster.xattr(&doc_id("a"), "txn").is_none());
    txns.close();
}

#[tokio::test]
async fn test_commit_ambiguous_after_write_resolves_to_success() {
    let cluster = Arc::new(MockCluster::new());
    let resolution_reads = Arc::new(AtomicUsize::new(0));

    let mut hooks = AttemptHooks::default();
    let fired = Arc::new(AtomicUsize::new(0));
    hooks.after_atr_commit = Arc::new(move |_| {
        if fired.fetch_add(1, Ordering::SeqCst) == 0 {
            Some(ErrorClass::FailAmbiguous)
        } else {
            None
        }
    });
    let reads = resolution_reads.clone();
    hooks.before_atr_commit_ambiguity_resolution = Arc::new(move |_| {
        reads.fetch_add(1, Ordering::SeqCst);
        None
    });

    let txns = Transactions::new(
        cluster.clone() as Arc<dyn KvClient>,
        TransactionConfig::default().with_attempt_hooks(hooks),
    );
    let result = txns
        .run(|ctx| async move {
            ctx.insert(&doc_id("amb"), json!({"v": 1})).await?;
            Ok(())
        })
        .await
        .unwrap();

    // The ATR write landed before the injected ambiguity, so one resolution
    // read observes COMMITTED and the transaction succeeds.
    assert_eq!(resolution_reads.load(Ordering::SeqCst), 1);
    assert!(result.unstaging_complete);
    assert_eq!(cluster.get_live(&doc_id("amb")), Some(json!({"v": 1})));
    txns.close();
}

#[tokio::test]
async fn test_commit_ambiguous_before_write_retries_commit() {
    let cluster = Arc::new(MockCluster::new());

    let mut hooks = AttemptHooks::default();
    let fired = Arc::new(AtomicUsize::new(0));
    hooks.before_atr_commit = Arc::new(move |_| {
        if fired.fetch_add(1, Ordering::SeqCst) == 0 {
            Some(ErrorClass::FailAmbiguous)
        } else {
            None
        }
    });

    let txns = Transactions::new(
        cluster.clone() as Arc<dyn KvClient>,
        TransactionConfig::default().with_attempt_hooks(hooks),
    );
    let result = txns
        .run(|ctx| async move {
            ctx.insert(&doc_id("amb2"), json!({"v": 2})).await?;
            Ok(())
        })
        .await
        .unwrap();

    // The injected ambiguity hit before anything was written, so resolution
    // found the entry still PENDING and ATR-COMMIT was reissued.
    assert!(result.unstaging_complete);
    assert_eq!(cluster.get_live(&doc_id("amb2")), Some(json!({"v": 2})));
    txns.close();
}

#[tokio::test]
async fn test_transient_staging_error_retries_attempt() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed(doc_id("a"), json!({"v": 1}));

    let mut hooks = AttemptHooks::default();
    let fired = Arc::new(AtomicUsize::new(0));
    hooks.before_staged_replace = Arc::new(move |_| {
        if fired.fetch_add(1, Ordering::SeqCst) == 0 {
            Some(ErrorClass::FailTransient)
        } else {
            None
        }
    });

    let txns = Transactions::new(
        cluster.clone() as Arc<dyn KvClient>,
        TransactionConfig::default().with_attempt_hooks(hooks),
    );
    let result = txns
        .run(|ctx| async move {
            let doc = ctx.get(&doc_id("a")).await?;
            ctx.replace(&doc, json!({"v": 2})).await?;
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(result.attempts.len(), 2);
    assert_eq!(cluster.get_live(&doc_id("a")), Some(json!({"v": 2})));
    txns.close();
}

#[tokio::test]
async fn test_post_commit_unstage_failure_leaves_work_for_cleanup() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed(doc_id("a"), json!({"v": 1}));

    let mut hooks = AttemptHooks::default();
    hooks.before_doc_committed = Arc::new(|_| Some(ErrorClass::FailHard));

    let txns = Transactions::new(
        cluster.clone() as Arc<dyn KvClient>,
        TransactionConfig::default()
            .with_attempt_hooks(hooks)
            .with_cleanup_client_attempts(false)
            .with_cleanup_lost_attempts(false),
    );
    let result = txns
        .run(|ctx| async move {
            let doc = ctx.get(&doc_id("a")).await?;
            ctx.replace(&doc, json!({"v": 2})).await?;
            Ok(())
        })
        .await
        .unwrap();

    // The commit point passed; the transaction succeeds but reports that
    // unstaging is incomplete.
    assert!(!result.unstaging_complete);
    // The staged write is still in place for cleanup to finish.
    assert_eq!(cluster.get_live(&doc_id("a")), Some(json!({"v": 1})));
    assert!(cluster.xattr(&doc_id("a"), "txn").is_some());
    txns.close();
}

#[test]
fn test_run_blocking_facade() {
    let cluster = Arc::new(MockCluster::new());
    let txns = transactions(&cluster);

    let result = txns
        .run_blocking(|ctx| async move {
            ctx.insert(&doc_id("sync"), json!({"v": 1})).await?;
            Ok(())
        })
        .unwrap();

    assert!(result.unstaging_complete);
    assert_eq!(cluster.get_live(&doc_id("sync")), Some(json!({"v": 1})));
    txns.close();
}

#[tokio::test]
async fn test_blocking_write_write_conflict_is_retried_to_conclusion() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed(doc_id("contended"), json!({"n": 0}));
    let txns = Arc::new(transactions(&cluster));

    // Two transactions race to replace the same document.
    let mut handles = Vec::new();
    for _ in 0..2 {
        let txns = txns.clone();
        handles.push(tokio::spawn(async move {
            txns.run(|ctx| async move {
                let doc = ctx.get(&doc_id("contended")).await?;
                let n = doc
                    .content()
                    .and_then(|c| c.get("n"))
                    .and_then(|n| n.as_i64())
                    .unwrap_or(0);
                ctx.replace(&doc, json!({"n": n + 1})).await?;
                Ok(())
            })
            .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(cluster.get_live(&doc_id("contended")), Some(json!({"n": 2})));
    txns.close();
}
