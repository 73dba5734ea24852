//! Cleanup engine tests: abandoned attempts are discovered by scanning ATRs
//! and driven to the same end state the owning attempt would have reached.

use hawser_kv::{DocumentId, KvClient, MockCluster};
use hawser_transactions::{
    AttemptHooks, ErrorClass, TransactionConfig, TransactionError, TransactionOperationFailed,
    Transactions,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn doc_id(key: &str) -> DocumentId {
    DocumentId::in_default_collection("default", key)
}

/// Run every entry the scanner finds for a bucket through cleanup.
async fn scan_and_drain(txns: &Transactions, bucket: &str) {
    let cleanup = txns.cleanup();
    cleanup.scan_bucket(bucket).await;
    while let Some(entry) = cleanup.queue().pop(false) {
        cleanup.clean_entry(&entry).await.unwrap();
    }
}

#[tokio::test]
async fn test_cleanup_finishes_interrupted_commit() {
    let cluster = Arc::new(MockCluster::new());

    // Wedge the attempt between ATR-COMMIT and entry removal: every
    // per-document unstage fails, and so does ATR-COMPLETE. What's left is
    // exactly what a client killed mid-commit leaves behind.
    let mut hooks = AttemptHooks::default();
    hooks.before_doc_committed = Arc::new(|_| Some(ErrorClass::FailOther));
    hooks.before_atr_complete = Arc::new(|_| Some(ErrorClass::FailHard));

    let txns = Transactions::new(
        cluster.clone() as Arc<dyn KvClient>,
        TransactionConfig::default()
            .with_expiration_time(Duration::from_millis(100))
            .with_attempt_hooks(hooks)
            .with_cleanup_client_attempts(false)
            .with_cleanup_lost_attempts(false),
    );

    let result = txns
        .run(|ctx| async move {
            ctx.insert(&doc_id("k1"), json!({"v": 1})).await?;
            Ok(())
        })
        .await
        .unwrap();
    assert!(!result.unstaging_complete);

    // The commit point passed but nothing was unstaged: the document is
    // still a staged tombstone and the ATR entry still says COMMITTED.
    assert!(cluster.get_live(&doc_id("k1")).is_none());
    let atr_doc = doc_id(&result.atr_id.clone().unwrap());
    let attempt_path = format!("attempts.{}", result.attempts[0].attempt_id);
    assert_eq!(
        cluster.xattr(&atr_doc, &format!("{}.tst", attempt_path)),
        Some(json!("COMMITTED"))
    );

    // After expiry plus the safety margin the scanner picks the entry up and
    // completes the unstage.
    tokio::time::sleep(Duration::from_millis(150)).await;
    txns.cleanup().set_safety_margin_ms(0);
    scan_and_drain(&txns, "default").await;

    assert_eq!(cluster.get_live(&doc_id("k1")), Some(json!({"v": 1})));
    assert!(cluster.xattr(&atr_doc, &attempt_path).is_none());
    txns.close();
}

#[tokio::test]
async fn test_cleanup_finishes_interrupted_rollback() {
    let cluster = Arc::new(MockCluster::new());
    cluster.seed(doc_id("r1"), json!({"v": 1}));

    // Make per-document rollback fail hard, stranding the attempt ABORTED
    // with its staged replace still on the document.
    let mut hooks = AttemptHooks::default();
    hooks.before_doc_rolled_back = Arc::new(|_| Some(ErrorClass::FailHard));

    let txns = Transactions::new(
        cluster.clone() as Arc<dyn KvClient>,
        TransactionConfig::default()
            .with_expiration_time(Duration::from_millis(100))
            .with_attempt_hooks(hooks)
            .with_cleanup_client_attempts(false)
            .with_cleanup_lost_attempts(false),
    );

    let err = txns
        .run(|ctx| async move {
            let doc = ctx.get(&doc_id("r1")).await?;
            ctx.replace(&doc, json!({"v": 2})).await?;
            Err(TransactionOperationFailed::custom("boom"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TransactionError::Failed { .. }));

    let result = err.result().clone();
    let atr_doc = doc_id(&result.atr_id.clone().unwrap());
    let attempt_path = format!("attempts.{}", result.attempts[0].attempt_id);
    assert_eq!(
        cluster.xattr(&atr_doc, &format!("{}.tst", attempt_path)),
        Some(json!("ABORTED"))
    );
    assert!(cluster.xattr(&doc_id("r1"), "txn").is_some());

    tokio::time::sleep(Duration::from_millis(150)).await;
    txns.cleanup().set_safety_margin_ms(0);
    scan_and_drain(&txns, "default").await;

    // The staged write is stripped, the body untouched, the entry gone.
    assert_eq!(cluster.get_live(&doc_id("r1")), Some(json!({"v": 1})));
    assert!(cluster.xattr(&doc_id("r1"), "txn").is_none());
    assert!(cluster.xattr(&atr_doc, &attempt_path).is_none());
    txns.close();
}

#[tokio::test]
async fn test_cleanup_skips_doc_staged_by_another_attempt() {
    let cluster = Arc::new(MockCluster::new());

    // Strand a committed-but-not-unstaged attempt as in the kill-9 test.
    let mut hooks = AttemptHooks::default();
    hooks.before_doc_committed = Arc::new(|_| Some(ErrorClass::FailOther));
    hooks.before_atr_complete = Arc::new(|_| Some(ErrorClass::FailHard));

    let txns = Transactions::new(
        cluster.clone() as Arc<dyn KvClient>,
        TransactionConfig::default()
            .with_expiration_time(Duration::from_millis(100))
            .with_attempt_hooks(hooks)
            .with_cleanup_client_attempts(false)
            .with_cleanup_lost_attempts(false),
    );
    let result = txns
        .run(|ctx| async move {
            ctx.insert(&doc_id("k2"), json!({"v": 1})).await?;
            Ok(())
        })
        .await
        .unwrap();
    assert!(!result.unstaging_complete);

    // Meanwhile the tombstone is re-staged by a different attempt (as a
    // fresh transaction would after observing the first one expired).
    let staged_cas = cluster.cas_of(&doc_id("k2")).unwrap();
    cluster
        .mutate_in(
            &doc_id("k2"),
            &[hawser_kv::MutateInSpec::upsert_xattr(
                "txn.id.atmpt",
                json!("someone-else"),
            )],
            hawser_kv::MutateInOptions {
                cas: staged_cas,
                access_deleted: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    txns.cleanup().set_safety_margin_ms(0);
    scan_and_drain(&txns, "default").await;

    // Cleanup removed the stale ATR entry but left the foreign staged write
    // alone.
    assert!(cluster.get_live(&doc_id("k2")).is_none());
    assert_eq!(
        cluster.xattr(&doc_id("k2"), "txn.id.atmpt"),
        Some(json!("someone-else"))
    );
    txns.close();
}

#[tokio::test]
async fn test_own_attempts_are_swept_by_background_worker() {
    let cluster = Arc::new(MockCluster::new());
    let txns = Transactions::new(
        cluster.clone() as Arc<dyn KvClient>,
        TransactionConfig::default(),
    );

    txns.run(|ctx| async move {
        ctx.insert(&doc_id("swept"), json!({"v": 1})).await?;
        Ok(())
    })
    .await
    .unwrap();

    // The runner queued the finished attempt; the drain worker disposes of
    // it (a no-op here, the attempt completed cleanly).
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(txns.cleanup().queue().size(), 0);
    txns.close();
}
