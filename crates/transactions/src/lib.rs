//! Client-side multi-document ACID transactions over a document KV store
//!
//! The substrate offers single-document atomic sub-document mutations with
//! CAS, durable writes, and xattrs. This crate layers atomic multi-document
//! transactions on top using a two-phase protocol anchored by a shared
//! durable record, the Active Transaction Record (ATR):
//!
//! 1. Mutations are *staged* as `txn` xattrs beside the visible document
//!    body (inserts as tombstones), with the attempt registered PENDING in
//!    an ATR chosen by hashing the first mutated key.
//! 2. Commit flips the ATR entry to COMMITTED (the atomic commit point),
//!    then unstages each document with single-document CAS writes and
//!    removes the entry.
//!
//! Readers outside a transaction never see staged state; readers inside one
//! resolve staged documents through the owning ATR. Attempts that die
//! mid-flight are swept by the lost-attempt cleanup engine.
//!
//! ```ignore
//! let cluster = Arc::new(MockCluster::new());
//! let txns = Transactions::new(cluster.clone(), TransactionConfig::default());
//! let result = txns
//!     .run(|ctx| async move {
//!         let doc = ctx.get(&id_a).await?;
//!         ctx.replace(&doc, json!({"balance": 10})).await?;
//!         ctx.insert(&id_b, json!({"balance": 90})).await?;
//!         Ok(())
//!     })
//!     .await?;
//! ```

mod atr;
pub mod atr_ids;
mod attempt;
mod cleanup;
mod config;
mod context;
mod doc;
mod error;
mod error_class;
pub mod forward_compat;
mod hooks;
mod ops;
pub mod retry;
mod result;
mod staged_mutation;

pub use atr::{ActiveTransactionRecord, AtrEntry, AttemptState, DocRecord};
pub use attempt::AttemptContext;
pub use cleanup::{
    AtrCleanupEntry, AtrCleanupQueue, TransactionsCleanup, CLEANUP_QUEUE_CAPACITY,
    CLEANUP_SAFETY_MARGIN_MS,
};
pub use config::TransactionConfig;
pub use context::TransactionContext;
pub use doc::{DocumentMetadata, TransactionGetResult, TransactionLinks};
pub use error::{
    ExternalException, FinalErrorToRaise, TransactionError, TransactionOperationFailed,
};
pub use error_class::ErrorClass;
pub use hooks::{AttemptHooks, CleanupHooks};
pub use result::{TransactionAttempt, TransactionResult};
pub use staged_mutation::{StagedMutation, StagedMutationQueue, StagedMutationType};

use error::FinalErrorToRaise as ToRaise;
use hawser_kv::KvClient;
use std::future::Future;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Entry point: runs transaction bodies against a cluster and owns the
/// cleanup engine.
pub struct Transactions {
    kv: Arc<dyn KvClient>,
    config: TransactionConfig,
    cleanup: Arc<TransactionsCleanup>,
    blocking_runtime: OnceLock<tokio::runtime::Runtime>,
}

impl Transactions {
    pub fn new(kv: Arc<dyn KvClient>, config: TransactionConfig) -> Self {
        let cleanup = Arc::new(TransactionsCleanup::new(kv.clone(), config.clone()));
        Self {
            kv,
            config,
            cleanup,
            blocking_runtime: OnceLock::new(),
        }
    }

    /// The cleanup engine serving this instance.
    pub fn cleanup(&self) -> &Arc<TransactionsCleanup> {
        &self.cleanup
    }

    /// Run `body` as a transaction, retrying attempts until success, a
    /// non-retryable failure, or expiry. Commits automatically when the body
    /// returns without having committed or rolled back itself.
    pub async fn run<F, Fut>(&self, body: F) -> Result<TransactionResult, TransactionError>
    where
        F: Fn(Arc<AttemptContext>) -> Fut,
        Fut: Future<Output = Result<(), TransactionOperationFailed>>,
    {
        // Workers spawn lazily so construction does not need a runtime.
        self.cleanup.start();

        let overall = Arc::new(TransactionContext::new(self.config.clone()));
        loop {
            let attempt = Arc::new(AttemptContext::new(overall.clone(), self.kv.clone()));
            let body_result = body(attempt.clone()).await;
            let attempt_result = match body_result {
                Ok(()) if !attempt.is_done() => attempt.commit().await,
                Ok(()) => Ok(()),
                Err(e) => Err(e),
            };

            match attempt_result {
                Ok(()) => {
                    self.finish_attempt(&attempt);
                    return Ok(overall.result(attempt.unstaging_complete()));
                }
                Err(err) => {
                    debug!(
                        transaction_id = %overall.transaction_id(),
                        error = %err,
                        retry = err.should_retry(),
                        rollback = err.should_rollback(),
                        "attempt failed"
                    );
                    if err.should_rollback() && !attempt.is_done() {
                        if let Err(rollback_err) = attempt.rollback().await {
                            warn!(
                                error = %rollback_err,
                                "rollback after failed attempt also failed; cleanup will finish it"
                            );
                        }
                    }
                    self.finish_attempt(&attempt);

                    match err.to_raise() {
                        ToRaise::FailedPostCommit => {
                            // The commit point passed; the transaction is
                            // successful, with unstaging left to cleanup.
                            return Ok(overall.result(false));
                        }
                        ToRaise::Expired => {
                            return Err(TransactionError::Expired {
                                msg: err.message().to_string(),
                                result: overall.result(attempt.unstaging_complete()),
                            });
                        }
                        ToRaise::CommitAmbiguous => {
                            return Err(TransactionError::CommitAmbiguous {
                                msg: err.message().to_string(),
                                result: overall.result(attempt.unstaging_complete()),
                            });
                        }
                        ToRaise::Failed => {
                            if err.should_retry() && err.should_rollback() {
                                if !overall.has_expired_client_side() {
                                    overall.retry_delay().await;
                                    continue;
                                }
                                return Err(TransactionError::Expired {
                                    msg: "transaction expired before it could be retried"
                                        .to_string(),
                                    result: overall.result(attempt.unstaging_complete()),
                                });
                            }
                            return Err(TransactionError::Failed {
                                msg: err.message().to_string(),
                                cause: err.external_cause(),
                                result: overall.result(attempt.unstaging_complete()),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Blocking facade over [`run`](Self::run) for synchronous callers.
    pub fn run_blocking<F, Fut>(&self, body: F) -> Result<TransactionResult, TransactionError>
    where
        F: Fn(Arc<AttemptContext>) -> Fut,
        Fut: Future<Output = Result<(), TransactionOperationFailed>>,
    {
        let runtime = self.blocking_runtime.get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .expect("failed to build blocking facade runtime")
        });
        runtime.block_on(self.run(body))
    }

    /// Stop the cleanup workers. Pending queue entries are dropped; other
    /// clients' scanners will rediscover them.
    pub fn close(&self) {
        self.cleanup.close();
    }

    /// Every finished attempt is swept: its bucket joins the lost-attempts
    /// scan set, and the attempt itself is queued so forgotten state goes
    /// away even without a scanner pass.
    fn finish_attempt(&self, attempt: &AttemptContext) {
        let Some(atr) = attempt.atr_id() else {
            return;
        };
        self.cleanup.add_bucket(atr.bucket());
        if self.config.cleanup_client_attempts() {
            self.cleanup.queue().push(AtrCleanupEntry::for_own_attempt(
                atr,
                attempt.id().to_string(),
            ));
        }
    }
}
