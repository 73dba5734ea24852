//! Per-transaction context
//!
//! Created once per call to the runner. Owns the transaction identity, the
//! client-side start instant the expiry budget is measured against, and the
//! list of attempts. Attempts hold a reference to the context, never the
//! other way around.

use crate::atr::AttemptState;
use crate::config::TransactionConfig;
use crate::result::{TransactionAttempt, TransactionResult};
use hawser_common::{AttemptId, TransactionId};
use parking_lot::Mutex;
use std::time::Instant;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct TransactionContext {
    transaction_id: TransactionId,
    start_time: Instant,
    config: TransactionConfig,
    attempts: Mutex<Vec<TransactionAttempt>>,
    atr_id: Mutex<Option<String>>,
    atr_collection: Mutex<Option<String>>,
}

impl TransactionContext {
    pub fn new(config: TransactionConfig) -> Self {
        Self {
            transaction_id: TransactionId::new(),
            start_time: Instant::now(),
            config,
            attempts: Mutex::new(Vec::new()),
            atr_id: Mutex::new(None),
            atr_collection: Mutex::new(None),
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Record a fresh attempt.
    pub fn add_attempt(&self, attempt_id: AttemptId) {
        self.attempts.lock().push(TransactionAttempt {
            attempt_id: attempt_id.to_string(),
            state: AttemptState::NotStarted,
        });
        trace!(transaction_id = %self.transaction_id, %attempt_id, "added new attempt");
    }

    /// Update the recorded state of an attempt.
    pub fn update_attempt_state(&self, attempt_id: AttemptId, state: AttemptState) {
        let id = attempt_id.to_string();
        let mut attempts = self.attempts.lock();
        if let Some(attempt) = attempts.iter_mut().find(|a| a.attempt_id == id) {
            attempt.state = state;
        }
    }

    /// Freeze the transaction's ATR identity; first selection wins.
    pub fn set_atr(&self, atr_key: &str, collection_spec: &str) {
        let mut atr_id = self.atr_id.lock();
        if atr_id.is_none() {
            *atr_id = Some(atr_key.to_string());
            *self.atr_collection.lock() = Some(collection_spec.to_string());
        }
    }

    pub fn atr_id(&self) -> Option<String> {
        self.atr_id.lock().clone()
    }

    /// Whether the wall-clock expiry budget is spent.
    pub fn has_expired_client_side(&self) -> bool {
        let elapsed = self.start_time.elapsed();
        let expired = elapsed > self.config.expiration_time();
        if expired {
            debug!(
                transaction_id = %self.transaction_id,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.config.expiration_time().as_millis() as u64,
                "has expired client side"
            );
        }
        expired
    }

    /// Pause between attempts. The divisor keeps the pause proportional to
    /// the overall budget so short transactions retry promptly.
    pub async fn retry_delay(&self) {
        let delay = self.config.expiration_time() / 100;
        trace!(delay_ms = delay.as_millis() as u64, "sleeping before retrying attempt");
        tokio::time::sleep(delay).await;
    }

    /// Snapshot the transaction state for results and errors.
    pub fn result(&self, unstaging_complete: bool) -> TransactionResult {
        TransactionResult {
            transaction_id: self.transaction_id.to_string(),
            atr_id: self.atr_id.lock().clone(),
            atr_collection: self.atr_collection.lock().clone(),
            attempts: self.attempts.lock().clone(),
            unstaging_complete,
        }
    }
}
