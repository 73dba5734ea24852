//! Transaction results

use crate::atr::AttemptState;

/// Record of one attempt of a transaction.
#[derive(Debug, Clone)]
pub struct TransactionAttempt {
    pub attempt_id: String,
    pub state: AttemptState,
}

/// Outcome of a call to [`Transactions::run`](crate::Transactions::run).
#[derive(Debug, Clone)]
pub struct TransactionResult {
    /// The transaction's UUID.
    pub transaction_id: String,
    /// Key of the ATR anchoring the transaction, once a mutation selected one.
    pub atr_id: Option<String>,
    /// Collection spec of the ATR.
    pub atr_collection: Option<String>,
    /// One record per attempt, in order.
    pub attempts: Vec<TransactionAttempt>,
    /// False when post-commit unstaging was left to the cleanup engine.
    pub unstaging_complete: bool,
}
