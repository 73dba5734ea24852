//! Error model
//!
//! Internally every failure is a [`TransactionOperationFailed`] carrying
//! three orthogonal classifications: whether the runner may retry, whether
//! rollback should be attempted before returning, and what the failure turns
//! into at the library surface. The policy per error class is encoded once,
//! at the state-machine call sites, and never overridden per caller.

use crate::error_class::ErrorClass;
use crate::result::TransactionResult;
use thiserror::Error;

/// Underlying cause attached to a failure, surfaced to callers for
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExternalException {
    #[default]
    Unknown,
    ActiveTransactionRecordEntryNotFound,
    ActiveTransactionRecordFull,
    ActiveTransactionRecordNotFound,
    DocumentAlreadyInTransaction,
    DocumentExistsException,
    DocumentNotFoundException,
    PreviousOperationFailed,
    ForwardCompatibilityFailure,
    TransactionAbortedExternally,
}

/// What an internal failure becomes at the library surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalErrorToRaise {
    #[default]
    Failed,
    Expired,
    CommitAmbiguous,
    FailedPostCommit,
}

/// Internal failure raised out of attempt operations.
///
/// Built at the point of failure with the standard per-class policy, then
/// interpreted once by the runner.
#[derive(Debug, Clone, Error)]
#[error("transaction operation failed ({error_class}): {msg}")]
pub struct TransactionOperationFailed {
    error_class: ErrorClass,
    msg: String,
    retry: bool,
    rollback: bool,
    to_raise: FinalErrorToRaise,
    cause: ExternalException,
}

impl TransactionOperationFailed {
    pub fn new(error_class: ErrorClass, msg: impl Into<String>) -> Self {
        Self {
            error_class,
            msg: msg.into(),
            retry: false,
            rollback: true,
            to_raise: FinalErrorToRaise::Failed,
            cause: ExternalException::Unknown,
        }
    }

    /// A failure originating in the user's transaction body.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::new(ErrorClass::FailOther, msg)
    }

    /// The runner may retry the whole transaction.
    pub fn retry(mut self) -> Self {
        self.retry = true;
        self
    }

    /// Rollback must not be attempted before returning.
    pub fn no_rollback(mut self) -> Self {
        self.rollback = false;
        self
    }

    /// Surfaces as transaction expiry.
    pub fn expired(mut self) -> Self {
        self.to_raise = FinalErrorToRaise::Expired;
        self
    }

    /// Surfaces as an ambiguous commit.
    pub fn ambiguous(mut self) -> Self {
        self.to_raise = FinalErrorToRaise::CommitAmbiguous;
        self
    }

    /// The commit point already passed; the transaction succeeds with
    /// incomplete unstaging.
    pub fn failed_post_commit(mut self) -> Self {
        self.to_raise = FinalErrorToRaise::FailedPostCommit;
        self
    }

    pub fn cause(mut self, cause: ExternalException) -> Self {
        self.cause = cause;
        self
    }

    pub fn error_class(&self) -> ErrorClass {
        self.error_class
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    pub fn should_retry(&self) -> bool {
        self.retry
    }

    pub fn should_rollback(&self) -> bool {
        self.rollback
    }

    pub fn to_raise(&self) -> FinalErrorToRaise {
        self.to_raise
    }

    pub fn external_cause(&self) -> ExternalException {
        self.cause
    }
}

/// Errors raised out of [`Transactions::run`](crate::Transactions::run).
///
/// Each carries the state of the transaction at the time of the failure.
#[derive(Debug, Clone, Error)]
pub enum TransactionError {
    #[error("transaction failed: {msg}")]
    Failed {
        msg: String,
        cause: ExternalException,
        result: TransactionResult,
    },

    #[error("transaction expired: {msg}")]
    Expired {
        msg: String,
        result: TransactionResult,
    },

    #[error("transaction commit result unknown: {msg}")]
    CommitAmbiguous {
        msg: String,
        result: TransactionResult,
    },
}

impl TransactionError {
    /// State of the transaction at the time of the failure.
    pub fn result(&self) -> &TransactionResult {
        match self {
            TransactionError::Failed { result, .. }
            | TransactionError::Expired { result, .. }
            | TransactionError::CommitAmbiguous { result, .. } => result,
        }
    }
}
