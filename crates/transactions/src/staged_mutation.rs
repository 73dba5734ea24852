//! Staged-mutation queue
//!
//! The per-attempt, insertion-ordered set of pending writes. Staging already
//! happened against the server by the time an entry lands here; the queue is
//! what commit and rollback replay, one single-document CAS write per entry.
//!
//! Lookups are linear. Transactions are small; a map would buy nothing.

use crate::atr::{
    DocRecord, ATR_FIELD_DOCS_INSERTED, ATR_FIELD_DOCS_REMOVED, ATR_FIELD_DOCS_REPLACED,
};
use crate::attempt::AttemptContext;
use crate::doc::{TransactionGetResult, TXN_INTERFACE_PREFIX};
use crate::error::TransactionOperationFailed;
use crate::error_class::ErrorClass;
use crate::retry::{retry_op_exponential_backoff, RetryError, Retryable};
use hawser_kv::{DocumentId, KvError, MutateInOptions, MutateInSpec, StoreSemantics};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Kind of a staged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedMutationType {
    Insert,
    Replace,
    Remove,
}

/// One pending write: the staged document handle plus the content that will
/// become visible at commit (absent for removes).
#[derive(Debug, Clone)]
pub struct StagedMutation {
    pub doc: TransactionGetResult,
    pub content: Option<Value>,
    pub kind: StagedMutationType,
}

/// Ordered collection of an attempt's pending writes.
#[derive(Debug, Clone, Default)]
pub struct StagedMutationQueue {
    entries: Vec<StagedMutation>,
}

impl StagedMutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append, or collapse onto an existing entry for the same document.
    ///
    /// A replace over a staged insert stays an insert (the document still
    /// does not exist outside this attempt); a remove over a staged replace
    /// becomes a remove. Illegal combinations are rejected by the attempt
    /// before staging ever happens, so they cannot arrive here.
    pub fn add(&mut self, mutation: StagedMutation) {
        let position = self
            .entries
            .iter()
            .position(|e| e.doc.id() == mutation.doc.id());
        let Some(position) = position else {
            self.entries.push(mutation);
            return;
        };
        let existing = &mut self.entries[position];
        match (existing.kind, mutation.kind) {
            (StagedMutationType::Insert, StagedMutationType::Replace) => {
                trace!(id = %existing.doc.id(), "replace after insert, keeping insert");
                existing.doc = mutation.doc;
                existing.content = mutation.content;
            }
            (StagedMutationType::Replace, StagedMutationType::Replace) => {
                existing.doc = mutation.doc;
                existing.content = mutation.content;
            }
            (StagedMutationType::Replace, StagedMutationType::Remove) => {
                *existing = mutation;
            }
            (from, to) => {
                debug_assert!(false, "illegal staged-mutation collapse {:?} -> {:?}", from, to);
                *existing = mutation;
            }
        }
    }

    pub fn find_insert(&self, id: &DocumentId) -> Option<&StagedMutation> {
        self.find(id, StagedMutationType::Insert)
    }

    pub fn find_replace(&self, id: &DocumentId) -> Option<&StagedMutation> {
        self.find(id, StagedMutationType::Replace)
    }

    pub fn find_remove(&self, id: &DocumentId) -> Option<&StagedMutation> {
        self.find(id, StagedMutationType::Remove)
    }

    fn find(&self, id: &DocumentId, kind: StagedMutationType) -> Option<&StagedMutation> {
        self.entries
            .iter()
            .find(|e| e.kind == kind && e.doc.id() == id)
    }

    /// Any entry for this document, regardless of kind.
    pub fn find_any(&self, id: &DocumentId) -> Option<&StagedMutation> {
        self.entries.iter().find(|e| e.doc.id() == id)
    }

    /// Drop the entry for a document. Used when a staged insert is removed
    /// again within the same attempt.
    pub fn remove_entry(&mut self, id: &DocumentId) {
        self.entries.retain(|e| e.doc.id() != id);
    }

    pub fn empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[StagedMutation] {
        &self.entries
    }

    /// Specs recording the inserted/replaced/removed ID arrays under an ATR
    /// entry prefix, for ATR-COMMIT and ATR-ABORT writes.
    pub fn extract_to(&self, prefix: &str) -> Vec<MutateInSpec> {
        let records = |kind: StagedMutationType| -> Value {
            let docs: Vec<DocRecord> = self
                .entries
                .iter()
                .filter(|e| e.kind == kind)
                .map(|e| DocRecord::from(e.doc.id()))
                .collect();
            serde_json::to_value(docs).unwrap_or(Value::Array(Vec::new()))
        };
        vec![
            MutateInSpec::upsert_xattr(
                format!("{}{}", prefix, ATR_FIELD_DOCS_INSERTED),
                records(StagedMutationType::Insert),
            ),
            MutateInSpec::upsert_xattr(
                format!("{}{}", prefix, ATR_FIELD_DOCS_REPLACED),
                records(StagedMutationType::Replace),
            ),
            MutateInSpec::upsert_xattr(
                format!("{}{}", prefix, ATR_FIELD_DOCS_REMOVED),
                records(StagedMutationType::Remove),
            ),
        ]
    }

    /// Commit replay: make every staged write visible.
    ///
    /// Runs after ATR-COMMIT, so failures here must not fail the transaction;
    /// they are logged, the result is marked `unstaging_complete = false`,
    /// and the cleanup engine finishes the work.
    pub async fn commit(&self, ctx: &AttemptContext) {
        for entry in &self.entries {
            ctx.check_expiry_during_commit_or_rollback("commit_doc", Some(entry.doc.id().key()));
            if let Err(ec) = self.commit_entry(ctx, entry).await {
                warn!(
                    id = %entry.doc.id(),
                    error_class = %ec,
                    "failed to unstage document after commit, leaving to cleanup"
                );
                ctx.note_unstaging_incomplete();
            }
        }
    }

    async fn commit_entry(&self, ctx: &AttemptContext, entry: &StagedMutation) -> Result<(), ErrorClass> {
        let kv = ctx.kv();
        let durability = ctx.config().durability();
        match entry.kind {
            StagedMutationType::Remove => {
                if let Some(ec) = ctx.hooks().before_doc_removed.as_ref()(entry.doc.id().key()) {
                    return Err(ec);
                }
                kv.remove(entry.doc.id(), entry.doc.cas(), durability)
                    .await
                    .map_err(|e| ErrorClass::from(&e))?;
            }
            StagedMutationType::Insert => {
                if let Some(ec) = ctx.hooks().before_doc_committed.as_ref()(entry.doc.id().key()) {
                    return Err(ec);
                }
                // The staged document is a tombstone; a full insert both
                // surfaces the content and sheds the txn xattrs.
                let content = entry.content.clone().unwrap_or(Value::Null);
                kv.insert(entry.doc.id(), content, durability)
                    .await
                    .map_err(|e| ErrorClass::from(&e))?;
            }
            StagedMutationType::Replace => {
                if let Some(ec) = ctx.hooks().before_doc_committed.as_ref()(entry.doc.id().key()) {
                    return Err(ec);
                }
                let content = entry.content.clone().unwrap_or(Value::Null);
                let specs = vec![
                    MutateInSpec::remove_xattr(TXN_INTERFACE_PREFIX),
                    MutateInSpec::set_doc(content),
                ];
                let options = MutateInOptions {
                    cas: entry.doc.cas(),
                    store_semantics: StoreSemantics::Replace,
                    durability,
                    ..Default::default()
                };
                kv.mutate_in(entry.doc.id(), &specs, options)
                    .await
                    .map_err(|e| ErrorClass::from(&e))?;
            }
        }
        debug!(id = %entry.doc.id(), kind = ?entry.kind, "unstaged document");
        Ok(())
    }

    /// Rollback replay: reverse every staged write, leaving pre-transaction
    /// state behind.
    pub async fn rollback(&self, ctx: &AttemptContext) -> Result<(), TransactionOperationFailed> {
        for entry in &self.entries {
            ctx.check_expiry_during_commit_or_rollback("rollback_doc", Some(entry.doc.id().key()));
            self.rollback_entry(ctx, entry).await?;
        }
        Ok(())
    }

    async fn rollback_entry(
        &self,
        ctx: &AttemptContext,
        entry: &StagedMutation,
    ) -> Result<(), TransactionOperationFailed> {
        let hook = match entry.kind {
            StagedMutationType::Insert => &ctx.hooks().before_rollback_delete_inserted,
            _ => &ctx.hooks().before_doc_rolled_back,
        };

        let result = retry_op_exponential_backoff(Duration::from_millis(10), 5, || async {
            if let Some(ec) = hook.as_ref()(entry.doc.id().key()) {
                return match ec {
                    ErrorClass::FailTransient | ErrorClass::FailAmbiguous => Err(Retryable::Retry),
                    _ => Err(Retryable::Err(ec)),
                };
            }
            let options = MutateInOptions {
                cas: entry.doc.cas(),
                store_semantics: StoreSemantics::Replace,
                access_deleted: true,
                durability: ctx.config().durability(),
                ..Default::default()
            };
            let specs = vec![MutateInSpec::remove_xattr(TXN_INTERFACE_PREFIX)];
            match ctx.kv().mutate_in(entry.doc.id(), &specs, options).await {
                Ok(_) => Ok(()),
                Err(KvError::Temporary) | Err(KvError::Timeout) | Err(KvError::DurabilityAmbiguous) => {
                    Err(Retryable::Retry)
                }
                Err(e) => Err(Retryable::Err(ErrorClass::from(&e))),
            }
        })
        .await;

        match result {
            Ok(()) => {
                debug!(id = %entry.doc.id(), kind = ?entry.kind, "rolled back staged write");
                Ok(())
            }
            Err(RetryError::Op(ErrorClass::FailDocNotFound))
            | Err(RetryError::Op(ErrorClass::FailPathNotFound)) => {
                // Already unstaged, or the document vanished; either way the
                // staged write is gone.
                debug!(id = %entry.doc.id(), "staged write already gone during rollback");
                Ok(())
            }
            Err(RetryError::Op(ErrorClass::FailCasMismatch)) => {
                // Someone else already acted on the document (most likely
                // cleanup); nothing left for this attempt to reverse.
                warn!(id = %entry.doc.id(), "CAS changed under rollback, skipping");
                Ok(())
            }
            Err(RetryError::Op(ErrorClass::FailHard)) => Err(TransactionOperationFailed::new(
                ErrorClass::FailHard,
                format!("hard failure rolling back {}", entry.doc.id()),
            )
            .no_rollback()),
            Err(e) => {
                warn!(id = %entry.doc.id(), error = %e, "failed to roll back staged write, leaving to cleanup");
                Ok(())
            }
        }
    }
}
