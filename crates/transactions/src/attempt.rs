//! Attempt state machine
//!
//! One [`AttemptContext`] drives one try of a transaction body: it stages
//! mutations beside the visible document bodies, anchors the attempt in an
//! ATR, resolves write-write conflicts against other attempts, and walks the
//! ATR entry through `PENDING → COMMITTED → COMPLETED` (or `ABORTED →
//! ROLLED_BACK`).
//!
//! Every KV call is a suspension point. Operations issued by the body are
//! tracked in an op-list so commit and rollback can act as a barrier, and
//! ATR selection runs under an attempt-scoped async mutex so exactly one
//! mutation writes ATR-PENDING.

use crate::atr::{
    ActiveTransactionRecord, AttemptState, ATR_FIELD_ATTEMPTS, ATR_FIELD_EXPIRES_AFTER_MSECS,
    ATR_FIELD_START_COMMIT, ATR_FIELD_START_TIMESTAMP, ATR_FIELD_STATUS,
    ATR_FIELD_TIMESTAMP_ROLLBACK_START,
};
use crate::atr_ids;
use crate::context::TransactionContext;
use crate::doc::{
    TransactionGetResult, TransactionLinks, ATR_BUCKET_PATH, ATR_COLL_PATH, ATR_ID_PATH,
    ATTEMPT_ID_PATH, CRC32_OF_STAGING_PATH, OP_TYPE_PATH, RESTORE_CAS_PATH, RESTORE_EXPTIME_PATH,
    RESTORE_REVID_PATH, STAGED_DATA_PATH, TRANSACTION_ID_PATH, TXN_INTERFACE_PREFIX,
};
use crate::error::{ExternalException, TransactionOperationFailed};
use crate::error_class::ErrorClass;
use crate::forward_compat::{self, ForwardCompatResult, ForwardCompatStage};
use crate::hooks::AttemptHooks;
use crate::ops::{OpGuard, OpList};
use crate::retry::{retry_op_exponential_backoff, ExpDelay, RetryError, Retryable};
use crate::staged_mutation::{StagedMutation, StagedMutationQueue, StagedMutationType};
use crate::config::TransactionConfig;
use hawser_common::AttemptId;
use hawser_kv::{
    DocumentId, KvClient, LookupInOptions, LookupInSpec, MutateInOptions, MutateInSpec,
    StoreSemantics, MACRO_CAS, MACRO_VALUE_CRC32C,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const STAGE_GET: &str = "get";
const STAGE_INSERT: &str = "insert";
const STAGE_REPLACE: &str = "replace";
const STAGE_REMOVE: &str = "remove";
const STAGE_CREATE_STAGED_INSERT: &str = "create_staged_insert";
const STAGE_ATR_PENDING: &str = "atr_pending";
const STAGE_ATR_COMMIT: &str = "atr_commit";
const STAGE_ATR_COMMIT_AMBIGUITY_RESOLUTION: &str = "atr_commit_ambiguity_resolution";
const STAGE_ATR_COMPLETE: &str = "atr_complete";
const STAGE_ATR_ABORT: &str = "atr_abort";
const STAGE_ATR_ROLLBACK_COMPLETE: &str = "atr_rollback_complete";
const STAGE_BEFORE_COMMIT: &str = "before_commit";
const STAGE_ROLLBACK: &str = "rollback";

/// Outcome of reading the ATR status while resolving an ambiguous commit.
enum CommitResolution {
    /// The commit landed; proceed to unstaging.
    Committed,
    /// Still pending; ATR-COMMIT can safely be reissued.
    RetryCommit,
}

/// Handle for one try of a transaction body.
pub struct AttemptContext {
    overall: Arc<TransactionContext>,
    kv: Arc<dyn KvClient>,
    attempt_id: AttemptId,
    attempt_id_str: String,
    transaction_id_str: String,
    staged: Mutex<StagedMutationQueue>,
    atr_id: Mutex<Option<DocumentId>>,
    atr_select_lock: tokio::sync::Mutex<()>,
    state: Mutex<AttemptState>,
    op_list: OpList,
    is_done: AtomicBool,
    expiry_overtime_mode: AtomicBool,
    unstaging_complete: AtomicBool,
    errored: AtomicBool,
}

impl AttemptContext {
    pub(crate) fn new(overall: Arc<TransactionContext>, kv: Arc<dyn KvClient>) -> Self {
        let attempt_id = AttemptId::new();
        overall.add_attempt(attempt_id);
        let ctx = Self {
            attempt_id_str: attempt_id.to_string(),
            transaction_id_str: overall.transaction_id().to_string(),
            overall,
            kv,
            attempt_id,
            staged: Mutex::new(StagedMutationQueue::new()),
            atr_id: Mutex::new(None),
            atr_select_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(AttemptState::NotStarted),
            op_list: OpList::default(),
            is_done: AtomicBool::new(false),
            expiry_overtime_mode: AtomicBool::new(false),
            unstaging_complete: AtomicBool::new(true),
            errored: AtomicBool::new(false),
        };
        trace!(attempt_id = %ctx.attempt_id_str, "created attempt");
        ctx
    }

    /// This attempt's identifier.
    pub fn id(&self) -> AttemptId {
        self.attempt_id
    }

    /// The owning transaction's identifier, as a string.
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id_str
    }

    /// Current attempt state.
    pub fn state(&self) -> AttemptState {
        *self.state.lock()
    }

    /// Whether commit or rollback has already completed.
    pub fn is_done(&self) -> bool {
        self.is_done.load(Ordering::SeqCst)
    }

    pub(crate) fn atr_id(&self) -> Option<DocumentId> {
        self.atr_id.lock().clone()
    }

    pub(crate) fn kv(&self) -> &Arc<dyn KvClient> {
        &self.kv
    }

    pub(crate) fn config(&self) -> &TransactionConfig {
        self.overall.config()
    }

    pub(crate) fn hooks(&self) -> &AttemptHooks {
        self.overall.config().hooks()
    }

    pub(crate) fn note_unstaging_incomplete(&self) {
        self.unstaging_complete.store(false, Ordering::SeqCst);
    }

    pub(crate) fn unstaging_complete(&self) -> bool {
        self.unstaging_complete.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: AttemptState) {
        *self.state.lock() = state;
        self.overall.update_attempt_state(self.attempt_id, state);
    }

    fn atr_entry_prefix(&self) -> String {
        format!("{}.{}.", ATR_FIELD_ATTEMPTS, self.attempt_id_str)
    }

    fn atr_entry_path(&self) -> String {
        format!("{}.{}", ATR_FIELD_ATTEMPTS, self.attempt_id_str)
    }

    /// Record that an operation failed; commit refuses to run afterwards.
    fn fail(&self, err: TransactionOperationFailed) -> TransactionOperationFailed {
        self.errored.store(true, Ordering::SeqCst);
        err
    }

    fn begin_op(&self) -> Result<OpGuard<'_>, TransactionOperationFailed> {
        self.op_list.begin().ok_or_else(|| {
            self.fail(
                TransactionOperationFailed::new(
                    ErrorClass::FailOther,
                    "operation issued after commit or rollback started",
                )
                .no_rollback(),
            )
        })
    }

    fn check_if_done(&self) -> Result<(), TransactionOperationFailed> {
        if self.is_done() {
            return Err(self.fail(
                TransactionOperationFailed::new(
                    ErrorClass::FailOther,
                    "cannot perform operations after transaction has been committed or rolled back",
                )
                .no_rollback(),
            ));
        }
        Ok(())
    }

    // ---- expiry -----------------------------------------------------------

    fn has_expired_client_side(&self, stage: &str, doc_id: Option<&str>) -> bool {
        let expired = self.overall.has_expired_client_side();
        let hook = (self.hooks().has_expired_client_side)(stage, doc_id);
        if expired {
            debug!(attempt_id = %self.attempt_id_str, stage, "expired client side");
        }
        if hook {
            debug!(attempt_id = %self.attempt_id_str, stage, "fake expiry via hook");
        }
        expired || hook
    }

    /// Pre-commit expiry check; on trip, enter expiry-overtime mode so the
    /// ensuing rollback ignores further expiries and bails on any failure.
    fn check_expiry_pre_commit(&self, stage: &str, doc_id: Option<&str>) -> bool {
        if self.has_expired_client_side(stage, doc_id) {
            debug!(
                attempt_id = %self.attempt_id_str,
                stage,
                "expired, entering expiry-overtime mode; one attempt to rollback"
            );
            self.expiry_overtime_mode.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    fn error_if_expired_and_not_in_overtime(
        &self,
        stage: &str,
        doc_id: Option<&str>,
    ) -> Option<ErrorClass> {
        if self.expiry_overtime_mode.load(Ordering::SeqCst) {
            trace!(stage, "skipping expiry check, already in expiry-overtime");
            return None;
        }
        if self.has_expired_client_side(stage, doc_id) {
            debug!(stage, "expired");
            return Some(ErrorClass::FailExpiry);
        }
        None
    }

    /// During commit or rollback an expiry only flips overtime mode; the
    /// in-flight pass runs to its end and further errors surface as expired.
    pub(crate) fn check_expiry_during_commit_or_rollback(&self, stage: &str, doc_id: Option<&str>) {
        if !self.expiry_overtime_mode.load(Ordering::SeqCst) {
            if self.has_expired_client_side(stage, doc_id) {
                debug!(
                    attempt_id = %self.attempt_id_str,
                    stage,
                    "expired, entering expiry-overtime mode; one attempt to complete"
                );
                self.expiry_overtime_mode.store(true, Ordering::SeqCst);
            }
        } else {
            trace!(stage, "ignoring expiry, already in expiry-overtime mode");
        }
    }

    fn in_overtime(&self) -> bool {
        self.expiry_overtime_mode.load(Ordering::SeqCst)
    }

    // ---- forward compat ---------------------------------------------------

    async fn check_forward_compat(
        &self,
        stage: ForwardCompatStage,
        fc: Option<&Value>,
    ) -> Result<(), TransactionOperationFailed> {
        match forward_compat::check(stage, fc) {
            ForwardCompatResult::Ok => Ok(()),
            ForwardCompatResult::Retry { delay } => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Err(TransactionOperationFailed::new(
                    ErrorClass::FailOther,
                    format!("forward compatibility requires retry at {}", stage),
                )
                .retry()
                .cause(ExternalException::ForwardCompatibilityFailure))
            }
            ForwardCompatResult::Fail => Err(TransactionOperationFailed::new(
                ErrorClass::FailOther,
                format!("forward compatibility blocks this client at {}", stage),
            )
            .cause(ExternalException::ForwardCompatibilityFailure)),
        }
    }

    // ---- get --------------------------------------------------------------

    /// Fetch a document, failing when it does not exist.
    pub async fn get(
        &self,
        id: &DocumentId,
    ) -> Result<TransactionGetResult, TransactionOperationFailed> {
        let _op = self.begin_op()?;
        self.check_if_done()?;
        match self.get_with_hook(id).await {
            Err(ec) => Err(self.fail(self.map_get_error(ec, id))),
            Ok(None) => Err(self.fail(TransactionOperationFailed::new(
                ErrorClass::FailDocNotFound,
                "document not found",
            ))),
            Ok(Some(doc)) => {
                if let Err(e) = self
                    .check_forward_compat(ForwardCompatStage::Gets, doc.links().forward_compat())
                    .await
                {
                    return Err(self.fail(e));
                }
                Ok(doc)
            }
        }
    }

    /// Fetch a document, returning `None` when it does not exist.
    pub async fn get_optional(
        &self,
        id: &DocumentId,
    ) -> Result<Option<TransactionGetResult>, TransactionOperationFailed> {
        let _op = self.begin_op()?;
        self.check_if_done()?;
        match self.get_with_hook(id).await {
            Err(ErrorClass::FailDocNotFound) => Ok(None),
            Err(ec) => Err(self.fail(self.map_get_error(ec, id))),
            Ok(None) => Ok(None),
            Ok(Some(doc)) => {
                if let Err(e) = self
                    .check_forward_compat(ForwardCompatStage::Gets, doc.links().forward_compat())
                    .await
                {
                    return Err(self.fail(e));
                }
                Ok(Some(doc))
            }
        }
    }

    async fn get_with_hook(
        &self,
        id: &DocumentId,
    ) -> Result<Option<TransactionGetResult>, ErrorClass> {
        let res = self.do_get(id).await?;
        if let Some(ec) = (self.hooks().after_get_complete)(id.key()) {
            return Err(ec);
        }
        Ok(res)
    }

    fn map_get_error(&self, ec: ErrorClass, id: &DocumentId) -> TransactionOperationFailed {
        match ec {
            ErrorClass::FailExpiry => {
                TransactionOperationFailed::new(ec, "transaction expired during get").expired()
            }
            ErrorClass::FailDocNotFound => {
                TransactionOperationFailed::new(ec, "document not found")
            }
            ErrorClass::FailTransient => {
                TransactionOperationFailed::new(ec, "transient failure in get").retry()
            }
            ErrorClass::FailHard => {
                TransactionOperationFailed::new(ec, "fail hard in get").no_rollback()
            }
            _ => TransactionOperationFailed::new(
                ErrorClass::FailOther,
                format!("got error while getting doc {}", id.key()),
            ),
        }
    }

    async fn do_get(&self, id: &DocumentId) -> Result<Option<TransactionGetResult>, ErrorClass> {
        if self.check_expiry_pre_commit(STAGE_GET, Some(id.key())) {
            return Err(ErrorClass::FailExpiry);
        }

        // Own writes are served from the staged queue.
        {
            let staged = self.staged.lock();
            if let Some(own) = staged
                .find_replace(id)
                .or_else(|| staged.find_insert(id))
            {
                debug!(id = %id, "found own-write of mutated doc");
                return Ok(Some(own.doc.with_content(own.content.clone())));
            }
            if staged.find_remove(id).is_some() {
                debug!(id = %id, "found own-write of removed doc");
                return Ok(None);
            }
        }

        if let Some(ec) = (self.hooks().before_doc_get)(id.key()) {
            return Err(ec);
        }

        let Some(doc) = self.get_doc(id).await? else {
            return Ok(None);
        };

        if !doc.links().is_document_in_transaction() {
            if doc.links().is_deleted() {
                debug!(id = %id, "doc not in txn and deleted, hiding it");
                return Ok(None);
            }
            return Ok(Some(doc));
        }

        debug!(id = %id, "doc in transaction, resolving via its atr");
        let Some(atr_doc_id) = doc.links().atr_document_id() else {
            return Ok(visible_body(doc));
        };
        match ActiveTransactionRecord::fetch(self.kv.as_ref(), &atr_doc_id).await {
            Ok(Some(atr)) => {
                let entry = doc
                    .links()
                    .staged_attempt_id()
                    .and_then(|aid| atr.entry_for(aid));
                let Some(entry) = entry else {
                    // The owning attempt is gone; the ATR stuck around long
                    // enough that this is equivalent to not-in-txn.
                    return Ok(visible_body(doc));
                };

                if entry.attempt_id() == self.attempt_id_str {
                    // Reading our own write; backup for the in-memory path.
                    let staged = doc.links().staged_content().cloned();
                    return Ok(Some(doc.with_content(staged)));
                }

                match forward_compat::check(
                    ForwardCompatStage::GetsReadingAtr,
                    entry.forward_compat(),
                ) {
                    ForwardCompatResult::Ok => {}
                    _ => return Err(ErrorClass::FailOther),
                }

                if entry.has_expired(0) {
                    debug!(age_ms = entry.age_ms(), "blocking atr entry has expired, ignoring");
                    return Ok(visible_body(doc));
                }

                match entry.state() {
                    AttemptState::Committed => {
                        if doc.links().is_document_being_removed() {
                            Ok(None)
                        } else {
                            let staged = doc.links().staged_content().cloned();
                            Ok(Some(doc.with_content(staged)))
                        }
                    }
                    _ => Ok(visible_body(doc)),
                }
            }
            Ok(None) | Err(_) => {
                // Could not read the ATR; fall back to the visible body,
                // hiding half-born inserts.
                Ok(visible_body(doc))
            }
        }
    }

    /// One transactional lookup: all `txn.*` xattrs, metadata and body.
    pub(crate) async fn get_doc(
        &self,
        id: &DocumentId,
    ) -> Result<Option<TransactionGetResult>, ErrorClass> {
        let specs = crate::doc::transactional_lookup_specs();
        match self
            .kv
            .lookup_in(id, &specs, LookupInOptions { access_deleted: true })
            .await
        {
            Ok(res) => Ok(Some(TransactionGetResult::from_lookup(id.clone(), &res))),
            Err(hawser_kv::KvError::DocumentNotFound) => Ok(None),
            Err(e) => {
                trace!(id = %id, error = %e, "get_doc got error");
                Err(ErrorClass::from(&e))
            }
        }
    }

    // ---- staging ----------------------------------------------------------

    fn map_staging_error(&self, ec: ErrorClass, msg: String) -> TransactionOperationFailed {
        let err = TransactionOperationFailed::new(ec, msg);
        match ec {
            ErrorClass::FailExpiry => {
                self.expiry_overtime_mode.store(true, Ordering::SeqCst);
                err.expired()
            }
            ErrorClass::FailDocNotFound
            | ErrorClass::FailDocAlreadyExists
            | ErrorClass::FailCasMismatch
            | ErrorClass::FailTransient
            | ErrorClass::FailAmbiguous => err.retry(),
            ErrorClass::FailHard => err.no_rollback(),
            _ => err,
        }
    }

    fn create_staging_specs(
        &self,
        doc: &TransactionGetResult,
        op: &str,
        content: Option<&Value>,
    ) -> Result<Vec<MutateInSpec>, TransactionOperationFailed> {
        let atr = self.atr_id().ok_or_else(|| {
            TransactionOperationFailed::new(ErrorClass::FailOther, "ATR ID is not initialized")
        })?;
        let mut specs = vec![
            MutateInSpec::upsert_xattr(TRANSACTION_ID_PATH, json!(self.transaction_id_str)),
            MutateInSpec::upsert_xattr(ATTEMPT_ID_PATH, json!(self.attempt_id_str)),
            MutateInSpec::upsert_xattr(ATR_ID_PATH, json!(atr.key())),
            MutateInSpec::upsert_xattr(ATR_BUCKET_PATH, json!(atr.bucket())),
            MutateInSpec::upsert_xattr(ATR_COLL_PATH, json!(atr.collection_spec())),
            MutateInSpec::upsert_xattr_macro(CRC32_OF_STAGING_PATH, MACRO_VALUE_CRC32C),
            MutateInSpec::upsert_xattr(OP_TYPE_PATH, json!(op)),
        ];
        if let Some(meta) = doc.metadata() {
            if let Some(cas) = meta.cas {
                specs.push(MutateInSpec::upsert_xattr(RESTORE_CAS_PATH, json!(cas)));
            }
            if let Some(revid) = &meta.revid {
                specs.push(MutateInSpec::upsert_xattr(RESTORE_REVID_PATH, json!(revid)));
            }
            if let Some(exptime) = meta.exptime {
                specs.push(MutateInSpec::upsert_xattr(RESTORE_EXPTIME_PATH, json!(exptime)));
            }
        }
        if let Some(content) = content {
            specs.push(MutateInSpec::upsert_xattr(STAGED_DATA_PATH, content.clone()));
        }
        Ok(specs)
    }

    /// Stage a replacement of `doc` with `content`.
    pub async fn replace(
        &self,
        doc: &TransactionGetResult,
        content: Value,
    ) -> Result<TransactionGetResult, TransactionOperationFailed> {
        let _op = self.begin_op()?;
        self.check_if_done()?;
        trace!(id = %doc.id(), "replacing doc");

        if self.staged.lock().find_remove(doc.id()).is_some() {
            return Err(self.fail(TransactionOperationFailed::new(
                ErrorClass::FailOther,
                "cannot replace a document removed in the same transaction",
            )));
        }
        if self.check_expiry_pre_commit(STAGE_REPLACE, Some(doc.id().key())) {
            return Err(self.fail(
                TransactionOperationFailed::new(ErrorClass::FailExpiry, "transaction expired")
                    .expired(),
            ));
        }

        if let Err(e) = self
            .check_and_handle_blocking_transactions(doc, ForwardCompatStage::WwcReplacing)
            .await
        {
            return Err(self.fail(e));
        }
        if let Err(e) = self.select_atr_if_needed(doc.id()).await {
            return Err(self.fail(e));
        }

        if let Some(ec) = (self.hooks().before_staged_replace)(doc.id().key()) {
            return Err(self.fail(
                self.map_staging_error(ec, "before_staged_replace hook raised error".into()),
            ));
        }

        let specs = match self.create_staging_specs(doc, "replace", Some(&content)) {
            Ok(specs) => specs,
            Err(e) => return Err(self.fail(e)),
        };
        let options = MutateInOptions {
            cas: doc.cas(),
            store_semantics: StoreSemantics::Replace,
            access_deleted: true,
            durability: self.config().durability(),
            ..Default::default()
        };
        trace!(id = %doc.id(), cas = doc.cas(), "about to stage replace");
        match self.kv.mutate_in(doc.id(), &specs, options).await {
            Ok(res) => {
                if let Some(ec) = (self.hooks().after_staged_replace_complete)(doc.id().key()) {
                    return Err(self.fail(self.map_staging_error(
                        ec,
                        "after_staged_replace_complete hook raised error".into(),
                    )));
                }
                let mut out = doc.with_content(Some(content.clone()));
                out.set_cas(res.cas);
                trace!(id = %doc.id(), cas = res.cas, "staged replace");
                self.staged.lock().add(StagedMutation {
                    doc: out.clone(),
                    content: Some(content),
                    kind: StagedMutationType::Replace,
                });
                Ok(out)
            }
            Err(e) => {
                Err(self.fail(self.map_staging_error(ErrorClass::from(&e), e.to_string())))
            }
        }
    }

    /// Stage removal of `doc`.
    pub async fn remove(
        &self,
        doc: &TransactionGetResult,
    ) -> Result<(), TransactionOperationFailed> {
        let _op = self.begin_op()?;
        self.check_if_done()?;
        trace!(id = %doc.id(), "removing doc");

        if self.check_expiry_pre_commit(STAGE_REMOVE, Some(doc.id().key())) {
            return Err(self.fail(
                TransactionOperationFailed::new(ErrorClass::FailExpiry, "transaction expired")
                    .expired(),
            ));
        }

        // Removing a document this attempt inserted collapses locally: strip
        // the staged tombstone and forget the entry, leaving no ATR trace.
        let own_insert = self.staged.lock().find_insert(doc.id()).cloned();
        if let Some(own_insert) = own_insert {
            debug!(id = %doc.id(), "removing doc inserted in this attempt, collapsing locally");
            let specs = vec![MutateInSpec::remove_xattr(TXN_INTERFACE_PREFIX)];
            let options = MutateInOptions {
                cas: own_insert.doc.cas(),
                store_semantics: StoreSemantics::Replace,
                access_deleted: true,
                durability: self.config().durability(),
                ..Default::default()
            };
            return match self.kv.mutate_in(doc.id(), &specs, options).await {
                Ok(_) => {
                    self.staged.lock().remove_entry(doc.id());
                    Ok(())
                }
                Err(e) => {
                    Err(self.fail(self.map_staging_error(ErrorClass::from(&e), e.to_string())))
                }
            };
        }

        if self.staged.lock().find_remove(doc.id()).is_some() {
            return Err(self.fail(TransactionOperationFailed::new(
                ErrorClass::FailOther,
                "cannot remove a document already removed in this transaction",
            )));
        }

        if let Err(e) = self
            .check_and_handle_blocking_transactions(doc, ForwardCompatStage::WwcRemoving)
            .await
        {
            return Err(self.fail(e));
        }
        if let Err(e) = self.select_atr_if_needed(doc.id()).await {
            return Err(self.fail(e));
        }

        if let Some(ec) = (self.hooks().before_staged_remove)(doc.id().key()) {
            return Err(self.fail(
                self.map_staging_error(ec, "before_staged_remove hook raised error".into()),
            ));
        }

        let specs = match self.create_staging_specs(doc, "remove", None) {
            Ok(specs) => specs,
            Err(e) => return Err(self.fail(e)),
        };
        let options = MutateInOptions {
            cas: doc.cas(),
            store_semantics: StoreSemantics::Replace,
            access_deleted: doc.links().is_deleted(),
            durability: self.config().durability(),
            ..Default::default()
        };
        trace!(id = %doc.id(), cas = doc.cas(), "about to stage remove");
        match self.kv.mutate_in(doc.id(), &specs, options).await {
            Ok(res) => {
                if let Some(ec) = (self.hooks().after_staged_remove_complete)(doc.id().key()) {
                    return Err(self.fail(self.map_staging_error(
                        ec,
                        "after_staged_remove_complete hook raised error".into(),
                    )));
                }
                let mut out = doc.clone();
                out.set_cas(res.cas);
                trace!(id = %doc.id(), cas = res.cas, "staged remove");
                self.staged.lock().add(StagedMutation {
                    doc: out,
                    content: None,
                    kind: StagedMutationType::Remove,
                });
                Ok(())
            }
            Err(e) => {
                Err(self.fail(self.map_staging_error(ErrorClass::from(&e), e.to_string())))
            }
        }
    }

    /// Stage insertion of a new document.
    pub async fn insert(
        &self,
        id: &DocumentId,
        content: Value,
    ) -> Result<TransactionGetResult, TransactionOperationFailed> {
        let _op = self.begin_op()?;
        self.check_if_done()?;

        if self.staged.lock().find_any(id).is_some() {
            return Err(self.fail(TransactionOperationFailed::new(
                ErrorClass::FailOther,
                "cannot insert a document that has already been mutated in this transaction",
            )));
        }
        if self.check_expiry_pre_commit(STAGE_INSERT, Some(id.key())) {
            return Err(self.fail(
                TransactionOperationFailed::new(ErrorClass::FailExpiry, "transaction expired")
                    .expired(),
            ));
        }
        if let Err(e) = self.select_atr_if_needed(id).await {
            return Err(self.fail(e));
        }

        let mut delay = ExpDelay::new(
            Duration::from_millis(5),
            Duration::from_millis(300),
            self.config().expiration_time(),
        );
        let mut cas = 0u64;
        loop {
            match self.create_staged_insert(id, &content, cas, &mut delay).await {
                Ok(Ok(out)) => return Ok(out),
                Ok(Err(retry_cas)) => cas = retry_cas,
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    /// One staging try for an insert. `Ok(Err(cas))` means retry with that
    /// CAS; the document turned out to be an overwritable tombstone or a
    /// foreign staged insert that has since unblocked.
    async fn create_staged_insert(
        &self,
        id: &DocumentId,
        content: &Value,
        cas: u64,
        delay: &mut ExpDelay,
    ) -> Result<Result<TransactionGetResult, u64>, TransactionOperationFailed> {
        if let Some(ec) = self.error_if_expired_and_not_in_overtime(STAGE_CREATE_STAGED_INSERT, Some(id.key()))
        {
            let retry_cas = self
                .staged_insert_error(id, content, cas, delay, ec, "expired in create_staged_insert")
                .await?;
            return Ok(Err(retry_cas));
        }
        if let Some(ec) = (self.hooks().before_staged_insert)(id.key()) {
            let retry_cas = self
                .staged_insert_error(id, content, cas, delay, ec, "before_staged_insert hook raised error")
                .await?;
            return Ok(Err(retry_cas));
        }

        debug!(id = %id, cas, "about to stage insert");
        let atr = self.atr_id().ok_or_else(|| {
            TransactionOperationFailed::new(ErrorClass::FailOther, "ATR ID is not initialized")
        })?;
        let specs = vec![
            MutateInSpec::upsert_xattr(TRANSACTION_ID_PATH, json!(self.transaction_id_str)),
            MutateInSpec::upsert_xattr(ATTEMPT_ID_PATH, json!(self.attempt_id_str)),
            MutateInSpec::upsert_xattr(ATR_ID_PATH, json!(atr.key())),
            MutateInSpec::upsert_xattr(STAGED_DATA_PATH, content.clone()),
            MutateInSpec::upsert_xattr(ATR_BUCKET_PATH, json!(id.bucket())),
            MutateInSpec::upsert_xattr(ATR_COLL_PATH, json!(atr.collection_spec())),
            MutateInSpec::upsert_xattr(OP_TYPE_PATH, json!("insert")),
            MutateInSpec::upsert_xattr_macro(CRC32_OF_STAGING_PATH, MACRO_VALUE_CRC32C),
        ];
        let options = MutateInOptions {
            cas,
            store_semantics: if cas == 0 {
                StoreSemantics::Insert
            } else {
                StoreSemantics::Replace
            },
            access_deleted: true,
            create_as_deleted: true,
            durability: self.config().durability(),
        };

        match self.kv.mutate_in(id, &specs, options).await {
            Ok(res) => {
                if let Some(ec) = (self.hooks().after_staged_insert_complete)(id.key()) {
                    let retry_cas = self
                        .staged_insert_error(
                            id,
                            content,
                            cas,
                            delay,
                            ec,
                            "after_staged_insert_complete hook raised error",
                        )
                        .await?;
                    return Ok(Err(retry_cas));
                }
                debug!(id = %id, cas = res.cas, "inserted staged doc");
                let links = TransactionLinks::for_staged_write(
                    &atr,
                    self.transaction_id_str.clone(),
                    self.attempt_id_str.clone(),
                    Some(content.clone()),
                    "insert",
                    true,
                );
                let out = TransactionGetResult::new(
                    id.clone(),
                    Some(content.clone()),
                    res.cas,
                    links,
                    None,
                );
                self.staged.lock().add(StagedMutation {
                    doc: out.clone(),
                    content: Some(content.clone()),
                    kind: StagedMutationType::Insert,
                });
                Ok(Ok(out))
            }
            Err(e) => {
                let ec = ErrorClass::from(&e);
                let retry_cas = self
                    .staged_insert_error(id, content, cas, delay, ec, &e.to_string())
                    .await?;
                Ok(Err(retry_cas))
            }
        }
    }

    /// Resolve a staging failure during insert. Returns the CAS to retry
    /// with, or the final failure.
    async fn staged_insert_error(
        &self,
        id: &DocumentId,
        _content: &Value,
        cas: u64,
        delay: &mut ExpDelay,
        ec: ErrorClass,
        msg: &str,
    ) -> Result<u64, TransactionOperationFailed> {
        trace!(id = %id, error_class = %ec, msg, "create_staged_insert got error");
        if self.in_overtime() {
            return Err(TransactionOperationFailed::new(
                ErrorClass::FailExpiry,
                "attempt timed out",
            )
            .expired());
        }
        match ec {
            ErrorClass::FailExpiry => {
                self.expiry_overtime_mode.store(true, Ordering::SeqCst);
                Err(TransactionOperationFailed::new(ec, "attempt timed out").expired())
            }
            ErrorClass::FailTransient => {
                Err(TransactionOperationFailed::new(ec, "transient error in insert").retry())
            }
            ErrorClass::FailAmbiguous => {
                debug!("ambiguous error in create_staged_insert, retrying");
                self.insert_delay(delay).await?;
                Ok(cas)
            }
            ErrorClass::FailHard => {
                Err(TransactionOperationFailed::new(ec, msg.to_string()).no_rollback())
            }
            ErrorClass::FailOther => {
                Err(TransactionOperationFailed::new(ec, msg.to_string()))
            }
            ErrorClass::FailDocAlreadyExists | ErrorClass::FailCasMismatch => {
                debug!(id = %id, "found existing doc during staged insert, may still be able to insert");
                if let Some(hec) = (self.hooks().before_get_doc_in_exists_during_staged_insert)(id.key())
                {
                    return Err(self.insert_exists_get_error(hec));
                }
                let doc = match self.get_doc(id).await {
                    Err(gec) => return Err(self.insert_exists_get_error(gec)),
                    Ok(None) => {
                        trace!(id = %id, "doc vanished while handling staged-insert conflict");
                        return Err(TransactionOperationFailed::new(
                            ErrorClass::FailDocNotFound,
                            "insert failed as the doc existed, but now seems to not exist",
                        )
                        .retry());
                    }
                    Ok(Some(doc)) => doc,
                };
                debug!(
                    id = %id,
                    in_txn = doc.links().is_document_in_transaction(),
                    is_deleted = doc.links().is_deleted(),
                    "document exists"
                );
                self.check_forward_compat(
                    ForwardCompatStage::WwcInsertingGet,
                    doc.links().forward_compat(),
                )
                .await?;

                if !doc.links().is_document_in_transaction() {
                    if doc.links().is_deleted() {
                        // A bare tombstone; retry at its CAS.
                        debug!(id = %id, cas = doc.cas(), "found stale tombstone, retrying with its cas");
                        self.insert_delay(delay).await?;
                        return Ok(doc.cas());
                    }
                    return Err(TransactionOperationFailed::new(
                        ErrorClass::FailDocAlreadyExists,
                        "document already exists",
                    )
                    .cause(ExternalException::DocumentExistsException));
                }
                if doc.links().op() != Some("insert") {
                    return Err(TransactionOperationFailed::new(
                        ErrorClass::FailDocAlreadyExists,
                        "document exists and is not a staged insert",
                    )
                    .cause(ExternalException::DocumentExistsException));
                }
                // A foreign staged insert; wait for its attempt to resolve,
                // then overwrite at its CAS.
                self.check_and_handle_blocking_transactions(&doc, ForwardCompatStage::WwcInserting)
                    .await?;
                debug!(id = %id, cas = doc.cas(), "foreign staged insert unblocked, retrying with its cas");
                self.insert_delay(delay).await?;
                Ok(doc.cas())
            }
            _ => Err(TransactionOperationFailed::new(ec, msg.to_string()).retry()),
        }
    }

    fn insert_exists_get_error(&self, ec: ErrorClass) -> TransactionOperationFailed {
        if self.in_overtime() {
            return TransactionOperationFailed::new(ErrorClass::FailExpiry, "attempt timed out")
                .expired();
        }
        match ec {
            ErrorClass::FailExpiry => {
                self.expiry_overtime_mode.store(true, Ordering::SeqCst);
                TransactionOperationFailed::new(ec, "attempt timed out").expired()
            }
            ErrorClass::FailTransient | ErrorClass::FailPathNotFound => {
                TransactionOperationFailed::new(ec, "error fetching doc during staged insert")
                    .retry()
            }
            ErrorClass::FailOther => {
                TransactionOperationFailed::new(ec, "failed fetching doc during staged insert")
            }
            ErrorClass::FailHard => {
                TransactionOperationFailed::new(ec, "failed fetching doc during staged insert")
                    .no_rollback()
            }
            _ => TransactionOperationFailed::new(ec, "failed fetching doc during staged insert")
                .retry(),
        }
    }

    async fn insert_delay(
        &self,
        delay: &mut ExpDelay,
    ) -> Result<(), TransactionOperationFailed> {
        delay.delay().await.map_err(|_| {
            self.expiry_overtime_mode.store(true, Ordering::SeqCst);
            TransactionOperationFailed::new(ErrorClass::FailExpiry, "timed out during insert")
                .expired()
        })
    }

    // ---- write-write conflicts --------------------------------------------

    /// Defer to another attempt staged on `doc` until it terminates or is
    /// observed expired.
    async fn check_and_handle_blocking_transactions(
        &self,
        doc: &TransactionGetResult,
        stage: ForwardCompatStage,
    ) -> Result<(), TransactionOperationFailed> {
        if !doc.links().has_staged_write() {
            return Ok(());
        }
        // Compare transaction rather than attempt id: a previous attempt of
        // this transaction may have staged the doc before an ambiguous retry.
        if doc.links().staged_transaction_id() == Some(self.transaction_id()) {
            debug!(id = %doc.id(), "doc already written by this transaction, ok to continue");
            return Ok(());
        }

        let (atr_doc_id, blocking_attempt) = match (
            doc.links().atr_document_id(),
            doc.links().staged_attempt_id(),
        ) {
            (Some(atr_doc_id), Some(attempt)) => (atr_doc_id, attempt.to_string()),
            _ => {
                // Staged by a foreign transaction but missing the metadata
                // needed to consult its ATR. Overwriting could mask an
                // inconsistency, so fail this attempt and let the retry
                // observe a settled state.
                warn!(
                    id = %doc.id(),
                    "doc staged by another transaction without enough info to check its atr"
                );
                return Err(write_write_conflict());
            }
        };

        debug!(id = %doc.id(), "doc in another txn, checking atr");
        self.check_forward_compat(stage, doc.links().forward_compat())
            .await?;
        let mut delay = ExpDelay::new(
            Duration::from_millis(50),
            Duration::from_millis(500),
            Duration::from_secs(1),
        );
        loop {
            if delay.delay().await.is_err() {
                // Pacer exhausted with the foreign attempt still live.
                return Err(write_write_conflict());
            }
            if (self.hooks().before_check_atr_entry_for_blocking_doc)(doc.id().key()).is_some() {
                return Err(write_write_conflict());
            }
            match ActiveTransactionRecord::fetch(self.kv.as_ref(), &atr_doc_id).await {
                Ok(Some(atr)) => {
                    let Some(entry) = atr.entry_for(&blocking_attempt) else {
                        debug!("no blocking atr entry");
                        return Ok(());
                    };
                    self.check_forward_compat(
                        ForwardCompatStage::WwcReadingAtr,
                        entry.forward_compat(),
                    )
                    .await?;
                    if entry.has_expired(0) {
                        debug!(age_ms = entry.age_ms(), "blocking atr entry has expired, ignoring");
                        return Ok(());
                    }
                    if entry.state().is_terminal() {
                        debug!(state = %entry.state(), "blocking atr entry is terminal, ignoring");
                        return Ok(());
                    }
                    debug!(state = %entry.state(), "blocking atr entry still active, retrying");
                }
                Ok(None) => {
                    debug!("blocking atr does not exist");
                    return Ok(());
                }
                Err(_) => return Err(write_write_conflict()),
            }
        }
    }

    // ---- ATR lifecycle ----------------------------------------------------

    /// The first mutation selects the ATR; the selection is frozen for the
    /// attempt and ATR-PENDING is written before the mutation stages.
    async fn select_atr_if_needed(
        &self,
        id: &DocumentId,
    ) -> Result<(), TransactionOperationFailed> {
        let _guard = self.atr_select_lock.lock().await;
        if self.atr_id.lock().is_some() {
            trace!("atr exists, moving on");
            return Ok(());
        }

        let (vbucket, atr_key) = match (self.hooks().random_atr_id_for_vbucket)(id.key()) {
            Some(key) => (None, key),
            None => {
                let vbucket = atr_ids::vbucket_for_key(id.key());
                (Some(vbucket), atr_ids::atr_id_for_vbucket(vbucket).to_string())
            }
        };
        let atr_doc = DocumentId::in_default_collection(id.bucket(), &atr_key);
        *self.atr_id.lock() = Some(atr_doc.clone());
        self.overall.set_atr(&atr_key, &atr_doc.collection_spec());
        self.set_state(AttemptState::NotStarted);
        debug!(
            id = %id,
            ?vbucket,
            atr = %atr_key,
            "first mutated doc in transaction, selected atr"
        );
        self.set_atr_pending_locked(&atr_doc).await
    }

    /// Write the PENDING entry while holding the attempt lock.
    async fn set_atr_pending_locked(
        &self,
        atr: &DocumentId,
    ) -> Result<(), TransactionOperationFailed> {
        if !self.staged.lock().empty() {
            return Ok(());
        }
        let prefix = self.atr_entry_prefix();
        loop {
            if let Some(ec) = self.error_if_expired_and_not_in_overtime(STAGE_ATR_PENDING, None) {
                return Err(
                    TransactionOperationFailed::new(ec, "transaction expired setting ATR")
                        .expired(),
                );
            }

            let ec = match (self.hooks().before_atr_pending)("") {
                Some(ec) => Some((ec, "before_atr_pending hook raised error".to_string())),
                None => {
                    debug!(atr = %atr, "updating atr to pending");
                    let expires_ms = self.config().expiration_time().as_millis() as u64;
                    let specs = vec![
                        MutateInSpec::add_xattr(
                            format!("{}{}", prefix, ATR_FIELD_STATUS),
                            json!(AttemptState::Pending.to_string()),
                        ),
                        MutateInSpec::add_xattr_macro(
                            format!("{}{}", prefix, ATR_FIELD_START_TIMESTAMP),
                            MACRO_CAS,
                        ),
                        MutateInSpec::add_xattr(
                            format!("{}{}", prefix, ATR_FIELD_EXPIRES_AFTER_MSECS),
                            json!(expires_ms),
                        ),
                    ];
                    let options = MutateInOptions {
                        store_semantics: StoreSemantics::Upsert,
                        durability: self.config().durability(),
                        ..Default::default()
                    };
                    match self.kv.mutate_in(atr, &specs, options).await {
                        Ok(res) => {
                            match (self.hooks().after_atr_pending)("") {
                                Some(ec) => {
                                    Some((ec, "after_atr_pending hook raised error".to_string()))
                                }
                                None => {
                                    self.set_state(AttemptState::Pending);
                                    debug!(atr = %atr, cas = res.cas, "set atr to pending");
                                    None
                                }
                            }
                        }
                        Err(e) => Some((ErrorClass::from(&e), e.to_string())),
                    }
                }
            };

            let Some((ec, msg)) = ec else {
                return Ok(());
            };
            trace!(error_class = %ec, msg, "error setting atr to pending");
            let err = TransactionOperationFailed::new(ec, msg);
            if self.in_overtime() {
                return Err(err.no_rollback().expired());
            }
            match ec {
                ErrorClass::FailExpiry => {
                    self.expiry_overtime_mode.store(true, Ordering::SeqCst);
                    return Err(err.expired());
                }
                ErrorClass::FailAtrFull => {
                    return Err(err.cause(ExternalException::ActiveTransactionRecordFull));
                }
                // Another run of this attempt already wrote the entry.
                ErrorClass::FailPathAlreadyExists => return Ok(()),
                ErrorClass::FailAmbiguous => {
                    debug!("ambiguous atr pending write, retrying under the attempt lock");
                    self.overall.retry_delay().await;
                    continue;
                }
                ErrorClass::FailTransient => return Err(err.retry()),
                ErrorClass::FailHard => return Err(err.no_rollback()),
                _ => return Err(err),
            }
        }
    }

    // ---- commit -----------------------------------------------------------

    /// Commit the attempt: ATR-COMMIT, unstage, ATR-COMPLETE.
    pub async fn commit(&self) -> Result<(), TransactionOperationFailed> {
        debug!("waiting on ops to finish before committing");
        self.op_list.wait_and_block_ops().await;
        debug!(attempt_id = %self.attempt_id_str, "commit");

        if self.errored.load(Ordering::SeqCst) {
            return Err(TransactionOperationFailed::new(
                ErrorClass::FailOther,
                "previous operation failed, cannot commit",
            )
            .cause(ExternalException::PreviousOperationFailed));
        }
        if self.check_expiry_pre_commit(STAGE_BEFORE_COMMIT, None) {
            return Err(
                TransactionOperationFailed::new(ErrorClass::FailExpiry, "transaction expired")
                    .expired(),
            );
        }

        let atr = self.atr_id();
        match atr {
            Some(atr) if !self.is_done() => {
                self.atr_commit_with_retry(&atr).await?;
                let queue = self.staged.lock().clone();
                queue.commit(self).await;
                self.atr_complete(&atr).await?;
                self.is_done.store(true, Ordering::SeqCst);
                Ok(())
            }
            None if !self.is_done() => {
                debug!("commit on attempt with no mutations, skipping");
                self.set_state(AttemptState::Completed);
                self.is_done.store(true, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(TransactionOperationFailed::new(
                ErrorClass::FailOther,
                "calling commit on attempt that is already completed",
            )
            .no_rollback()),
        }
    }

    async fn atr_commit_with_retry(
        &self,
        atr: &DocumentId,
    ) -> Result<(), TransactionOperationFailed> {
        match retry_op_exponential_backoff(Duration::from_millis(1), 16, || self.atr_commit(atr))
            .await
        {
            Ok(()) => Ok(()),
            Err(RetryError::Op(err)) => Err(err),
            Err(_) => Err(TransactionOperationFailed::new(
                ErrorClass::FailOther,
                "atr_commit retries exhausted",
            )
            .retry()),
        }
    }

    /// One ATR-COMMIT try: status, commit timestamp and the id arrays.
    async fn atr_commit(
        &self,
        atr: &DocumentId,
    ) -> Result<(), Retryable<TransactionOperationFailed>> {
        let prefix = self.atr_entry_prefix();
        let failure = 'stage: {
            if let Some(ec) = self.error_if_expired_and_not_in_overtime(STAGE_ATR_COMMIT, None) {
                break 'stage Some((ec, "expired in atr_commit".to_string()));
            }
            if let Some(ec) = (self.hooks().before_atr_commit)("") {
                break 'stage Some((ec, "before_atr_commit hook raised error".to_string()));
            }
            let mut specs = vec![
                MutateInSpec::upsert_xattr(
                    format!("{}{}", prefix, ATR_FIELD_STATUS),
                    json!(AttemptState::Committed.to_string()),
                ),
                MutateInSpec::upsert_xattr_macro(
                    format!("{}{}", prefix, ATR_FIELD_START_COMMIT),
                    MACRO_CAS,
                ),
            ];
            specs.extend(self.staged.lock().extract_to(&prefix));
            let options = MutateInOptions {
                durability: self.config().durability(),
                ..Default::default()
            };
            trace!(atr = %atr, "updating atr to committed");
            match self.kv.mutate_in(atr, &specs, options).await {
                Ok(_) => match (self.hooks().after_atr_commit)("") {
                    Some(ec) => Some((ec, "after_atr_commit hook raised error".to_string())),
                    None => None,
                },
                Err(e) => Some((ErrorClass::from(&e), e.to_string())),
            }
        };

        let Some((ec, msg)) = failure else {
            self.set_state(AttemptState::Committed);
            return Ok(());
        };
        match ec {
            ErrorClass::FailExpiry => {
                self.expiry_overtime_mode.store(true, Ordering::SeqCst);
                Err(Retryable::Err(
                    TransactionOperationFailed::new(ec, msg).expired(),
                ))
            }
            ErrorClass::FailAmbiguous => {
                debug!("atr_commit ambiguous, resolving");
                match self.resolve_commit_ambiguity(atr).await {
                    Ok(CommitResolution::Committed) => {
                        self.set_state(AttemptState::Committed);
                        Ok(())
                    }
                    Ok(CommitResolution::RetryCommit) => {
                        debug!("ambiguity resolution will retry atr_commit");
                        Err(Retryable::Retry)
                    }
                    Err(e) => Err(Retryable::Err(e)),
                }
            }
            ErrorClass::FailTransient => Err(Retryable::Err(
                TransactionOperationFailed::new(ec, msg).retry(),
            )),
            ErrorClass::FailHard => Err(Retryable::Err(
                TransactionOperationFailed::new(ec, msg).no_rollback(),
            )),
            _ => {
                error!(
                    transaction_id = %self.transaction_id_str,
                    attempt_id = %self.attempt_id_str,
                    error_class = %ec,
                    "failed to commit transaction"
                );
                Err(Retryable::Err(TransactionOperationFailed::new(ec, msg)))
            }
        }
    }

    async fn resolve_commit_ambiguity(
        &self,
        atr: &DocumentId,
    ) -> Result<CommitResolution, TransactionOperationFailed> {
        match retry_op_exponential_backoff(Duration::from_millis(1), 16, || {
            self.atr_commit_ambiguity_resolution(atr)
        })
        .await
        {
            Ok(resolution) => Ok(resolution),
            Err(RetryError::Op(err)) => Err(err),
            Err(_) => Err(TransactionOperationFailed::new(
                ErrorClass::FailOther,
                "unable to resolve ambiguous atr_commit",
            )
            .no_rollback()
            .ambiguous()),
        }
    }

    /// Re-read the ATR entry status to decide what an ambiguous ATR-COMMIT
    /// actually did.
    async fn atr_commit_ambiguity_resolution(
        &self,
        atr: &DocumentId,
    ) -> Result<CommitResolution, Retryable<TransactionOperationFailed>> {
        let overtime_failure = |ec: ErrorClass, msg: String| {
            TransactionOperationFailed::new(ec, msg)
                .no_rollback()
                .ambiguous()
        };
        if let Some(ec) =
            self.error_if_expired_and_not_in_overtime(STAGE_ATR_COMMIT_AMBIGUITY_RESOLUTION, None)
        {
            self.expiry_overtime_mode.store(true, Ordering::SeqCst);
            return Err(Retryable::Err(overtime_failure(
                ec,
                "expired resolving ambiguous atr_commit".to_string(),
            )));
        }
        if let Some(ec) = (self.hooks().before_atr_commit_ambiguity_resolution)("") {
            return Err(self.map_ambiguity_resolution_error(ec, "hook raised error".to_string()));
        }

        let status_path = format!("{}{}", self.atr_entry_prefix(), ATR_FIELD_STATUS);
        let res = self
            .kv
            .lookup_in(
                atr,
                &[LookupInSpec::get_xattr(status_path)],
                LookupInOptions::default(),
            )
            .await;
        let res = match res {
            Ok(res) => res,
            Err(e) => {
                let ec = ErrorClass::from(&e);
                return Err(self.map_ambiguity_resolution_error(ec, e.to_string()));
            }
        };
        let status = res
            .entry(0)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<AttemptState>().ok());
        match status {
            Some(AttemptState::Committed) | Some(AttemptState::Completed) => {
                Ok(CommitResolution::Committed)
            }
            Some(AttemptState::Aborted) | Some(AttemptState::RolledBack) | None => {
                Err(Retryable::Err(
                    TransactionOperationFailed::new(
                        ErrorClass::FailOther,
                        "transaction rolled back externally",
                    )
                    .no_rollback()
                    .cause(ExternalException::TransactionAbortedExternally),
                ))
            }
            // Still pending: the ambiguous write never landed.
            _ => Ok(CommitResolution::RetryCommit),
        }
    }

    fn map_ambiguity_resolution_error(
        &self,
        ec: ErrorClass,
        msg: String,
    ) -> Retryable<TransactionOperationFailed> {
        match ec {
            ErrorClass::FailExpiry => {
                self.expiry_overtime_mode.store(true, Ordering::SeqCst);
                Retryable::Err(
                    TransactionOperationFailed::new(ec, msg)
                        .no_rollback()
                        .ambiguous(),
                )
            }
            ErrorClass::FailHard => {
                Retryable::Err(TransactionOperationFailed::new(ec, msg).no_rollback())
            }
            ErrorClass::FailTransient | ErrorClass::FailOther => Retryable::Retry,
            ErrorClass::FailPathNotFound | ErrorClass::FailDocNotFound => Retryable::Err(
                TransactionOperationFailed::new(
                    ErrorClass::FailOther,
                    "transaction rolled back externally",
                )
                .no_rollback()
                .cause(ExternalException::TransactionAbortedExternally),
            ),
            _ => Retryable::Err(TransactionOperationFailed::new(ec, msg).no_rollback()),
        }
    }

    /// Remove the per-attempt sub-tree after a successful unstage.
    async fn atr_complete(&self, atr: &DocumentId) -> Result<(), TransactionOperationFailed> {
        let failure = 'stage: {
            if let Some(ec) = (self.hooks().before_atr_complete)("") {
                break 'stage Some((ec, "before_atr_complete hook raised error".to_string()));
            }
            if let Some(ec) = self.error_if_expired_and_not_in_overtime(STAGE_ATR_COMPLETE, None) {
                break 'stage Some((ec, "expired in atr_complete".to_string()));
            }
            debug!(atr = %atr, attempt_id = %self.attempt_id_str, "removing attempt from atr");
            let specs = vec![MutateInSpec::remove_xattr(self.atr_entry_path())];
            let options = MutateInOptions {
                durability: self.config().durability(),
                ..Default::default()
            };
            match self.kv.mutate_in(atr, &specs, options).await {
                Ok(_) => match (self.hooks().after_atr_complete)("") {
                    Some(ec) => Some((ec, "after_atr_complete hook raised error".to_string())),
                    None => None,
                },
                Err(e) => Some((ErrorClass::from(&e), e.to_string())),
            }
        };

        match failure {
            None => {
                self.set_state(AttemptState::Completed);
                Ok(())
            }
            Some((ErrorClass::FailHard, msg)) => Err(TransactionOperationFailed::new(
                ErrorClass::FailHard,
                msg,
            )
            .no_rollback()
            .failed_post_commit()),
            Some((_, msg)) => {
                // The commit already landed; cleanup will remove the entry.
                info!(msg, "ignoring error in atr_complete");
                self.set_state(AttemptState::Completed);
                Ok(())
            }
        }
    }

    // ---- rollback ---------------------------------------------------------

    /// Roll the attempt back: ATR-ABORT, reverse staged writes, remove the
    /// ATR entry.
    pub async fn rollback(&self) -> Result<(), TransactionOperationFailed> {
        self.op_list.wait_and_block_ops().await;
        debug!(attempt_id = %self.attempt_id_str, "rolling back");
        self.check_expiry_during_commit_or_rollback(STAGE_ROLLBACK, None);

        let atr = self.atr_id();
        let Some(atr) = atr else {
            debug!("rollback called on txn with no mutations");
            self.is_done.store(true, Ordering::SeqCst);
            return Ok(());
        };
        if self.state() == AttemptState::NotStarted {
            debug!("rollback called on attempt that never got to pending");
            self.is_done.store(true, Ordering::SeqCst);
            return Ok(());
        }
        if self.is_done() {
            let msg = "transaction already done, cannot rollback";
            error!(msg);
            return Err(TransactionOperationFailed::new(ErrorClass::FailOther, msg).no_rollback());
        }

        match retry_op_exponential_backoff(Duration::from_millis(1), 16, || self.atr_abort(&atr))
            .await
        {
            Ok(()) => {}
            Err(RetryError::Op(err)) => return Err(err),
            Err(_) => {
                return Err(TransactionOperationFailed::new(
                    ErrorClass::FailOther,
                    "atr_abort retries exhausted",
                )
                .no_rollback());
            }
        }

        let queue = self.staged.lock().clone();
        queue.rollback(self).await?;
        debug!("rollback completed unstaging docs");

        match retry_op_exponential_backoff(Duration::from_millis(1), 16, || {
            self.atr_rollback_complete(&atr)
        })
        .await
        {
            Ok(()) => Ok(()),
            Err(RetryError::Op(err)) => Err(err),
            Err(_) => Err(TransactionOperationFailed::new(
                ErrorClass::FailOther,
                "atr_rollback_complete retries exhausted",
            )
            .no_rollback()),
        }
    }

    /// One ATR-ABORT try: status, rollback timestamp and the id arrays.
    async fn atr_abort(
        &self,
        atr: &DocumentId,
    ) -> Result<(), Retryable<TransactionOperationFailed>> {
        let prefix = self.atr_entry_prefix();
        let failure = 'stage: {
            if let Some(ec) = self.error_if_expired_and_not_in_overtime(STAGE_ATR_ABORT, None) {
                break 'stage Some((ec, "expired in atr_abort".to_string()));
            }
            if let Some(ec) = (self.hooks().before_atr_aborted)("") {
                break 'stage Some((ec, "before_atr_aborted hook raised error".to_string()));
            }
            let mut specs = vec![
                MutateInSpec::upsert_xattr(
                    format!("{}{}", prefix, ATR_FIELD_STATUS),
                    json!(AttemptState::Aborted.to_string()),
                ),
                MutateInSpec::upsert_xattr_macro(
                    format!("{}{}", prefix, ATR_FIELD_TIMESTAMP_ROLLBACK_START),
                    MACRO_CAS,
                ),
            ];
            specs.extend(self.staged.lock().extract_to(&prefix));
            let options = MutateInOptions {
                durability: self.config().durability(),
                ..Default::default()
            };
            match self.kv.mutate_in(atr, &specs, options).await {
                Ok(_) => {
                    self.set_state(AttemptState::Aborted);
                    match (self.hooks().after_atr_aborted)("") {
                        Some(ec) => Some((ec, "after_atr_aborted hook raised error".to_string())),
                        None => {
                            debug!("rollback completed atr abort phase");
                            None
                        }
                    }
                }
                Err(e) => Some((ErrorClass::from(&e), e.to_string())),
            }
        };

        let Some((ec, msg)) = failure else {
            return Ok(());
        };
        trace!(error_class = %ec, msg, "atr_abort got error");
        if self.in_overtime() {
            debug!("atr_abort error while in expiry-overtime mode, giving up");
            return Err(Retryable::Err(
                TransactionOperationFailed::new(ErrorClass::FailExpiry, msg)
                    .no_rollback()
                    .expired(),
            ));
        }
        match ec {
            ErrorClass::FailExpiry => {
                self.expiry_overtime_mode.store(true, Ordering::SeqCst);
                debug!("expired in atr_abort, setting overtime mode and retrying");
                Err(Retryable::Retry)
            }
            ErrorClass::FailPathNotFound => Err(Retryable::Err(
                TransactionOperationFailed::new(ec, msg)
                    .no_rollback()
                    .cause(ExternalException::ActiveTransactionRecordEntryNotFound),
            )),
            ErrorClass::FailDocNotFound => Err(Retryable::Err(
                TransactionOperationFailed::new(ec, msg)
                    .no_rollback()
                    .cause(ExternalException::ActiveTransactionRecordNotFound),
            )),
            ErrorClass::FailAtrFull => Err(Retryable::Err(
                TransactionOperationFailed::new(ec, msg)
                    .no_rollback()
                    .cause(ExternalException::ActiveTransactionRecordFull),
            )),
            ErrorClass::FailHard => Err(Retryable::Err(
                TransactionOperationFailed::new(ec, msg).no_rollback(),
            )),
            _ => Err(Retryable::Retry),
        }
    }

    /// Remove the per-attempt sub-tree after rollback unstaging.
    async fn atr_rollback_complete(
        &self,
        atr: &DocumentId,
    ) -> Result<(), Retryable<TransactionOperationFailed>> {
        let failure = 'stage: {
            if let Some(ec) =
                self.error_if_expired_and_not_in_overtime(STAGE_ATR_ROLLBACK_COMPLETE, None)
            {
                break 'stage Some((ec, "expired in atr_rollback_complete".to_string()));
            }
            if let Some(ec) = (self.hooks().before_atr_rolled_back)("") {
                break 'stage Some((ec, "before_atr_rolled_back hook raised error".to_string()));
            }
            let specs = vec![MutateInSpec::remove_xattr(self.atr_entry_path())];
            let options = MutateInOptions {
                durability: self.config().durability(),
                ..Default::default()
            };
            match self.kv.mutate_in(atr, &specs, options).await {
                Ok(_) => {
                    self.set_state(AttemptState::RolledBack);
                    match (self.hooks().after_atr_rolled_back)("") {
                        Some(ec) => {
                            Some((ec, "after_atr_rolled_back hook raised error".to_string()))
                        }
                        None => None,
                    }
                }
                Err(e) => Some((ErrorClass::from(&e), e.to_string())),
            }
        };

        let Some((ec, msg)) = failure else {
            self.is_done.store(true, Ordering::SeqCst);
            return Ok(());
        };
        if self.in_overtime() {
            debug!("atr_rollback_complete error while in expiry-overtime mode");
            return Err(Retryable::Err(
                TransactionOperationFailed::new(ErrorClass::FailExpiry, msg)
                    .no_rollback()
                    .expired(),
            ));
        }
        match ec {
            ErrorClass::FailDocNotFound | ErrorClass::FailPathNotFound => {
                debug!(atr = %atr, "atr entry already gone, rollback complete");
                self.set_state(AttemptState::RolledBack);
                self.is_done.store(true, Ordering::SeqCst);
                Ok(())
            }
            ErrorClass::FailHard => Err(Retryable::Err(
                TransactionOperationFailed::new(ec, msg).no_rollback(),
            )),
            ErrorClass::FailExpiry => Err(Retryable::Err(
                TransactionOperationFailed::new(ec, msg)
                    .no_rollback()
                    .expired(),
            )),
            _ => {
                debug!("retrying atr_rollback_complete");
                Err(Retryable::Retry)
            }
        }
    }
}

fn write_write_conflict() -> TransactionOperationFailed {
    TransactionOperationFailed::new(
        ErrorClass::FailWriteWriteConflict,
        "document is in another transaction",
    )
    .retry()
}

/// Fall back to the pre-transaction body; half-born inserts stay hidden.
fn visible_body(doc: TransactionGetResult) -> Option<TransactionGetResult> {
    if doc.content().is_none() {
        None
    } else {
        Some(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransactionConfig;
    use hawser_kv::MockCluster;

    fn attempt_on(cluster: &Arc<MockCluster>) -> AttemptContext {
        let overall = Arc::new(TransactionContext::new(TransactionConfig::default()));
        AttemptContext::new(overall, cluster.clone() as Arc<dyn KvClient>)
    }

    fn atr_doc() -> DocumentId {
        DocumentId::in_default_collection("default", "_txn:atr-test")
    }

    async fn write_entry_status(cluster: &MockCluster, attempt: &AttemptContext, status: &str) {
        let path = format!("{}{}", attempt.atr_entry_prefix(), ATR_FIELD_STATUS);
        cluster
            .mutate_in(
                &atr_doc(),
                &[MutateInSpec::upsert_xattr(path, json!(status))],
                MutateInOptions {
                    store_semantics: StoreSemantics::Upsert,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ambiguity_resolution_sees_committed() {
        let cluster = Arc::new(MockCluster::new());
        let attempt = attempt_on(&cluster);
        *attempt.atr_id.lock() = Some(atr_doc());
        write_entry_status(&cluster, &attempt, "COMMITTED").await;

        let resolution = attempt
            .atr_commit_ambiguity_resolution(&atr_doc())
            .await;
        assert!(matches!(resolution, Ok(CommitResolution::Committed)));
    }

    #[tokio::test]
    async fn test_ambiguity_resolution_retries_commit_when_pending() {
        let cluster = Arc::new(MockCluster::new());
        let attempt = attempt_on(&cluster);
        *attempt.atr_id.lock() = Some(atr_doc());
        write_entry_status(&cluster, &attempt, "PENDING").await;

        let resolution = attempt
            .atr_commit_ambiguity_resolution(&atr_doc())
            .await;
        assert!(matches!(resolution, Ok(CommitResolution::RetryCommit)));
    }

    #[tokio::test]
    async fn test_ambiguity_resolution_missing_entry_is_aborted_externally() {
        let cluster = Arc::new(MockCluster::new());
        let attempt = attempt_on(&cluster);
        *attempt.atr_id.lock() = Some(atr_doc());
        // ATR exists but carries no entry for this attempt.
        cluster.seed(atr_doc(), json!({}));

        let resolution = attempt
            .atr_commit_ambiguity_resolution(&atr_doc())
            .await;
        match resolution {
            Err(Retryable::Err(err)) => {
                assert_eq!(
                    err.external_cause(),
                    ExternalException::TransactionAbortedExternally
                );
                assert!(!err.should_rollback());
            }
            _ => panic!("expected externally-aborted failure"),
        }
    }

    #[tokio::test]
    async fn test_atr_pending_is_idempotent() {
        let cluster = Arc::new(MockCluster::new());
        let attempt = attempt_on(&cluster);
        *attempt.atr_id.lock() = Some(atr_doc());

        attempt.set_atr_pending_locked(&atr_doc()).await.unwrap();
        assert_eq!(attempt.state(), AttemptState::Pending);
        // Re-running the same write trips PATH_ALREADY_EXISTS, which is
        // treated as success.
        attempt.set_atr_pending_locked(&atr_doc()).await.unwrap();
    }
}
