//! Lost-attempt cleanup
//!
//! Attempts can die at any point between ATR-PENDING and entry removal: a
//! crashed process, a dropped connection, an expired budget. Whatever they
//! left behind is reachable from their ATR entry, so cleanup replays the same
//! unstaging logic the owning attempt would have run: commit replay for
//! COMMITTED entries, rollback replay for ABORTED ones, then entry removal.
//!
//! Entries arrive from two sources: every finished attempt of this client
//! pushes itself onto the queue so forgotten state gets swept, and a
//! background scanner walks all 1024 ATRs of each known bucket looking for
//! entries that outlived their expiry budget.

use crate::atr::{ActiveTransactionRecord, AtrEntry, AttemptState, DocRecord, ATR_FIELD_ATTEMPTS};
use crate::atr_ids::NUM_VBUCKETS;
use crate::config::TransactionConfig;
use crate::doc::{transactional_lookup_specs, TransactionGetResult, TXN_INTERFACE_PREFIX};
use crate::error_class::ErrorClass;
use crate::forward_compat::{self, ForwardCompatResult, ForwardCompatStage};
use crate::atr_ids;
use hawser_kv::{
    DocumentId, KvClient, KvError, LookupInOptions, MutateInOptions, MutateInSpec, StoreSemantics,
};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Wait this long past an attempt's expiry before touching its state.
pub const CLEANUP_SAFETY_MARGIN_MS: u64 = 1500;

/// Cap on queued cleanup work. Entries dropped here are rediscovered by a
/// later scanner pass, so the bound costs nothing but latency.
pub const CLEANUP_QUEUE_CAPACITY: usize = 10_000;

/// One unit of cleanup work: an (ATR, attempt) pair.
#[derive(Debug, Clone)]
pub struct AtrCleanupEntry {
    atr_id: DocumentId,
    attempt_id: String,
    min_start_time: Instant,
    check_if_expired: bool,
}

impl AtrCleanupEntry {
    /// Entry for one of this client's own finished attempts; cleaned on the
    /// next drain without re-checking expiry.
    pub fn for_own_attempt(atr_id: DocumentId, attempt_id: String) -> Self {
        Self {
            atr_id,
            attempt_id,
            min_start_time: Instant::now(),
            check_if_expired: false,
        }
    }

    /// Entry discovered by the lost-attempts scanner; expiry is re-verified
    /// against a fresh ATR read before any document is touched.
    pub fn for_expired_entry(atr_id: DocumentId, attempt_id: String) -> Self {
        Self {
            atr_id,
            attempt_id,
            min_start_time: Instant::now(),
            check_if_expired: true,
        }
    }

    fn ready(&self) -> bool {
        Instant::now() >= self.min_start_time
    }
}

impl PartialEq for AtrCleanupEntry {
    fn eq(&self, other: &Self) -> bool {
        self.min_start_time == other.min_start_time
    }
}

impl Eq for AtrCleanupEntry {}

impl PartialOrd for AtrCleanupEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for AtrCleanupEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap pops largest-first; flip the comparison so the least
        // recent start time comes out first.
        other.min_start_time.cmp(&self.min_start_time)
    }
}

/// Mutex-guarded min-heap of cleanup work, earliest start time first.
#[derive(Debug, Default)]
pub struct AtrCleanupQueue {
    heap: Mutex<BinaryHeap<AtrCleanupEntry>>,
}

impl AtrCleanupQueue {
    pub fn push(&self, entry: AtrCleanupEntry) {
        let mut heap = self.heap.lock();
        if heap.len() >= CLEANUP_QUEUE_CAPACITY {
            warn!(attempt_id = %entry.attempt_id, "cleanup queue full, dropping entry");
            return;
        }
        heap.push(entry);
    }

    /// Pop the earliest entry. With `check_time`, only entries whose start
    /// time has passed are returned. The lock is held across the peek and
    /// the pop so the minimum cannot change in between.
    pub fn pop(&self, check_time: bool) -> Option<AtrCleanupEntry> {
        let mut heap = self.heap.lock();
        match heap.peek() {
            Some(top) if !check_time || top.ready() => heap.pop(),
            _ => None,
        }
    }

    pub fn size(&self) -> usize {
        self.heap.lock().len()
    }
}

/// The cleanup engine: the shared queue, the background drain and scanner
/// workers, and the per-entry replay logic.
pub struct TransactionsCleanup {
    kv: Arc<dyn KvClient>,
    config: TransactionConfig,
    queue: Arc<AtrCleanupQueue>,
    buckets: Mutex<HashSet<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    safety_margin_ms: AtomicU64,
}

impl TransactionsCleanup {
    pub fn new(kv: Arc<dyn KvClient>, config: TransactionConfig) -> Self {
        Self {
            kv,
            config,
            queue: Arc::new(AtrCleanupQueue::default()),
            buckets: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            safety_margin_ms: AtomicU64::new(CLEANUP_SAFETY_MARGIN_MS),
        }
    }

    pub fn queue(&self) -> &Arc<AtrCleanupQueue> {
        &self.queue
    }

    /// Register a bucket for the lost-attempts scanner.
    pub fn add_bucket(&self, bucket: &str) {
        if self.buckets.lock().insert(bucket.to_string()) {
            debug!(bucket, "tracking bucket for lost-attempt cleanup");
        }
    }

    /// Override the post-expiry safety margin.
    pub fn set_safety_margin_ms(&self, margin_ms: u64) {
        self.safety_margin_ms.store(margin_ms, Ordering::SeqCst);
    }

    fn safety_margin_ms(&self) -> u64 {
        self.safety_margin_ms.load(Ordering::SeqCst)
    }

    /// Start the background workers. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock();

        if self.config.cleanup_client_attempts() || self.config.cleanup_lost_attempts() {
            let cleanup = self.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(100));
                loop {
                    interval.tick().await;
                    while let Some(entry) = cleanup.queue.pop(true) {
                        if let Err(ec) = cleanup.clean_entry(&entry).await {
                            debug!(
                                atr = %entry.atr_id,
                                attempt_id = %entry.attempt_id,
                                error_class = %ec,
                                "cleanup of attempt failed, will retry on a later scan"
                            );
                        }
                    }
                }
            }));
        }

        if self.config.cleanup_lost_attempts() {
            let cleanup = self.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(cleanup.config.cleanup_window());
                loop {
                    interval.tick().await;
                    let buckets: Vec<String> = cleanup.buckets.lock().iter().cloned().collect();
                    for bucket in buckets {
                        cleanup.scan_bucket(&bucket).await;
                    }
                }
            }));
        }
    }

    /// Stop the background workers. The queue contents are dropped; whatever
    /// was pending will be rediscovered by another client's scanner.
    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Walk every ATR in a bucket and enqueue expired entries.
    pub async fn scan_bucket(&self, bucket: &str) {
        trace!(bucket, "scanning atrs for lost attempts");
        let margin = self.safety_margin_ms();
        for vbucket in 0..NUM_VBUCKETS {
            let atr_id =
                DocumentId::in_default_collection(bucket, atr_ids::atr_id_for_vbucket(vbucket));
            match ActiveTransactionRecord::fetch(self.kv.as_ref(), &atr_id).await {
                Ok(Some(atr)) => {
                    for entry in atr.entries() {
                        if entry.has_expired(margin) {
                            debug!(
                                atr = %atr_id,
                                attempt_id = %entry.attempt_id(),
                                age_ms = entry.age_ms(),
                                "found expired attempt"
                            );
                            self.queue.push(AtrCleanupEntry::for_expired_entry(
                                atr_id.clone(),
                                entry.attempt_id().to_string(),
                            ));
                        }
                    }
                }
                Ok(None) => {}
                Err(ec) => {
                    trace!(atr = %atr_id, error_class = %ec, "failed to read atr during scan");
                }
            }
        }
    }

    /// Clean one (ATR, attempt) pair: replay its unstaging, remove its entry.
    pub async fn clean_entry(&self, entry: &AtrCleanupEntry) -> Result<(), ErrorClass> {
        trace!(atr = %entry.atr_id, attempt_id = %entry.attempt_id, "cleaning attempt");

        let atr = match ActiveTransactionRecord::fetch(self.kv.as_ref(), &entry.atr_id).await? {
            Some(atr) => atr,
            None => {
                trace!(atr = %entry.atr_id, "could not find atr, nothing to clean");
                return Ok(());
            }
        };
        let Some(atr_entry) = atr.entry_for(&entry.attempt_id) else {
            trace!(attempt_id = %entry.attempt_id, "could not find attempt, nothing to clean");
            return Ok(());
        };

        if entry.check_if_expired && !atr_entry.has_expired(self.safety_margin_ms()) {
            trace!(attempt_id = %entry.attempt_id, "attempt not expired, nothing to clean");
            return Ok(());
        }

        match forward_compat::check(ForwardCompatStage::CleanupEntry, atr_entry.forward_compat()) {
            ForwardCompatResult::Ok => {}
            _ => {
                warn!(attempt_id = %entry.attempt_id, "forward compatibility blocks cleanup of this entry");
                return Err(ErrorClass::FailOther);
            }
        }

        self.cleanup_docs(atr_entry).await?;
        (self.config.cleanup_hooks().on_cleanup_docs_completed)();

        self.cleanup_entry(entry).await?;
        (self.config.cleanup_hooks().on_cleanup_completed)();
        Ok(())
    }

    async fn cleanup_docs(&self, atr_entry: &AtrEntry) -> Result<(), ErrorClass> {
        match atr_entry.state() {
            // Half-finished commit: finish making the staged writes visible.
            AttemptState::Committed => {
                self.commit_docs(atr_entry, atr_entry.inserted_ids()).await?;
                self.commit_docs(atr_entry, atr_entry.replaced_ids()).await?;
                self.remove_docs_staged_for_removal(atr_entry, atr_entry.removed_ids())
                    .await?;
            }
            // Half-finished rollback: strip whatever is still staged.
            AttemptState::Aborted => {
                self.remove_docs(atr_entry, atr_entry.inserted_ids()).await?;
                self.remove_txn_links(atr_entry, atr_entry.replaced_ids()).await?;
                self.remove_txn_links(atr_entry, atr_entry.removed_ids()).await?;
            }
            state => {
                trace!(%state, "attempt state needs no document cleanup");
            }
        }
        Ok(())
    }

    /// Fetch a referenced document and decide whether it still needs this
    /// cleanup: it must carry this attempt's staged write, and for commit
    /// replay the staged CRC must still match the server's.
    async fn fetch_cleanup_doc(
        &self,
        record: &DocRecord,
        attempt_id: &str,
        require_crc_to_match: bool,
    ) -> Result<Option<TransactionGetResult>, ErrorClass> {
        let id = record.document_id();
        let res = self
            .kv
            .lookup_in(
                &id,
                &transactional_lookup_specs(),
                LookupInOptions { access_deleted: true },
            )
            .await;
        let res = match res {
            Ok(res) => res,
            Err(KvError::DocumentNotFound) => {
                trace!(id = %id, "document not found during cleanup, ignoring");
                return Ok(None);
            }
            Err(e) => return Err(ErrorClass::from(&e)),
        };
        let doc = TransactionGetResult::from_lookup(id.clone(), &res);

        if !(doc.links().has_staged_content() || doc.links().is_document_being_removed())
            || !doc.links().has_staged_write()
        {
            trace!(id = %id, "document has no staged content, assuming it was committed; skipping");
            return Ok(None);
        }
        if doc.links().staged_attempt_id() != Some(attempt_id) {
            trace!(id = %id, "document staged for a different attempt, skipping");
            return Ok(None);
        }
        if require_crc_to_match {
            let staged = doc.links().crc32_of_staging();
            let server = doc.metadata().and_then(|m| m.crc32);
            if staged.is_none() || server.is_none() || staged != server {
                trace!(id = %id, "document crc32 does not match staged value, skipping");
                return Ok(None);
            }
        }
        Ok(Some(doc))
    }

    /// Commit replay for inserted and replaced documents.
    async fn commit_docs(
        &self,
        atr_entry: &AtrEntry,
        docs: Option<&[DocRecord]>,
    ) -> Result<(), ErrorClass> {
        for record in docs.unwrap_or_default() {
            let Some(doc) = self
                .fetch_cleanup_doc(record, atr_entry.attempt_id(), true)
                .await?
            else {
                continue;
            };
            let Some(content) = doc.links().staged_content().cloned() else {
                trace!(id = %doc.id(), "no staged content, skipping");
                continue;
            };
            if let Some(ec) = (self.config.cleanup_hooks().before_commit_doc)(doc.id().key()) {
                return Err(ec);
            }
            if doc.links().is_deleted() {
                self.kv
                    .insert(doc.id(), content, self.config.durability())
                    .await
                    .map_err(|e| ErrorClass::from(&e))?;
            } else {
                let specs = vec![
                    MutateInSpec::remove_xattr(TXN_INTERFACE_PREFIX),
                    MutateInSpec::set_doc(content),
                ];
                let options = MutateInOptions {
                    cas: doc.cas(),
                    store_semantics: StoreSemantics::Replace,
                    durability: self.config.durability(),
                    ..Default::default()
                };
                self.kv
                    .mutate_in(doc.id(), &specs, options)
                    .await
                    .map_err(|e| ErrorClass::from(&e))?;
            }
            debug!(id = %doc.id(), "cleanup committed staged content");
        }
        Ok(())
    }

    /// Commit replay for documents staged for removal.
    async fn remove_docs_staged_for_removal(
        &self,
        atr_entry: &AtrEntry,
        docs: Option<&[DocRecord]>,
    ) -> Result<(), ErrorClass> {
        for record in docs.unwrap_or_default() {
            let Some(doc) = self
                .fetch_cleanup_doc(record, atr_entry.attempt_id(), true)
                .await?
            else {
                continue;
            };
            if !doc.links().is_document_being_removed() {
                trace!(id = %doc.id(), "document not marked for removal, skipping");
                continue;
            }
            if let Some(ec) =
                (self.config.cleanup_hooks().before_remove_doc_staged_for_removal)(doc.id().key())
            {
                return Err(ec);
            }
            self.kv
                .remove(doc.id(), doc.cas(), self.config.durability())
                .await
                .map_err(|e| ErrorClass::from(&e))?;
            debug!(id = %doc.id(), "cleanup removed doc staged for removal");
        }
        Ok(())
    }

    /// Rollback replay for staged inserts.
    async fn remove_docs(
        &self,
        atr_entry: &AtrEntry,
        docs: Option<&[DocRecord]>,
    ) -> Result<(), ErrorClass> {
        for record in docs.unwrap_or_default() {
            let Some(doc) = self
                .fetch_cleanup_doc(record, atr_entry.attempt_id(), true)
                .await?
            else {
                continue;
            };
            if let Some(ec) = (self.config.cleanup_hooks().before_remove_doc)(doc.id().key()) {
                return Err(ec);
            }
            if doc.links().is_deleted() {
                let specs = vec![MutateInSpec::remove_xattr(TXN_INTERFACE_PREFIX)];
                let options = MutateInOptions {
                    cas: doc.cas(),
                    store_semantics: StoreSemantics::Replace,
                    access_deleted: true,
                    durability: self.config.durability(),
                    ..Default::default()
                };
                self.kv
                    .mutate_in(doc.id(), &specs, options)
                    .await
                    .map_err(|e| ErrorClass::from(&e))?;
            } else {
                self.kv
                    .remove(doc.id(), doc.cas(), self.config.durability())
                    .await
                    .map_err(|e| ErrorClass::from(&e))?;
            }
            debug!(id = %doc.id(), "cleanup removed staged insert");
        }
        Ok(())
    }

    /// Rollback replay for staged replaces and removes: strip the `txn`
    /// xattrs, leaving the original body untouched.
    async fn remove_txn_links(
        &self,
        atr_entry: &AtrEntry,
        docs: Option<&[DocRecord]>,
    ) -> Result<(), ErrorClass> {
        for record in docs.unwrap_or_default() {
            let Some(doc) = self
                .fetch_cleanup_doc(record, atr_entry.attempt_id(), false)
                .await?
            else {
                continue;
            };
            if let Some(ec) = (self.config.cleanup_hooks().before_remove_links)(doc.id().key()) {
                return Err(ec);
            }
            let specs = vec![MutateInSpec::remove_xattr(TXN_INTERFACE_PREFIX)];
            let options = MutateInOptions {
                cas: doc.cas(),
                store_semantics: StoreSemantics::Replace,
                access_deleted: true,
                durability: self.config.durability(),
                ..Default::default()
            };
            self.kv
                .mutate_in(doc.id(), &specs, options)
                .await
                .map_err(|e| ErrorClass::from(&e))?;
            debug!(id = %doc.id(), "cleanup removed txn links");
        }
        Ok(())
    }

    /// Remove the attempt's sub-tree from the ATR.
    async fn cleanup_entry(&self, entry: &AtrCleanupEntry) -> Result<(), ErrorClass> {
        if let Some(ec) = (self.config.cleanup_hooks().before_atr_remove)(entry.atr_id.key()) {
            return Err(ec);
        }
        let path = format!("{}.{}", ATR_FIELD_ATTEMPTS, entry.attempt_id);
        let specs = vec![MutateInSpec::remove_xattr(path)];
        let options = MutateInOptions {
            durability: self.config.durability(),
            ..Default::default()
        };
        match self.kv.mutate_in(&entry.atr_id, &specs, options).await {
            Ok(_) => {
                trace!(attempt_id = %entry.attempt_id, "successfully removed attempt from atr");
                Ok(())
            }
            Err(KvError::PathNotFound(_)) | Err(KvError::DocumentNotFound) => Ok(()),
            Err(e) => {
                warn!(attempt_id = %entry.attempt_id, error = %e, "cleanup could not remove attempt");
                Err(ErrorClass::from(&e))
            }
        }
    }
}

impl Drop for TransactionsCleanup {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry_at(offset_ms: u64, attempt: &str) -> AtrCleanupEntry {
        AtrCleanupEntry {
            atr_id: DocumentId::in_default_collection("default", "_txn:atr-0-#0"),
            attempt_id: attempt.to_string(),
            min_start_time: Instant::now() + Duration::from_millis(offset_ms),
            check_if_expired: false,
        }
    }

    #[tokio::test]
    async fn test_queue_pops_earliest_first() {
        let queue = AtrCleanupQueue::default();
        let mut early = entry_at(0, "early");
        early.min_start_time = Instant::now() - Duration::from_millis(100);
        let late = entry_at(0, "late");
        queue.push(late);
        queue.push(early);

        let first = queue.pop(false).unwrap();
        assert_eq!(first.attempt_id, "early");
        let second = queue.pop(false).unwrap();
        assert_eq!(second.attempt_id, "late");
        assert!(queue.pop(false).is_none());
    }

    #[tokio::test]
    async fn test_pop_respects_ready_time() {
        let queue = AtrCleanupQueue::default();
        queue.push(entry_at(60_000, "future"));

        assert!(queue.pop(true).is_none());
        assert_eq!(queue.size(), 1);
        // Ignoring readiness still yields it.
        assert!(queue.pop(false).is_some());
    }
}
