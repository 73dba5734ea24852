//! Transactional document handles
//!
//! A [`TransactionGetResult`] is what `get` hands back and what `replace` and
//! `remove` take: the document identity, the visible content, the CAS, and
//! the decoded `txn` xattrs (the "links") tying a staged document back to the
//! attempt and ATR that own it.

use hawser_kv::{DocumentId, LookupInResult, LookupInSpec};
use serde_json::Value;

/// Top-level xattr all transaction state lives under.
pub(crate) const TXN_INTERFACE_PREFIX: &str = "txn";

pub(crate) const ATR_ID_PATH: &str = "txn.atr.id";
pub(crate) const TRANSACTION_ID_PATH: &str = "txn.id.txn";
pub(crate) const ATTEMPT_ID_PATH: &str = "txn.id.atmpt";
pub(crate) const STAGED_DATA_PATH: &str = "txn.op.stgd";
pub(crate) const ATR_BUCKET_PATH: &str = "txn.atr.bkt";
pub(crate) const ATR_COLL_PATH: &str = "txn.atr.coll";
pub(crate) const RESTORE_PATH: &str = "txn.restore";
pub(crate) const OP_TYPE_PATH: &str = "txn.op.type";
pub(crate) const CRC32_OF_STAGING_PATH: &str = "txn.op.crc32";
pub(crate) const FORWARD_COMPAT_PATH: &str = "txn.fc";

pub(crate) const RESTORE_CAS_PATH: &str = "txn.restore.CAS";
pub(crate) const RESTORE_REVID_PATH: &str = "txn.restore.revid";
pub(crate) const RESTORE_EXPTIME_PATH: &str = "txn.restore.exptime";

// Entry indices in the standard transactional lookup.
const IDX_ATR_ID: usize = 0;
const IDX_TRANSACTION_ID: usize = 1;
const IDX_ATTEMPT_ID: usize = 2;
const IDX_STAGED_DATA: usize = 3;
const IDX_ATR_BUCKET: usize = 4;
const IDX_ATR_COLL: usize = 5;
// index 6 is txn.restore, fetched for parity with the wire shape
const IDX_OP_TYPE: usize = 7;
const IDX_DOCUMENT_META: usize = 8;
const IDX_CRC32: usize = 9;
const IDX_FORWARD_COMPAT: usize = 10;
const IDX_BODY: usize = 11;

/// The lookup specs fetching everything a transactional read needs: all
/// `txn.*` xattrs, the `$document` metadata, and the body.
pub(crate) fn transactional_lookup_specs() -> Vec<LookupInSpec> {
    vec![
        LookupInSpec::get_xattr(ATR_ID_PATH),
        LookupInSpec::get_xattr(TRANSACTION_ID_PATH),
        LookupInSpec::get_xattr(ATTEMPT_ID_PATH),
        LookupInSpec::get_xattr(STAGED_DATA_PATH),
        LookupInSpec::get_xattr(ATR_BUCKET_PATH),
        LookupInSpec::get_xattr(ATR_COLL_PATH),
        LookupInSpec::get_xattr(RESTORE_PATH),
        LookupInSpec::get_xattr(OP_TYPE_PATH),
        LookupInSpec::get_xattr("$document"),
        LookupInSpec::get_xattr(CRC32_OF_STAGING_PATH),
        LookupInSpec::get_xattr(FORWARD_COMPAT_PATH),
        LookupInSpec::get_doc(),
    ]
}

/// Pre-transaction metadata captured from `$document`.
#[derive(Debug, Clone, Default)]
pub struct DocumentMetadata {
    pub cas: Option<u64>,
    pub revid: Option<String>,
    pub exptime: Option<u64>,
    pub crc32: Option<u64>,
}

/// Decoded `txn` xattrs of a document.
#[derive(Debug, Clone, Default)]
pub struct TransactionLinks {
    atr_id: Option<String>,
    atr_bucket: Option<String>,
    atr_collection_spec: Option<String>,
    staged_transaction_id: Option<String>,
    staged_attempt_id: Option<String>,
    staged_content: Option<Value>,
    crc32_of_staging: Option<u64>,
    op: Option<String>,
    forward_compat: Option<Value>,
    is_deleted: bool,
}

impl TransactionLinks {
    /// Links for a document this attempt just staged itself.
    pub(crate) fn for_staged_write(
        atr_id: &DocumentId,
        transaction_id: String,
        attempt_id: String,
        staged_content: Option<Value>,
        op: &str,
        is_deleted: bool,
    ) -> Self {
        Self {
            atr_id: Some(atr_id.key().to_string()),
            atr_bucket: Some(atr_id.bucket().to_string()),
            atr_collection_spec: Some(atr_id.collection_spec()),
            staged_transaction_id: Some(transaction_id),
            staged_attempt_id: Some(attempt_id),
            staged_content,
            crc32_of_staging: None,
            op: Some(op.to_string()),
            forward_compat: None,
            is_deleted,
        }
    }

    pub fn atr_id(&self) -> Option<&str> {
        self.atr_id.as_deref()
    }

    pub fn atr_bucket(&self) -> Option<&str> {
        self.atr_bucket.as_deref()
    }

    pub fn staged_transaction_id(&self) -> Option<&str> {
        self.staged_transaction_id.as_deref()
    }

    pub fn staged_attempt_id(&self) -> Option<&str> {
        self.staged_attempt_id.as_deref()
    }

    pub fn staged_content(&self) -> Option<&Value> {
        self.staged_content.as_ref()
    }

    pub fn crc32_of_staging(&self) -> Option<u64> {
        self.crc32_of_staging
    }

    pub fn op(&self) -> Option<&str> {
        self.op.as_deref()
    }

    pub fn forward_compat(&self) -> Option<&Value> {
        self.forward_compat.as_ref()
    }

    /// Whether the document is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    /// Whether another (or this) attempt has a mutation staged here.
    pub fn has_staged_write(&self) -> bool {
        self.staged_attempt_id.is_some()
    }

    /// Whether the document carries any transaction linkage at all.
    pub fn is_document_in_transaction(&self) -> bool {
        self.atr_id.is_some()
    }

    /// Whether the staged operation is a remove.
    pub fn is_document_being_removed(&self) -> bool {
        self.op.as_deref() == Some("remove")
    }

    pub fn has_staged_content(&self) -> bool {
        self.staged_content.is_some()
    }

    /// Identity of the owning ATR, when the links carry enough to name it.
    pub fn atr_document_id(&self) -> Option<DocumentId> {
        let bucket = self.atr_bucket.as_deref()?;
        let key = self.atr_id.as_deref()?;
        let spec = self.atr_collection_spec.as_deref().unwrap_or("_default._default");
        let (scope, collection) = spec.split_once('.').unwrap_or(("_default", "_default"));
        Some(DocumentId::new(bucket, scope, collection, key))
    }
}

/// A document as seen from inside a transaction.
#[derive(Debug, Clone)]
pub struct TransactionGetResult {
    id: DocumentId,
    content: Option<Value>,
    cas: u64,
    links: TransactionLinks,
    metadata: Option<DocumentMetadata>,
}

impl TransactionGetResult {
    pub(crate) fn new(
        id: DocumentId,
        content: Option<Value>,
        cas: u64,
        links: TransactionLinks,
        metadata: Option<DocumentMetadata>,
    ) -> Self {
        Self {
            id,
            content,
            cas,
            links,
            metadata,
        }
    }

    /// Decode a standard transactional lookup.
    pub(crate) fn from_lookup(id: DocumentId, res: &LookupInResult) -> Self {
        let string_at = |idx: usize| -> Option<String> {
            res.entry(idx).and_then(|v| v.as_str()).map(str::to_string)
        };
        let meta = res.entry(IDX_DOCUMENT_META);
        let metadata = meta.map(|m| DocumentMetadata {
            cas: m.get("CAS").and_then(|v| v.as_u64()),
            revid: m.get("revid").and_then(|v| v.as_str()).map(str::to_string),
            exptime: m.get("exptime").and_then(|v| v.as_u64()),
            crc32: m.get("value_crc32c").and_then(|v| v.as_u64()),
        });

        let links = TransactionLinks {
            atr_id: string_at(IDX_ATR_ID),
            atr_bucket: string_at(IDX_ATR_BUCKET),
            atr_collection_spec: string_at(IDX_ATR_COLL),
            staged_transaction_id: string_at(IDX_TRANSACTION_ID),
            staged_attempt_id: string_at(IDX_ATTEMPT_ID),
            staged_content: res.entry(IDX_STAGED_DATA).cloned(),
            crc32_of_staging: res.entry(IDX_CRC32).and_then(|v| v.as_u64()),
            op: string_at(IDX_OP_TYPE),
            forward_compat: res.entry(IDX_FORWARD_COMPAT).cloned(),
            is_deleted: res.is_deleted,
        };
        Self {
            id,
            content: res.entry(IDX_BODY).cloned(),
            cas: res.cas,
            links,
            metadata,
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// The visible content; `None` for documents that do not exist (yet).
    pub fn content(&self) -> Option<&Value> {
        self.content.as_ref()
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn links(&self) -> &TransactionLinks {
        &self.links
    }

    pub fn metadata(&self) -> Option<&DocumentMetadata> {
        self.metadata.as_ref()
    }

    pub(crate) fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    /// Copy with different content, e.g. to surface staged content.
    pub(crate) fn with_content(&self, content: Option<Value>) -> Self {
        let mut out = self.clone();
        out.content = content;
        out
    }
}
