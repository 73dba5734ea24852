//! Active Transaction Record
//!
//! An ATR is an ordinary document whose xattrs carry one entry per active
//! attempt under `attempts.<attempt-id>`. The document body stays a
//! placeholder; everything interesting lives in the xattr tree so that
//! readers can fetch the whole attempt set with a single lookup.
//!
//! CAS values on this substrate are nanosecond timestamps, which gives every
//! entry a server-assigned start instant for free: the CAS macro written at
//! ATR-PENDING time is the start timestamp. Entry ages compare that against
//! the server's current clock, read through the virtual `$vbucket` xattr in
//! the same lookup, so independent clients agree on who has expired.

use crate::error_class::ErrorClass;
use hawser_kv::{DocumentId, KvClient, LookupInOptions, LookupInSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Xattr root of the per-attempt entries.
pub const ATR_FIELD_ATTEMPTS: &str = "attempts";

/// Per-entry field names.
pub const ATR_FIELD_STATUS: &str = "tst";
pub const ATR_FIELD_START_TIMESTAMP: &str = "tst_s";
pub const ATR_FIELD_START_COMMIT: &str = "tsc_s";
pub const ATR_FIELD_TIMESTAMP_ROLLBACK_START: &str = "tsr_s";
pub const ATR_FIELD_EXPIRES_AFTER_MSECS: &str = "exp";
pub const ATR_FIELD_DOCS_INSERTED: &str = "ins";
pub const ATR_FIELD_DOCS_REPLACED: &str = "rep";
pub const ATR_FIELD_DOCS_REMOVED: &str = "rem";
pub const ATR_FIELD_FORWARD_COMPAT: &str = "fc";

/// State of an attempt as recorded in its ATR entry.
///
/// Transitions follow `NOT_STARTED → PENDING → { COMMITTED → COMPLETED } ∪
/// { ABORTED → ROLLED_BACK }`; the terminal states correspond to the entry
/// being removed from the ATR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttemptState {
    #[default]
    NotStarted,
    Pending,
    Committed,
    Aborted,
    Completed,
    RolledBack,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Completed | AttemptState::RolledBack)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptState::NotStarted => "NOT_STARTED",
            AttemptState::Pending => "PENDING",
            AttemptState::Committed => "COMMITTED",
            AttemptState::Aborted => "ABORTED",
            AttemptState::Completed => "COMPLETED",
            AttemptState::RolledBack => "ROLLED_BACK",
        };
        f.write_str(name)
    }
}

impl FromStr for AttemptState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(AttemptState::NotStarted),
            "PENDING" => Ok(AttemptState::Pending),
            "COMMITTED" => Ok(AttemptState::Committed),
            "ABORTED" => Ok(AttemptState::Aborted),
            "COMPLETED" => Ok(AttemptState::Completed),
            "ROLLED_BACK" => Ok(AttemptState::RolledBack),
            other => Err(format!("unknown attempt state: {}", other)),
        }
    }
}

/// A document referenced from an ATR entry's inserted/replaced/removed lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRecord {
    pub bkt: String,
    pub scp: String,
    pub col: String,
    pub key: String,
}

impl DocRecord {
    pub fn document_id(&self) -> DocumentId {
        DocumentId::new(&self.bkt, &self.scp, &self.col, &self.key)
    }
}

impl From<&DocumentId> for DocRecord {
    fn from(id: &DocumentId) -> Self {
        Self {
            bkt: id.bucket().to_string(),
            scp: id.scope().to_string(),
            col: id.collection().to_string(),
            key: id.key().to_string(),
        }
    }
}

fn cas_to_ms(cas: u64) -> u64 {
    cas / 1_000_000
}

/// One attempt's entry inside an ATR.
#[derive(Debug, Clone)]
pub struct AtrEntry {
    attempt_id: String,
    state: AttemptState,
    start_timestamp: Option<u64>,
    expires_after_ms: Option<u64>,
    inserted_ids: Option<Vec<DocRecord>>,
    replaced_ids: Option<Vec<DocRecord>>,
    removed_ids: Option<Vec<DocRecord>>,
    forward_compat: Option<Value>,
    /// Server clock observed at read time; the entry's notion of "now".
    now: u64,
}

impl AtrEntry {
    fn parse(attempt_id: &str, raw: &Value, now: u64) -> Self {
        let state = raw
            .get(ATR_FIELD_STATUS)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let docs = |field: &str| -> Option<Vec<DocRecord>> {
            raw.get(field)
                .and_then(|v| serde_json::from_value(v.clone()).ok())
        };
        Self {
            attempt_id: attempt_id.to_string(),
            state,
            start_timestamp: raw.get(ATR_FIELD_START_TIMESTAMP).and_then(|v| v.as_u64()),
            expires_after_ms: raw
                .get(ATR_FIELD_EXPIRES_AFTER_MSECS)
                .and_then(|v| v.as_u64()),
            inserted_ids: docs(ATR_FIELD_DOCS_INSERTED),
            replaced_ids: docs(ATR_FIELD_DOCS_REPLACED),
            removed_ids: docs(ATR_FIELD_DOCS_REMOVED),
            forward_compat: raw.get(ATR_FIELD_FORWARD_COMPAT).cloned(),
            now,
        }
    }

    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn inserted_ids(&self) -> Option<&[DocRecord]> {
        self.inserted_ids.as_deref()
    }

    pub fn replaced_ids(&self) -> Option<&[DocRecord]> {
        self.replaced_ids.as_deref()
    }

    pub fn removed_ids(&self) -> Option<&[DocRecord]> {
        self.removed_ids.as_deref()
    }

    pub fn forward_compat(&self) -> Option<&Value> {
        self.forward_compat.as_ref()
    }

    /// Age of this entry in milliseconds, as observed at read time.
    pub fn age_ms(&self) -> u64 {
        match self.start_timestamp {
            Some(start) => cas_to_ms(self.now).saturating_sub(cas_to_ms(start)),
            None => 0,
        }
    }

    /// Whether the attempt has outlived its expiry budget plus a safety
    /// margin. Entries missing their timing fields are never expired.
    pub fn has_expired(&self, safety_margin_ms: u64) -> bool {
        match self.expires_after_ms {
            Some(expires_after_ms) if self.start_timestamp.is_some() => {
                self.age_ms() > expires_after_ms + safety_margin_ms
            }
            _ => false,
        }
    }
}

/// A parsed ATR document: the set of all active attempts for one ATR key.
#[derive(Debug, Clone)]
pub struct ActiveTransactionRecord {
    id: DocumentId,
    entries: Vec<AtrEntry>,
}

impl ActiveTransactionRecord {
    /// Fetch and parse an ATR. `Ok(None)` when the ATR document or its
    /// attempts map does not exist yet.
    pub async fn fetch(
        kv: &dyn KvClient,
        id: &DocumentId,
    ) -> Result<Option<ActiveTransactionRecord>, ErrorClass> {
        let res = kv
            .lookup_in(
                id,
                &[
                    LookupInSpec::get_xattr(ATR_FIELD_ATTEMPTS),
                    LookupInSpec::get_xattr("$vbucket"),
                ],
                LookupInOptions::default(),
            )
            .await;
        let res = match res {
            Ok(res) => res,
            Err(hawser_kv::KvError::DocumentNotFound) => return Ok(None),
            Err(e) => return Err(ErrorClass::from(&e)),
        };

        // The server's current clock; the document's own CAS only says when
        // the ATR was last written.
        let now = res
            .entry(1)
            .and_then(|v| v.get("HLC"))
            .and_then(|v| v.as_u64())
            .unwrap_or(res.cas);
        let entries = match res.entry(0).and_then(|v| v.as_object()) {
            Some(attempts) => attempts
                .iter()
                .map(|(attempt_id, raw)| AtrEntry::parse(attempt_id, raw, now))
                .collect(),
            None => Vec::new(),
        };
        Ok(Some(ActiveTransactionRecord {
            id: id.clone(),
            entries,
        }))
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn entries(&self) -> &[AtrEntry] {
        &self.entries
    }

    /// Find the entry for a specific attempt.
    pub fn entry_for(&self, attempt_id: &str) -> Option<&AtrEntry> {
        self.entries.iter().find(|e| e.attempt_id == attempt_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_roundtrip() {
        for state in [
            AttemptState::NotStarted,
            AttemptState::Pending,
            AttemptState::Committed,
            AttemptState::Aborted,
            AttemptState::Completed,
            AttemptState::RolledBack,
        ] {
            assert_eq!(state.to_string().parse::<AttemptState>().unwrap(), state);
        }
        assert!("SIDEWAYS".parse::<AttemptState>().is_err());
    }

    #[test]
    fn test_entry_expiry() {
        let start_ns: u64 = 1_000_000_000_000; // 1000s in ns
        let raw = json!({
            "tst": "PENDING",
            "tst_s": start_ns,
            "exp": 100,
        });

        // 50ms later: not expired.
        let entry = AtrEntry::parse("a1", &raw, start_ns + 50 * 1_000_000);
        assert!(!entry.has_expired(0));
        assert_eq!(entry.age_ms(), 50);

        // 101ms later: expired without margin, not with one.
        let entry = AtrEntry::parse("a1", &raw, start_ns + 101 * 1_000_000);
        assert!(entry.has_expired(0));
        assert!(!entry.has_expired(1500));

        // Well past margin.
        let entry = AtrEntry::parse("a1", &raw, start_ns + 2_000 * 1_000_000);
        assert!(entry.has_expired(1500));
    }

    #[test]
    fn test_entry_without_timing_never_expires() {
        let entry = AtrEntry::parse("a1", &json!({ "tst": "PENDING" }), u64::MAX);
        assert!(!entry.has_expired(0));
    }

    #[test]
    fn test_doc_record_roundtrip() {
        let id = DocumentId::new("b", "s", "c", "k");
        let record = DocRecord::from(&id);
        assert_eq!(record.document_id(), id);
        let as_json = serde_json::to_value(&record).unwrap();
        assert_eq!(as_json, json!({"bkt": "b", "scp": "s", "col": "c", "key": "k"}));
    }
}
