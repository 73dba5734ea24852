//! In-memory mock cluster
//!
//! Implements the full substrate surface (CAS, xattr trees, tombstones,
//! `create_as_deleted`, macro expansion and the virtual xattrs) against a
//! process-local map. All engine tests run against this, the same way the
//! real client would be driven.
//!
//! CAS values are monotonically increasing nanosecond timestamps, so code
//! that interprets a CAS as a wall-clock instant behaves the same here as
//! against a real cluster.

use crate::client::{KvClient, LookupInResult, MutateInResult};
use crate::error::{KvError, Result};
use crate::subdoc::{
    LookupInOptions, LookupInSpec, LookupOpcode, MutateInOptions, MutateInSpec, MutateOpcode,
    StoreSemantics, MACRO_CAS, MACRO_VALUE_CRC32C,
};
use crate::types::{DocumentId, DurabilityLevel};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
struct MockDocument {
    body: Option<Value>,
    xattrs: Value,
    cas: u64,
    revid: u64,
    exptime: u64,
    deleted: bool,
}

impl MockDocument {
    fn new_tombstone() -> Self {
        Self {
            body: None,
            xattrs: Value::Object(Map::new()),
            cas: 0,
            revid: 0,
            exptime: 0,
            deleted: true,
        }
    }

    fn body_crc32c(&self) -> u32 {
        match &self.body {
            Some(v) => crc32c::crc32c(&serde_json::to_vec(v).unwrap_or_default()),
            None => crc32c::crc32c(&[]),
        }
    }

    fn metadata_json(&self) -> Value {
        json!({
            "CAS": self.cas,
            "revid": self.revid.to_string(),
            "exptime": self.exptime,
            "value_crc32c": self.body_crc32c(),
            "deleted": self.deleted,
        })
    }
}

/// In-memory cluster implementing [`KvClient`].
pub struct MockCluster {
    docs: Mutex<HashMap<DocumentId, MockDocument>>,
    cas_counter: AtomicU64,
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            cas_counter: AtomicU64::new(0),
        }
    }

    /// Next CAS: nanosecond wall clock, forced monotonic.
    fn next_cas(&self) -> u64 {
        let now = now_ns();
        self.cas_counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .map(|prev| now.max(prev + 1))
            .unwrap_or(now)
    }

    /// Seed a live document directly, bypassing the substrate surface.
    pub fn seed(&self, id: DocumentId, body: Value) -> u64 {
        let cas = self.next_cas();
        let mut docs = self.docs.lock();
        docs.insert(
            id,
            MockDocument {
                body: Some(body),
                xattrs: Value::Object(Map::new()),
                cas,
                revid: 1,
                exptime: 0,
                deleted: false,
            },
        );
        cas
    }

    /// What a non-transactional reader sees: the body of a live document.
    pub fn get_live(&self, id: &DocumentId) -> Option<Value> {
        let docs = self.docs.lock();
        docs.get(id)
            .filter(|d| !d.deleted)
            .and_then(|d| d.body.clone())
    }

    /// Whether a live document exists.
    pub fn contains_live(&self, id: &DocumentId) -> bool {
        self.get_live(id).is_some()
    }

    /// Peek at an xattr path, tombstones included. Test observation only.
    pub fn xattr(&self, id: &DocumentId, path: &str) -> Option<Value> {
        let docs = self.docs.lock();
        docs.get(id)
            .and_then(|d| lookup_path(&d.xattrs, path).cloned())
    }

    /// Current CAS of a document, tombstones included.
    pub fn cas_of(&self, id: &DocumentId) -> Option<u64> {
        let docs = self.docs.lock();
        docs.get(id).map(|d| d.cas)
    }

    /// Whether the document exists only as a tombstone.
    pub fn is_tombstone(&self, id: &DocumentId) -> bool {
        let docs = self.docs.lock();
        docs.get(id).map(|d| d.deleted).unwrap_or(false)
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvClient for MockCluster {
    async fn lookup_in(
        &self,
        id: &DocumentId,
        specs: &[LookupInSpec],
        options: LookupInOptions,
    ) -> Result<LookupInResult> {
        let docs = self.docs.lock();
        let doc = docs.get(id).ok_or(KvError::DocumentNotFound)?;
        if doc.deleted && !options.access_deleted {
            return Err(KvError::DocumentNotFound);
        }

        let mut entries = Vec::with_capacity(specs.len());
        for spec in specs {
            let entry = match spec.opcode {
                LookupOpcode::GetDoc => doc.body.clone(),
                LookupOpcode::Get => {
                    if spec.path == "$document" {
                        Some(doc.metadata_json())
                    } else if spec.path == "$vbucket" {
                        Some(json!({ "HLC": now_ns() }))
                    } else if spec.xattr {
                        lookup_path(&doc.xattrs, &spec.path).cloned()
                    } else {
                        doc.body
                            .as_ref()
                            .and_then(|b| lookup_path(b, &spec.path).cloned())
                    }
                }
            };
            entries.push(entry);
        }

        Ok(LookupInResult {
            cas: doc.cas,
            entries,
            is_deleted: doc.deleted,
        })
    }

    async fn mutate_in(
        &self,
        id: &DocumentId,
        specs: &[MutateInSpec],
        options: MutateInOptions,
    ) -> Result<MutateInResult> {
        let mut docs = self.docs.lock();
        let existing = docs.get(id);

        let mut doc = match options.store_semantics {
            StoreSemantics::Insert => {
                if existing.is_some() {
                    // A tombstone blocks too: the server must reserve the key
                    // before it can create the staged shadow.
                    return Err(KvError::DocumentExists);
                }
                let mut d = MockDocument::new_tombstone();
                d.deleted = options.create_as_deleted;
                d
            }
            StoreSemantics::Replace => {
                let existing = existing.ok_or(KvError::DocumentNotFound)?;
                if existing.deleted && !options.access_deleted {
                    return Err(KvError::DocumentNotFound);
                }
                if options.cas != 0 && existing.cas != options.cas {
                    return Err(KvError::CasMismatch);
                }
                existing.clone()
            }
            StoreSemantics::Upsert => match existing {
                Some(existing) if !existing.deleted || options.access_deleted => {
                    if options.cas != 0 && existing.cas != options.cas {
                        return Err(KvError::CasMismatch);
                    }
                    existing.clone()
                }
                _ => {
                    let mut d = MockDocument::new_tombstone();
                    d.deleted = options.create_as_deleted;
                    d
                }
            },
        };

        let new_cas = self.next_cas();
        for spec in specs {
            apply_spec(&mut doc, spec, new_cas)?;
        }

        doc.cas = new_cas;
        doc.revid += 1;
        docs.insert(id.clone(), doc);
        Ok(MutateInResult { cas: new_cas })
    }

    async fn insert(
        &self,
        id: &DocumentId,
        value: Value,
        _durability: DurabilityLevel,
    ) -> Result<MutateInResult> {
        let mut docs = self.docs.lock();
        if let Some(existing) = docs.get(id) {
            if !existing.deleted {
                return Err(KvError::DocumentExists);
            }
        }
        // Reviving a tombstone discards its user xattrs.
        let cas = self.next_cas();
        let revid = docs.get(id).map(|d| d.revid + 1).unwrap_or(1);
        docs.insert(
            id.clone(),
            MockDocument {
                body: Some(value),
                xattrs: Value::Object(Map::new()),
                cas,
                revid,
                exptime: 0,
                deleted: false,
            },
        );
        Ok(MutateInResult { cas })
    }

    async fn remove(&self, id: &DocumentId, cas: u64, _durability: DurabilityLevel) -> Result<()> {
        let mut docs = self.docs.lock();
        let doc = docs.get_mut(id).ok_or(KvError::DocumentNotFound)?;
        if doc.deleted {
            return Err(KvError::DocumentNotFound);
        }
        if cas != 0 && doc.cas != cas {
            return Err(KvError::CasMismatch);
        }
        doc.body = None;
        doc.xattrs = Value::Object(Map::new());
        doc.deleted = true;
        doc.cas = self.next_cas();
        doc.revid += 1;
        Ok(())
    }
}

/// The server clock surfaced through the `$vbucket` virtual xattr.
fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

/// Navigate a dotted path inside a JSON tree.
fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn apply_spec(doc: &mut MockDocument, spec: &MutateInSpec, new_cas: u64) -> Result<()> {
    let value = expand_macro(doc, spec, new_cas);
    match spec.opcode {
        MutateOpcode::SetDoc => {
            doc.body = Some(value);
            doc.deleted = false;
            Ok(())
        }
        MutateOpcode::DictAdd => mutate_path(&mut doc.xattrs, &spec.path, spec.create_path, |slot| {
            if slot.is_some() {
                Err(KvError::PathExists(spec.path.clone()))
            } else {
                *slot = Some(value);
                Ok(())
            }
        }),
        MutateOpcode::DictUpsert => {
            mutate_path(&mut doc.xattrs, &spec.path, spec.create_path, |slot| {
                *slot = Some(value);
                Ok(())
            })
        }
        MutateOpcode::Replace => mutate_path(&mut doc.xattrs, &spec.path, false, |slot| {
            if slot.is_none() {
                Err(KvError::PathNotFound(spec.path.clone()))
            } else {
                *slot = Some(value);
                Ok(())
            }
        }),
        MutateOpcode::Remove => mutate_path(&mut doc.xattrs, &spec.path, false, |slot| {
            if slot.take().is_none() {
                Err(KvError::PathNotFound(spec.path.clone()))
            } else {
                Ok(())
            }
        }),
    }
}

fn expand_macro(doc: &MockDocument, spec: &MutateInSpec, new_cas: u64) -> Value {
    if !spec.expand_macros {
        return spec.value.clone();
    }
    match spec.value.as_str() {
        Some(MACRO_CAS) => json!(new_cas),
        Some(MACRO_VALUE_CRC32C) => json!(doc.body_crc32c()),
        _ => spec.value.clone(),
    }
}

/// Walk to the parent of `path` and hand the final slot to `f`.
///
/// The slot is `None` when the final segment is absent. `f` may fill it,
/// replace it or take it; a taken slot removes the key.
fn mutate_path<F>(root: &mut Value, path: &str, create_path: bool, f: F) -> Result<()>
where
    F: FnOnce(&mut Option<Value>) -> Result<()>,
{
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments.split_last().ok_or_else(|| {
        KvError::PathNotFound(path.to_string())
    })?;

    let mut current = root;
    for segment in parents {
        if !current.is_object() {
            return Err(KvError::PathNotFound(path.to_string()));
        }
        let map = current.as_object_mut().expect("checked above");
        if !map.contains_key(*segment) {
            if create_path {
                map.insert(segment.to_string(), Value::Object(Map::new()));
            } else {
                return Err(KvError::PathNotFound(path.to_string()));
            }
        }
        current = map.get_mut(*segment).expect("just inserted");
    }

    let map = match current.as_object_mut() {
        Some(m) => m,
        None => return Err(KvError::PathNotFound(path.to_string())),
    };

    let mut slot = map.remove(*last);
    f(&mut slot)?;
    if let Some(value) = slot {
        map.insert(last.to_string(), value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(key: &str) -> DocumentId {
        DocumentId::in_default_collection("default", key)
    }

    #[tokio::test]
    async fn test_lookup_missing_doc() {
        let cluster = MockCluster::new();
        let err = cluster
            .lookup_in(&id("nope"), &[LookupInSpec::get_doc()], Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::DocumentNotFound));
    }

    #[tokio::test]
    async fn test_xattr_roundtrip() {
        let cluster = MockCluster::new();
        cluster.seed(id("a"), json!({"v": 1}));

        cluster
            .mutate_in(
                &id("a"),
                &[MutateInSpec::upsert_xattr("txn.id.atmpt", json!("att-1"))],
                Default::default(),
            )
            .await
            .unwrap();

        let res = cluster
            .lookup_in(
                &id("a"),
                &[
                    LookupInSpec::get_xattr("txn.id.atmpt"),
                    LookupInSpec::get_doc(),
                ],
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(res.entry(0), Some(&json!("att-1")));
        assert_eq!(res.entry(1), Some(&json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_dict_add_fails_on_existing_path() {
        let cluster = MockCluster::new();
        cluster.seed(id("a"), json!({}));

        let spec = MutateInSpec::add_xattr("attempts.x.tst", json!("PENDING"));
        cluster
            .mutate_in(&id("a"), &[spec.clone()], Default::default())
            .await
            .unwrap();
        let err = cluster
            .mutate_in(&id("a"), &[spec], Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::PathExists(_)));
    }

    #[tokio::test]
    async fn test_cas_mismatch() {
        let cluster = MockCluster::new();
        let cas = cluster.seed(id("a"), json!({"v": 1}));

        let options = MutateInOptions {
            cas: cas + 1,
            ..Default::default()
        };
        let err = cluster
            .mutate_in(
                &id("a"),
                &[MutateInSpec::upsert_xattr("x", json!(1))],
                options,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::CasMismatch));
    }

    #[tokio::test]
    async fn test_insert_semantics_blocked_by_tombstone() {
        let cluster = MockCluster::new();
        let cas = cluster.seed(id("a"), json!({"v": 1}));
        cluster
            .remove(&id("a"), cas, DurabilityLevel::None)
            .await
            .unwrap();
        assert!(cluster.is_tombstone(&id("a")));

        let options = MutateInOptions {
            store_semantics: StoreSemantics::Insert,
            create_as_deleted: true,
            access_deleted: true,
            ..Default::default()
        };
        let err = cluster
            .mutate_in(
                &id("a"),
                &[MutateInSpec::upsert_xattr("txn.op.type", json!("insert"))],
                options,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::DocumentExists));

        // Retrying at the tombstone's CAS with replace semantics lands.
        let options = MutateInOptions {
            cas: cluster.cas_of(&id("a")).unwrap(),
            store_semantics: StoreSemantics::Replace,
            access_deleted: true,
            ..Default::default()
        };
        cluster
            .mutate_in(
                &id("a"),
                &[MutateInSpec::upsert_xattr("txn.op.type", json!("insert"))],
                options,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_as_deleted_is_hidden_from_plain_reads() {
        let cluster = MockCluster::new();
        let options = MutateInOptions {
            store_semantics: StoreSemantics::Insert,
            create_as_deleted: true,
            access_deleted: true,
            ..Default::default()
        };
        cluster
            .mutate_in(
                &cluster_id(),
                &[MutateInSpec::upsert_xattr("txn.op.stgd", json!({"v": 9}))],
                options,
            )
            .await
            .unwrap();

        assert!(cluster.get_live(&cluster_id()).is_none());
        let err = cluster
            .lookup_in(
                &cluster_id(),
                &[LookupInSpec::get_doc()],
                Default::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::DocumentNotFound));

        // Visible to access_deleted lookups.
        let res = cluster
            .lookup_in(
                &cluster_id(),
                &[LookupInSpec::get_xattr("txn.op.stgd")],
                LookupInOptions {
                    access_deleted: true,
                },
            )
            .await
            .unwrap();
        assert!(res.is_deleted);
        assert_eq!(res.entry(0), Some(&json!({"v": 9})));
    }

    fn cluster_id() -> DocumentId {
        DocumentId::in_default_collection("default", "staged")
    }

    #[tokio::test]
    async fn test_macro_expansion() {
        let cluster = MockCluster::new();
        cluster.seed(id("a"), json!({"v": 1}));

        let res = cluster
            .mutate_in(
                &id("a"),
                &[MutateInSpec::upsert_xattr_macro("txn.op.crc32", MACRO_VALUE_CRC32C)],
                Default::default(),
            )
            .await
            .unwrap();

        let lookup = cluster
            .lookup_in(
                &id("a"),
                &[
                    LookupInSpec::get_xattr("txn.op.crc32"),
                    LookupInSpec::get_xattr("$document"),
                ],
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(lookup.cas, res.cas);
        // The staged CRC matches the server-computed CRC of the body.
        assert_eq!(
            lookup.entry(0),
            lookup.entry(1).and_then(|m| m.get("value_crc32c"))
        );
    }

    #[tokio::test]
    async fn test_remove_leaves_tombstone() {
        let cluster = MockCluster::new();
        let cas = cluster.seed(id("a"), json!({"v": 1}));
        cluster
            .remove(&id("a"), cas, DurabilityLevel::Majority)
            .await
            .unwrap();

        assert!(cluster.get_live(&id("a")).is_none());
        assert!(cluster.is_tombstone(&id("a")));

        // Full insert revives the tombstone with fresh xattrs.
        cluster
            .insert(&id("a"), json!({"v": 2}), DurabilityLevel::Majority)
            .await
            .unwrap();
        assert_eq!(cluster.get_live(&id("a")), Some(json!({"v": 2})));
    }
}
