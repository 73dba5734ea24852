//! The KV client trait consumed by the transaction engine

use crate::error::Result;
use crate::subdoc::{LookupInOptions, LookupInSpec, MutateInOptions, MutateInSpec};
use crate::types::{DocumentId, DurabilityLevel};
use async_trait::async_trait;
use serde_json::Value;

/// Result of a `lookup_in`.
#[derive(Debug, Clone)]
pub struct LookupInResult {
    /// Document CAS at the time of the lookup.
    pub cas: u64,
    /// One entry per spec, in order; `None` when the path was not found.
    pub entries: Vec<Option<Value>>,
    /// Whether the document is a tombstone.
    pub is_deleted: bool,
}

impl LookupInResult {
    /// The entry at `index`, flattened.
    pub fn entry(&self, index: usize) -> Option<&Value> {
        self.entries.get(index).and_then(|e| e.as_ref())
    }
}

/// Result of a successful mutation.
#[derive(Debug, Clone, Copy)]
pub struct MutateInResult {
    /// Document CAS after the mutation.
    pub cas: u64,
}

/// The storage primitives the transaction engine requires.
///
/// Everything the engine does (staging, ATR maintenance, unstaging,
/// cleanup) is expressed through these four calls.
#[async_trait]
pub trait KvClient: Send + Sync {
    /// Fetch a set of sub-document paths (and optionally the body) atomically.
    async fn lookup_in(
        &self,
        id: &DocumentId,
        specs: &[LookupInSpec],
        options: LookupInOptions,
    ) -> Result<LookupInResult>;

    /// Apply a set of sub-document mutations atomically.
    async fn mutate_in(
        &self,
        id: &DocumentId,
        specs: &[MutateInSpec],
        options: MutateInOptions,
    ) -> Result<MutateInResult>;

    /// Insert a full document. Fails if a live document already exists.
    async fn insert(
        &self,
        id: &DocumentId,
        value: Value,
        durability: DurabilityLevel,
    ) -> Result<MutateInResult>;

    /// Remove a full document at the given CAS.
    async fn remove(&self, id: &DocumentId, cas: u64, durability: DurabilityLevel) -> Result<()>;
}
