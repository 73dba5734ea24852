//! Document identity and durability levels

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully-qualified document identity.
///
/// Two identities compare equal iff bucket, scope, collection and key all
/// match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId {
    bucket: String,
    scope: String,
    collection: String,
    key: String,
}

impl DocumentId {
    /// Create a new document identity.
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// Identity in the default scope and collection of a bucket.
    pub fn in_default_collection(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(bucket, "_default", "_default", key)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The `scope.collection` spec string used in staged xattrs and results.
    pub fn collection_spec(&self) -> String {
        format!("{}.{}", self.scope, self.collection)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.bucket, self.scope, self.collection, self.key
        )
    }
}

/// Durability required of a mutation before it is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DurabilityLevel {
    /// No durability beyond the active node's memory.
    None,
    /// Replicated to a majority of nodes.
    #[default]
    Majority,
    /// Replicated to a majority and persisted on the active node.
    MajorityAndPersistOnMaster,
    /// Persisted on a majority of nodes.
    PersistToMajority,
}
