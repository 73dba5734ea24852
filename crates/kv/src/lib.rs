//! Storage substrate interface for hawser
//!
//! The transaction engine sits on top of a document KV store that offers
//! single-document atomic sub-document mutations with CAS, durable writes,
//! and extended attributes (xattrs) carried alongside each document. This
//! crate defines that surface: document identity, the sub-document
//! lookup/mutate specs, durability levels and the error taxonomy, plus an
//! in-memory [`MockCluster`] that implements it for tests.

mod client;
mod error;
mod mock;
mod subdoc;
mod types;

pub use client::{KvClient, LookupInResult, MutateInResult};
pub use error::{KvError, Result};
pub use mock::MockCluster;
pub use subdoc::{
    LookupInOptions, LookupInSpec, LookupOpcode, MutateInOptions, MutateInSpec, MutateOpcode,
    StoreSemantics, MACRO_CAS, MACRO_VALUE_CRC32C,
};
pub use types::{DocumentId, DurabilityLevel};
