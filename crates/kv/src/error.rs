//! Storage-level error taxonomy
//!
//! These are the raw failure modes of the substrate. The transaction engine
//! maps them into its own error classes; nothing above this crate matches on
//! anything finer-grained than these variants.

use thiserror::Error;

/// Errors surfaced by the KV substrate.
#[derive(Debug, Clone, Error)]
pub enum KvError {
    #[error("document not found")]
    DocumentNotFound,

    #[error("document already exists")]
    DocumentExists,

    #[error("sub-document path not found: {0}")]
    PathNotFound(String),

    #[error("sub-document path already exists: {0}")]
    PathExists(String),

    #[error("CAS mismatch")]
    CasMismatch,

    #[error("value too large")]
    ValueTooLarge,

    #[error("durable write completion is ambiguous")]
    DurabilityAmbiguous,

    #[error("temporary failure, retry later")]
    Temporary,

    #[error("operation timed out")]
    Timeout,

    #[error("fatal storage error: {0}")]
    Fatal(String),
}

/// Result type alias for substrate operations.
pub type Result<T> = std::result::Result<T, KvError>;
