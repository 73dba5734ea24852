//! Common types for hawser
//!
//! This crate defines the identifier types shared between the transaction
//! engine and its collaborators: transaction IDs and attempt IDs.

mod ids;

pub use ids::AttemptId;
pub use ids::TransactionId;
