//! Sub-document operation specs
//!
//! Lookups and mutations address individual paths inside a document or its
//! xattr tree. Paths are dotted (`txn.id.atmpt`, `attempts.<uuid>.tst`).

use crate::types::DurabilityLevel;
use serde_json::Value;

/// Server-expanded macro: the document's post-mutation CAS.
pub const MACRO_CAS: &str = "${Mutation.CAS}";

/// Server-expanded macro: CRC32-C of the post-mutation document body.
pub const MACRO_VALUE_CRC32C: &str = "${Mutation.value-crc32c}";

/// Sub-document lookup opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOpcode {
    /// Fetch the value at a path.
    Get,
    /// Fetch the whole document body.
    GetDoc,
}

/// One path fetched by a `lookup_in`.
#[derive(Debug, Clone)]
pub struct LookupInSpec {
    pub opcode: LookupOpcode,
    pub path: String,
    pub xattr: bool,
}

impl LookupInSpec {
    /// Fetch an xattr path.
    pub fn get_xattr(path: impl Into<String>) -> Self {
        Self {
            opcode: LookupOpcode::Get,
            path: path.into(),
            xattr: true,
        }
    }

    /// Fetch the full document body.
    pub fn get_doc() -> Self {
        Self {
            opcode: LookupOpcode::GetDoc,
            path: String::new(),
            xattr: false,
        }
    }
}

/// Sub-document mutation opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutateOpcode {
    /// Add a dictionary entry; fails if the path already exists.
    DictAdd,
    /// Add or overwrite a dictionary entry.
    DictUpsert,
    /// Remove the value at a path; fails if it does not exist.
    Remove,
    /// Replace the value at a path; fails if it does not exist.
    Replace,
    /// Replace the whole document body.
    SetDoc,
}

/// One mutation applied by a `mutate_in`.
#[derive(Debug, Clone)]
pub struct MutateInSpec {
    pub opcode: MutateOpcode,
    pub path: String,
    pub xattr: bool,
    pub create_path: bool,
    pub expand_macros: bool,
    pub value: Value,
}

impl MutateInSpec {
    /// Upsert an xattr path, creating intermediate dictionaries.
    pub fn upsert_xattr(path: impl Into<String>, value: Value) -> Self {
        Self {
            opcode: MutateOpcode::DictUpsert,
            path: path.into(),
            xattr: true,
            create_path: true,
            expand_macros: false,
            value,
        }
    }

    /// Upsert an xattr path whose value is a server-expanded macro.
    pub fn upsert_xattr_macro(path: impl Into<String>, macro_name: &str) -> Self {
        Self {
            opcode: MutateOpcode::DictUpsert,
            path: path.into(),
            xattr: true,
            create_path: true,
            expand_macros: true,
            value: Value::String(macro_name.to_string()),
        }
    }

    /// Add an xattr path, failing if it already exists.
    pub fn add_xattr(path: impl Into<String>, value: Value) -> Self {
        Self {
            opcode: MutateOpcode::DictAdd,
            path: path.into(),
            xattr: true,
            create_path: true,
            expand_macros: false,
            value,
        }
    }

    /// Add an xattr path whose value is a server-expanded macro.
    pub fn add_xattr_macro(path: impl Into<String>, macro_name: &str) -> Self {
        Self {
            opcode: MutateOpcode::DictAdd,
            path: path.into(),
            xattr: true,
            create_path: true,
            expand_macros: true,
            value: Value::String(macro_name.to_string()),
        }
    }

    /// Remove an xattr path.
    pub fn remove_xattr(path: impl Into<String>) -> Self {
        Self {
            opcode: MutateOpcode::Remove,
            path: path.into(),
            xattr: true,
            create_path: false,
            expand_macros: false,
            value: Value::Null,
        }
    }

    /// Replace the whole document body.
    pub fn set_doc(value: Value) -> Self {
        Self {
            opcode: MutateOpcode::SetDoc,
            path: String::new(),
            xattr: false,
            create_path: false,
            expand_macros: false,
            value,
        }
    }
}

/// How `mutate_in` treats the document as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreSemantics {
    /// The document must not exist.
    Insert,
    /// Create the document if absent.
    Upsert,
    /// The document must exist.
    #[default]
    Replace,
}

/// Options for a `lookup_in`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LookupInOptions {
    /// Allow the lookup to see tombstones.
    pub access_deleted: bool,
}

/// Options for a `mutate_in`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutateInOptions {
    /// Expected CAS; 0 means no check.
    pub cas: u64,
    pub store_semantics: StoreSemantics,
    /// Allow the mutation to land on a tombstone.
    pub access_deleted: bool,
    /// When creating the document, create it as a tombstone.
    pub create_as_deleted: bool,
    pub durability: DurabilityLevel,
}
