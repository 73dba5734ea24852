//! Error classes
//!
//! Every storage-level error is mapped into one abstract failure class; the
//! class plus the current stage decide retry behavior everywhere in the
//! engine. Nothing above this module looks at a raw [`KvError`] again.

use hawser_kv::KvError;
use std::fmt;

/// Abstract failure classes used by all upper layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    FailExpiry,
    FailDocNotFound,
    FailDocAlreadyExists,
    FailPathNotFound,
    FailPathAlreadyExists,
    FailCasMismatch,
    FailTransient,
    FailAmbiguous,
    FailAtrFull,
    FailWriteWriteConflict,
    FailHard,
    FailOther,
}

impl From<&KvError> for ErrorClass {
    fn from(err: &KvError) -> Self {
        match err {
            KvError::DocumentNotFound => ErrorClass::FailDocNotFound,
            KvError::DocumentExists => ErrorClass::FailDocAlreadyExists,
            KvError::PathNotFound(_) => ErrorClass::FailPathNotFound,
            KvError::PathExists(_) => ErrorClass::FailPathAlreadyExists,
            KvError::CasMismatch => ErrorClass::FailCasMismatch,
            KvError::ValueTooLarge => ErrorClass::FailAtrFull,
            KvError::DurabilityAmbiguous => ErrorClass::FailAmbiguous,
            KvError::Temporary | KvError::Timeout => ErrorClass::FailTransient,
            KvError::Fatal(_) => ErrorClass::FailHard,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::FailExpiry => "FAIL_EXPIRY",
            ErrorClass::FailDocNotFound => "FAIL_DOC_NOT_FOUND",
            ErrorClass::FailDocAlreadyExists => "FAIL_DOC_ALREADY_EXISTS",
            ErrorClass::FailPathNotFound => "FAIL_PATH_NOT_FOUND",
            ErrorClass::FailPathAlreadyExists => "FAIL_PATH_ALREADY_EXISTS",
            ErrorClass::FailCasMismatch => "FAIL_CAS_MISMATCH",
            ErrorClass::FailTransient => "FAIL_TRANSIENT",
            ErrorClass::FailAmbiguous => "FAIL_AMBIGUOUS",
            ErrorClass::FailAtrFull => "FAIL_ATR_FULL",
            ErrorClass::FailWriteWriteConflict => "FAIL_WRITE_WRITE_CONFLICT",
            ErrorClass::FailHard => "FAIL_HARD",
            ErrorClass::FailOther => "FAIL_OTHER",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_error_mapping() {
        assert_eq!(
            ErrorClass::from(&KvError::DocumentNotFound),
            ErrorClass::FailDocNotFound
        );
        assert_eq!(
            ErrorClass::from(&KvError::DurabilityAmbiguous),
            ErrorClass::FailAmbiguous
        );
        assert_eq!(
            ErrorClass::from(&KvError::Temporary),
            ErrorClass::FailTransient
        );
        assert_eq!(
            ErrorClass::from(&KvError::ValueTooLarge),
            ErrorClass::FailAtrFull
        );
        assert_eq!(
            ErrorClass::from(&KvError::Fatal("disk on fire".into())),
            ErrorClass::FailHard
        );
    }
}
