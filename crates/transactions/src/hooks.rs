//! Testing hooks
//!
//! Hook points around every ATR write and staged operation are consulted as
//! pseudo-errors: a hook returning an [`ErrorClass`] is handled exactly as if
//! the underlying KV call had failed that way. Production builds run the
//! defaults, which never fire.

use crate::error_class::ErrorClass;
use std::sync::Arc;

/// Hook consulted with the affected document key (or `""`).
pub type Hook = Arc<dyn Fn(&str) -> Option<ErrorClass> + Send + Sync>;

/// Hook consulted with (stage, document key).
pub type ExpiryHook = Arc<dyn Fn(&str, Option<&str>) -> bool + Send + Sync>;

/// Hook overriding ATR key selection for a document key.
pub type AtrIdHook = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Notification-only cleanup hook.
pub type CleanupNotifyHook = Arc<dyn Fn() + Send + Sync>;

fn noop() -> Hook {
    Arc::new(|_| None)
}

/// Hooks around the attempt state machine.
#[derive(Clone)]
pub struct AttemptHooks {
    pub before_atr_pending: Hook,
    pub after_atr_pending: Hook,
    pub before_atr_commit: Hook,
    pub after_atr_commit: Hook,
    pub before_atr_commit_ambiguity_resolution: Hook,
    pub before_atr_complete: Hook,
    pub after_atr_complete: Hook,
    pub before_atr_aborted: Hook,
    pub after_atr_aborted: Hook,
    pub before_atr_rolled_back: Hook,
    pub after_atr_rolled_back: Hook,
    pub before_doc_get: Hook,
    pub after_get_complete: Hook,
    pub before_staged_insert: Hook,
    pub after_staged_insert_complete: Hook,
    pub before_staged_replace: Hook,
    pub after_staged_replace_complete: Hook,
    pub before_staged_remove: Hook,
    pub after_staged_remove_complete: Hook,
    pub before_doc_committed: Hook,
    pub before_doc_removed: Hook,
    pub before_rollback_delete_inserted: Hook,
    pub before_doc_rolled_back: Hook,
    pub before_check_atr_entry_for_blocking_doc: Hook,
    pub before_get_doc_in_exists_during_staged_insert: Hook,
    pub has_expired_client_side: ExpiryHook,
    pub random_atr_id_for_vbucket: AtrIdHook,
}

impl Default for AttemptHooks {
    fn default() -> Self {
        Self {
            before_atr_pending: noop(),
            after_atr_pending: noop(),
            before_atr_commit: noop(),
            after_atr_commit: noop(),
            before_atr_commit_ambiguity_resolution: noop(),
            before_atr_complete: noop(),
            after_atr_complete: noop(),
            before_atr_aborted: noop(),
            after_atr_aborted: noop(),
            before_atr_rolled_back: noop(),
            after_atr_rolled_back: noop(),
            before_doc_get: noop(),
            after_get_complete: noop(),
            before_staged_insert: noop(),
            after_staged_insert_complete: noop(),
            before_staged_replace: noop(),
            after_staged_replace_complete: noop(),
            before_staged_remove: noop(),
            after_staged_remove_complete: noop(),
            before_doc_committed: noop(),
            before_doc_removed: noop(),
            before_rollback_delete_inserted: noop(),
            before_doc_rolled_back: noop(),
            before_check_atr_entry_for_blocking_doc: noop(),
            before_get_doc_in_exists_during_staged_insert: noop(),
            has_expired_client_side: Arc::new(|_, _| false),
            random_atr_id_for_vbucket: Arc::new(|_| None),
        }
    }
}

impl std::fmt::Debug for AttemptHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AttemptHooks")
    }
}

/// Hooks around the cleanup engine.
#[derive(Clone)]
pub struct CleanupHooks {
    pub before_commit_doc: Hook,
    pub before_remove_doc: Hook,
    pub before_remove_doc_staged_for_removal: Hook,
    pub before_remove_links: Hook,
    pub before_atr_remove: Hook,
    pub on_cleanup_docs_completed: CleanupNotifyHook,
    pub on_cleanup_completed: CleanupNotifyHook,
}

impl Default for CleanupHooks {
    fn default() -> Self {
        Self {
            before_commit_doc: noop(),
            before_remove_doc: noop(),
            before_remove_doc_staged_for_removal: noop(),
            before_remove_links: noop(),
            before_atr_remove: noop(),
            on_cleanup_docs_completed: Arc::new(|| {}),
            on_cleanup_completed: Arc::new(|| {}),
        }
    }
}

impl std::fmt::Debug for CleanupHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CleanupHooks")
    }
}
