//! Transaction configuration

use crate::hooks::{AttemptHooks, CleanupHooks};
use hawser_kv::DurabilityLevel;
use std::time::Duration;

/// Configuration for a [`Transactions`](crate::Transactions) instance.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    expiration_time: Duration,
    durability: DurabilityLevel,
    cleanup_window: Duration,
    cleanup_lost_attempts: bool,
    cleanup_client_attempts: bool,
    hooks: AttemptHooks,
    cleanup_hooks: CleanupHooks,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            expiration_time: Duration::from_secs(15),
            durability: DurabilityLevel::Majority,
            cleanup_window: Duration::from_secs(60),
            cleanup_lost_attempts: true,
            cleanup_client_attempts: true,
            hooks: AttemptHooks::default(),
            cleanup_hooks: CleanupHooks::default(),
        }
    }
}

impl TransactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total wall-clock budget for one call to `run`, retries included.
    pub fn with_expiration_time(mut self, expiration_time: Duration) -> Self {
        self.expiration_time = expiration_time;
        self
    }

    /// Durability required of every staging, unstaging and ATR write.
    pub fn with_durability_level(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }

    /// How often the lost-attempts scanner sweeps each bucket's ATRs.
    pub fn with_cleanup_window(mut self, cleanup_window: Duration) -> Self {
        self.cleanup_window = cleanup_window;
        self
    }

    /// Scan ATRs for attempts abandoned by other (possibly dead) clients.
    pub fn with_cleanup_lost_attempts(mut self, enabled: bool) -> Self {
        self.cleanup_lost_attempts = enabled;
        self
    }

    /// Sweep this client's own attempts after they finish.
    pub fn with_cleanup_client_attempts(mut self, enabled: bool) -> Self {
        self.cleanup_client_attempts = enabled;
        self
    }

    /// Install attempt-level testing hooks.
    pub fn with_attempt_hooks(mut self, hooks: AttemptHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Install cleanup testing hooks.
    pub fn with_cleanup_hooks(mut self, cleanup_hooks: CleanupHooks) -> Self {
        self.cleanup_hooks = cleanup_hooks;
        self
    }

    pub fn expiration_time(&self) -> Duration {
        self.expiration_time
    }

    pub fn durability(&self) -> DurabilityLevel {
        self.durability
    }

    pub fn cleanup_window(&self) -> Duration {
        self.cleanup_window
    }

    pub fn cleanup_lost_attempts(&self) -> bool {
        self.cleanup_lost_attempts
    }

    pub fn cleanup_client_attempts(&self) -> bool {
        self.cleanup_client_attempts
    }

    pub fn hooks(&self) -> &AttemptHooks {
        &self.hooks
    }

    pub fn cleanup_hooks(&self) -> &CleanupHooks {
        &self.cleanup_hooks
    }
}
