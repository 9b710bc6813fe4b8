//! Coordinator configuration.

use std::time::Duration;

/// Configuration for a [`TransactionManager`](crate::TransactionManager).
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Timeout applied to new root transactions.
    pub default_timeout: Duration,

    /// Number of background workers servicing deadline rollbacks.
    pub scheduler_workers: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(120),
            scheduler_workers: 8,
        }
    }
}

impl CoordinatorConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the timeout applied to new root transactions.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets the rollback scheduler worker count.
    #[must_use]
    pub const fn scheduler_workers(mut self, workers: usize) -> Self {
        self.scheduler_workers = workers;
        self
    }
}
