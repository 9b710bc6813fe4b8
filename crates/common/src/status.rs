//! Transaction status codes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a transaction as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Accepting enlistments and registrations.
    Active,
    /// Doomed; the only remaining outcome is rollback.
    MarkedRollback,
    /// Phase 1 in progress.
    Preparing,
    /// Every voting resource answered phase 1.
    Prepared,
    /// Phase 2 in progress.
    Committing,
    /// Terminal: committed.
    Committed,
    /// Rollback in progress.
    RollingBack,
    /// Terminal: rolled back.
    RolledBack,
    /// Suspended; no thread holds a claim on the transaction's resources.
    Unknown,
    /// Terminal: absorbed into a parent via join, or no transaction bound.
    NoTransaction,
}

impl TransactionStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionStatus::Committed
                | TransactionStatus::RolledBack
                | TransactionStatus::NoTransaction
        )
    }

    /// Idle statuses are safe for a parent to act on: terminal, or
    /// suspended with no implicit owner.
    pub fn is_idle(self) -> bool {
        self.is_terminal() || self == TransactionStatus::Unknown
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransactionStatus::Active => "active",
            TransactionStatus::MarkedRollback => "marked-rollback",
            TransactionStatus::Preparing => "preparing",
            TransactionStatus::Prepared => "prepared",
            TransactionStatus::Committing => "committing",
            TransactionStatus::Committed => "committed",
            TransactionStatus::RollingBack => "rolling-back",
            TransactionStatus::RolledBack => "rolled-back",
            TransactionStatus::Unknown => "unknown",
            TransactionStatus::NoTransaction => "no-transaction",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(TransactionStatus::Committed.is_terminal());
        assert!(TransactionStatus::RolledBack.is_terminal());
        assert!(TransactionStatus::NoTransaction.is_terminal());
        assert!(!TransactionStatus::Active.is_terminal());
        assert!(!TransactionStatus::Unknown.is_terminal());
        assert!(!TransactionStatus::MarkedRollback.is_terminal());
    }

    #[test]
    fn idle_includes_suspended() {
        assert!(TransactionStatus::Unknown.is_idle());
        assert!(TransactionStatus::Committed.is_idle());
        assert!(!TransactionStatus::Active.is_idle());
        assert!(!TransactionStatus::Preparing.is_idle());
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(TransactionStatus::MarkedRollback.to_string(), "marked-rollback");
        assert_eq!(TransactionStatus::NoTransaction.to_string(), "no-transaction");
    }
}
