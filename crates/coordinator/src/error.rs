//! Error types for the coordinator.
//!
//! Completion never short-circuits: per-participant failures are collected
//! so that every participant gets its completion attempt, and the first
//! failure is surfaced once, after cleanup, with the rest attached as
//! suppressed errors. [`TransactionError`] therefore carries a kind, an
//! optional cause, and a suppressed list rather than being a bare enum.

use std::fmt;
use thiserror::Error;
use veto_common::{ResourceError, SynchronizationError};

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Classification of a [`TransactionError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The operation was attempted against a transaction already marked
    /// for rollback or rolled back, or completion ended in rollback.
    Rollback(String),
    /// A branch committed before the unit of work rolled back.
    HeuristicCommit,
    /// Some branches committed while others rolled back.
    HeuristicMixed,
    /// Every branch rolled back before the unit of work committed.
    HeuristicRollback,
    /// The transaction is in the wrong status for the requested
    /// operation, or its deadline has passed.
    InvalidState(String),
    /// A resource manager failed or reported a heuristic outcome.
    Resource(String),
    /// A synchronization callback failed.
    Synchronization(String),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Rollback(reason) => write!(f, "transaction rolled back: {reason}"),
            ErrorKind::HeuristicCommit => {
                f.write_str("heuristic commit: a branch committed before rollback")
            }
            ErrorKind::HeuristicMixed => {
                f.write_str("heuristic mixed outcome: branches disagree on completion")
            }
            ErrorKind::HeuristicRollback => {
                f.write_str("heuristic rollback: every branch rolled back before commit")
            }
            ErrorKind::InvalidState(reason) => write!(f, "invalid transaction state: {reason}"),
            ErrorKind::Resource(reason) => write!(f, "resource failure: {reason}"),
            ErrorKind::Synchronization(reason) => write!(f, "synchronization failure: {reason}"),
        }
    }
}

/// Error raised by transaction operations.
#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct TransactionError {
    kind: ErrorKind,
    #[source]
    cause: Option<Box<TransactionError>>,
    suppressed: Vec<TransactionError>,
}

impl TransactionError {
    fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            cause: None,
            suppressed: Vec::new(),
        }
    }

    pub(crate) fn rollback(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rollback(reason.into()))
    }

    pub(crate) fn heuristic_commit() -> Self {
        Self::new(ErrorKind::HeuristicCommit)
    }

    pub(crate) fn heuristic_mixed() -> Self {
        Self::new(ErrorKind::HeuristicMixed)
    }

    pub(crate) fn heuristic_rollback() -> Self {
        Self::new(ErrorKind::HeuristicRollback)
    }

    pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState(reason.into()))
    }

    pub(crate) fn resource(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource(reason.into()))
    }

    /// Attach the underlying cause, replacing any previous one.
    pub(crate) fn with_cause(mut self, cause: TransactionError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Attach a secondary failure collected after this one.
    pub(crate) fn push_suppressed(&mut self, error: TransactionError) {
        self.suppressed.push(error);
    }

    /// Classification of this error.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The error that led to this one, if any.
    pub fn cause(&self) -> Option<&TransactionError> {
        self.cause.as_deref()
    }

    /// Secondary failures collected while handling this error.
    pub fn suppressed(&self) -> &[TransactionError] {
        &self.suppressed
    }

    /// Whether this is a rollback error.
    pub fn is_rollback(&self) -> bool {
        matches!(self.kind, ErrorKind::Rollback(_))
    }

    /// Whether this is one of the heuristic-outcome errors.
    pub fn is_heuristic(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::HeuristicCommit | ErrorKind::HeuristicMixed | ErrorKind::HeuristicRollback
        )
    }

    /// Whether this is an invalid-state error.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidState(_))
    }
}

impl From<ResourceError> for TransactionError {
    fn from(error: ResourceError) -> Self {
        Self::new(ErrorKind::Resource(error.to_string()))
    }
}

impl From<SynchronizationError> for TransactionError {
    fn from(error: SynchronizationError) -> Self {
        Self::new(ErrorKind::Synchronization(error.to_string()))
    }
}

/// Fold `outcome` into an accumulated primary error.
///
/// The first failure becomes the primary; later failures are attached to
/// it as suppressed errors so that no participant's failure is lost.
pub(crate) fn suppress(
    primary: Option<TransactionError>,
    outcome: Result<()>,
) -> Option<TransactionError> {
    match (primary, outcome) {
        (None, Err(error)) => Some(error),
        (Some(mut primary), Err(error)) => {
            primary.push_suppressed(error);
            Some(primary)
        }
        (primary, Ok(())) => primary,
    }
}
