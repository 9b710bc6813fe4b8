//! Participant capability contracts.
//!
//! A [`ResourceManager`] is an independently-recoverable store of work that
//! votes in phase 1 and applies or discards its work in phase 2. A
//! [`Synchronization`] is a lighter participant notified immediately before
//! and after completion without taking part in the vote.
//!
//! Both contracts are in-process capability objects. There is no wire
//! protocol here; a remote resource would be represented by a local proxy
//! implementing the same trait.

use crate::{TransactionStatus, Xid};
use std::any::Any;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Flag passed to [`ResourceManager::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFlag {
    /// First association of this resource with the given identifier.
    NoFlags,
    /// The identifier is a branch being folded into the resource's
    /// existing association.
    Join,
    /// Re-association after a suspend.
    Resume,
}

/// Flag passed to [`ResourceManager::end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndFlag {
    /// The work completed normally and may be prepared.
    Success,
    /// The work is doomed; the resource should expect a rollback.
    Fail,
    /// The association is being parked for a later resume.
    Suspend,
}

/// Phase-1 vote returned by [`ResourceManager::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareVote {
    /// The resource can commit and awaits the phase-2 decision.
    Ok,
    /// No work to commit; the resource drops out of phase 2.
    ReadOnly,
}

/// Outcome returned by [`ResourceManager::commit`].
///
/// Heuristic outcomes report that the resource decided unilaterally,
/// before or against the coordinator's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Committed as instructed.
    Ok,
    /// Transient failure; the coordinator may retry until its deadline.
    Retry,
    /// Already committed heuristically; consistent with the decision.
    HeuristicCommit,
    /// Already rolled back heuristically.
    HeuristicRollback,
    /// Part of the work committed and part rolled back.
    HeuristicMixed,
    /// The outcome of some of the work is unknowable.
    HeuristicHazard,
}

impl fmt::Display for CommitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CommitOutcome::Ok => "ok",
            CommitOutcome::Retry => "retry",
            CommitOutcome::HeuristicCommit => "heuristic-commit",
            CommitOutcome::HeuristicRollback => "heuristic-rollback",
            CommitOutcome::HeuristicMixed => "heuristic-mixed",
            CommitOutcome::HeuristicHazard => "heuristic-hazard",
        };
        f.write_str(text)
    }
}

/// Failure reported by a resource manager operation.
#[derive(Debug, Clone, Error)]
#[error("resource manager failure: {message}")]
pub struct ResourceError {
    message: String,
}

impl ResourceError {
    /// Create a new error with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure reported by a synchronization's pre-completion callback.
#[derive(Debug, Clone, Error)]
#[error("synchronization failure: {message}")]
pub struct SynchronizationError {
    message: String,
}

impl SynchronizationError {
    /// Create a new error with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An independently-recoverable participant in two-phase commit.
///
/// The coordinator brackets all work between `start` and `end`, then
/// drives `prepare`/`commit` or `rollback`. Implementations must be safe
/// to call from the coordinator's background rollback workers as well as
/// from caller threads.
///
/// Calls arrive while the owning transaction's lock is held; an
/// implementation must not call back into the transaction.
pub trait ResourceManager: Send + Sync {
    /// Associate the resource with a transaction branch.
    fn start(&self, xid: &Xid, flag: StartFlag) -> Result<(), ResourceError>;

    /// Dissociate the resource from a transaction branch.
    fn end(&self, xid: &Xid, flag: EndFlag) -> Result<(), ResourceError>;

    /// Phase 1: vote on whether the branch can commit.
    fn prepare(&self, xid: &Xid) -> Result<PrepareVote, ResourceError>;

    /// Phase 2: apply the branch's work.
    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<CommitOutcome, ResourceError>;

    /// Discard the branch's work.
    fn rollback(&self, xid: &Xid) -> Result<(), ResourceError>;

    /// Forget a heuristically completed branch.
    fn forget(&self, xid: &Xid) -> Result<(), ResourceError>;

    /// Whether `other` is backed by the same underlying manager.
    ///
    /// Used to deduplicate enlistments. Implementations typically
    /// downcast `other` via [`ResourceManager::as_any`] and compare an
    /// internal identity.
    fn is_same_rm(&self, other: &dyn ResourceManager) -> bool;

    /// Set the operation timeout for subsequent work on this resource.
    fn set_timeout(&self, timeout: Duration) -> Result<(), ResourceError>;

    /// Concrete-type access for [`ResourceManager::is_same_rm`].
    fn as_any(&self) -> &dyn Any;
}

/// A completion observer registered with a transaction.
pub trait Synchronization: Send + Sync {
    /// Invoked before phase 1 begins, while the outcome is still open.
    ///
    /// Returning an error dooms the transaction into rollback.
    fn before_completion(&self) -> Result<(), SynchronizationError>;

    /// Invoked after completion with the final status.
    ///
    /// Completion has already happened; this notification cannot change
    /// the outcome and therefore cannot fail.
    fn after_completion(&self, status: TransactionStatus);
}
