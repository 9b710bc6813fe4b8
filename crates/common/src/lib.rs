//! Shared vocabulary for the Veto transaction coordinator.
//!
//! This crate defines the pieces both sides of the coordination boundary
//! agree on: the global/branch identifier scheme ([`Xid`]), the transaction
//! status codes ([`TransactionStatus`]), and the capability contracts a
//! participant implements to take part in two-phase commit
//! ([`ResourceManager`], [`Synchronization`]).

mod resource;
mod status;
mod xid;

pub use resource::{
    CommitOutcome, EndFlag, PrepareVote, ResourceError, ResourceManager, StartFlag,
    Synchronization, SynchronizationError,
};
pub use status::TransactionStatus;
pub use xid::Xid;
