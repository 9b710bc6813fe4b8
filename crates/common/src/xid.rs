//! Global/branch transaction identifiers.
//!
//! Every branch of a unit of work shares its root's global id; the branch
//! id is unique per branch. UUIDv7 provides time-ordered uniqueness with
//! a deterministic total ordering.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier binding a transaction branch to its root.
///
/// Equality and hashing are structural over both components. The value is
/// immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid {
    global: Uuid,
    branch: Uuid,
}

impl Xid {
    /// Generate the identifier for a new root transaction.
    pub fn new_root() -> Self {
        Self {
            global: Uuid::now_v7(),
            branch: Uuid::now_v7(),
        }
    }

    /// Generate the identifier for a new branch of `parent`.
    ///
    /// The global id is reused; only the branch id is fresh.
    pub fn new_branch(parent: &Xid) -> Self {
        Self {
            global: parent.global,
            branch: Uuid::now_v7(),
        }
    }

    /// The global transaction id shared by every branch of one root.
    pub fn global(&self) -> &Uuid {
        &self.global
    }

    /// The branch qualifier, unique per branch.
    pub fn branch(&self) -> &Uuid {
        &self.branch
    }

    /// Whether `other` belongs to the same unit of work.
    pub fn same_global(&self, other: &Xid) -> bool {
        self.global == other.global
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.global.simple(), self.branch.simple())
    }
}
