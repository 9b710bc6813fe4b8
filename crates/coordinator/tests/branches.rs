//! Branch spawning, joining, and heuristic outcomes.

mod support;

use std::sync::Arc;
use std::time::Duration;
use support::{Journal, TestResource, TestSync};
use veto_common::TransactionStatus;
use veto_coordinator::{ErrorKind, RollbackScheduler, Transaction, TransactionFeed};

fn new_root(timeout: Duration) -> Transaction {
    Transaction::root(
        timeout,
        Arc::new(RollbackScheduler::new(2)),
        Arc::new(TransactionFeed::new()),
    )
    .unwrap()
}

#[test]
fn branch_shares_global_id_and_deadline() {
    let root = new_root(Duration::from_secs(5));
    let branch = Transaction::branch(&root).unwrap();

    assert!(root.xid().same_global(&branch.xid()));
    assert_ne!(root.xid().branch(), branch.xid().branch());
    assert_eq!(root.expires(), branch.expires());
}

#[test]
fn join_rejects_foreign_global_id() {
    let root = new_root(Duration::from_secs(5));
    let other = new_root(Duration::from_secs(5));

    let error = root.join(&other).unwrap_err();
    assert!(error.is_invalid_state());
}

#[test]
fn join_moves_resources_and_synchronizations_to_the_parent() {
    let journal = Journal::new();
    let root = new_root(Duration::from_secs(5));
    let branch = Transaction::branch(&root).unwrap();

    let resource = TestResource::new("r", &journal);
    let sync = TestSync::new("s", &journal);
    branch.enlist_resource(resource).unwrap();
    branch.register_synchronization(sync).unwrap();

    root.join(&branch).unwrap();

    // The branch is destroyed and its synchronization saw it end.
    assert_eq!(branch.status(), TransactionStatus::NoTransaction);
    assert_eq!(journal.count("s:after:no-transaction"), 1);

    // The resource was ended under the branch and re-started under the
    // parent with a join of the branch id.
    assert_eq!(journal.count("r:end:Success"), 1);
    assert_eq!(journal.count("r:start:Join"), 1);

    // The parent now completes the moved participants.
    root.commit().unwrap();
    assert_eq!(root.status(), TransactionStatus::Committed);
    assert_eq!(journal.count("r:prepare"), 1);
    assert_eq!(journal.count("r:commit"), 1);
    assert_eq!(journal.count("s:after:committed"), 1);
}

#[test]
fn commit_completes_idle_branches() {
    let journal = Journal::new();
    let root = new_root(Duration::from_secs(5));
    let branch = Transaction::branch(&root).unwrap();

    let resource = TestResource::new("r", &journal);
    branch.enlist_resource(resource).unwrap();
    branch.suspend().unwrap();

    root.commit().unwrap();
    assert_eq!(root.status(), TransactionStatus::Committed);
    assert_eq!(branch.status(), TransactionStatus::Committed);
    assert_eq!(journal.count("r:prepare"), 1);
    assert_eq!(journal.count("r:commit"), 1);
}

#[test]
fn rollback_after_branch_committed_is_heuristic_commit() {
    let journal = Journal::new();
    let root = new_root(Duration::from_secs(5));
    let branch = Transaction::branch(&root).unwrap();
    branch
        .enlist_resource(TestResource::new("r", &journal))
        .unwrap();

    branch.commit().unwrap();
    assert_eq!(branch.status(), TransactionStatus::Committed);

    let error = root.rollback().unwrap_err();
    assert_eq!(*error.kind(), ErrorKind::HeuristicCommit);
    assert_eq!(root.status(), TransactionStatus::RolledBack);
}

#[test]
fn disagreeing_branches_surface_heuristic_mixed_on_commit() {
    let journal = Journal::new();
    let root = new_root(Duration::from_secs(5));
    let committed = Transaction::branch(&root).unwrap();
    let doomed = Transaction::branch(&root).unwrap();
    doomed
        .enlist_resource(TestResource::new("r", &journal))
        .unwrap();

    committed.commit().unwrap();
    doomed.set_rollback_only().unwrap();

    let error = root.commit().unwrap_err();
    assert_eq!(*error.kind(), ErrorKind::HeuristicMixed);
    assert!(error.cause().is_some_and(|cause| cause.is_rollback()));

    assert_eq!(root.status(), TransactionStatus::RolledBack);
    assert_eq!(doomed.status(), TransactionStatus::RolledBack);
    assert_eq!(journal.count("r:rollback"), 1);
}

#[test]
fn all_branches_rolled_back_surfaces_heuristic_rollback() {
    let root = new_root(Duration::from_secs(5));
    let branch = Transaction::branch(&root).unwrap();
    branch.set_rollback_only().unwrap();

    let error = root.commit().unwrap_err();
    assert_eq!(*error.kind(), ErrorKind::HeuristicRollback);
    assert_eq!(root.status(), TransactionStatus::RolledBack);
    assert_eq!(branch.status(), TransactionStatus::RolledBack);
}

#[test]
fn nested_branch_subtree_is_walked_iteratively() {
    // A deep chain exercises the explicit stack walk.
    let root = new_root(Duration::from_secs(10));
    let mut leaves = vec![root.clone()];
    for _ in 0..64 {
        let next = Transaction::branch(leaves.last().unwrap()).unwrap();
        leaves.push(next);
    }

    for transaction in leaves.iter().skip(1) {
        transaction.suspend().unwrap();
    }

    root.commit().unwrap();
    assert_eq!(root.status(), TransactionStatus::Committed);
    for transaction in leaves.iter().skip(1) {
        assert_eq!(transaction.status(), TransactionStatus::Committed);
    }
}
