//! Transaction manager facade and lifecycle feed.

mod support;

use std::sync::Arc;
use std::time::Duration;
use support::{Journal, TestResource};
use veto_common::TransactionStatus;
use veto_coordinator::{CoordinatorConfig, TransactionEvent, TransactionManager};

fn new_manager() -> TransactionManager {
    TransactionManager::with_config(
        CoordinatorConfig::new()
            .default_timeout(Duration::from_secs(10))
            .scheduler_workers(2),
    )
}

#[test]
fn begin_binds_and_commit_unbinds_the_current_transaction() {
    let manager = new_manager();
    assert_eq!(manager.status(), TransactionStatus::NoTransaction);
    assert!(manager.current().is_none());

    let transaction = manager.begin().unwrap();
    assert_eq!(manager.status(), TransactionStatus::Active);
    assert_eq!(manager.transaction_key(), Some(transaction.xid()));

    manager.commit().unwrap();
    assert_eq!(manager.status(), TransactionStatus::NoTransaction);
    assert_eq!(transaction.status(), TransactionStatus::Committed);
}

#[test]
fn nested_begin_creates_a_branch_of_the_current_transaction() {
    let manager = new_manager();
    let root = manager.begin().unwrap();
    let branch = manager.begin().unwrap();

    assert!(root.xid().same_global(&branch.xid()));
    assert_ne!(root.xid(), branch.xid());
    assert_eq!(manager.transaction_key(), Some(branch.xid()));

    // Completing the branch re-exposes the root.
    manager.commit().unwrap();
    assert_eq!(manager.transaction_key(), Some(root.xid()));
    manager.commit().unwrap();
    assert_eq!(manager.status(), TransactionStatus::NoTransaction);
}

#[test]
fn rollback_pops_and_rolls_back() {
    let journal = Journal::new();
    let manager = new_manager();
    let transaction = manager.begin().unwrap();
    transaction
        .enlist_resource(TestResource::new("r1", &journal))
        .unwrap();

    manager.rollback().unwrap();
    assert_eq!(transaction.status(), TransactionStatus::RolledBack);
    assert_eq!(journal.count("r1:rollback"), 1);
    assert!(manager.current().is_none());
}

#[test]
fn operations_without_a_transaction_are_rejected() {
    let manager = new_manager();
    assert!(manager.set_rollback_only().is_err());
    assert!(manager.commit().is_err());
    assert!(manager.rollback().is_err());
    assert!(manager.suspend().is_err());
    assert!(manager.get_resource("key").is_err());
}

#[test]
fn set_rollback_only_dooms_the_current_transaction() {
    let manager = new_manager();
    let transaction = manager.begin().unwrap();

    manager.set_rollback_only().unwrap();
    assert!(manager.is_rollback_only().unwrap());

    let error = manager.commit().unwrap_err();
    assert!(error.is_rollback());
    assert_eq!(transaction.status(), TransactionStatus::RolledBack);
}

#[test]
fn resume_rejects_a_foreign_unit_of_work() {
    let manager_a = new_manager();
    let manager_b = new_manager();

    manager_b.begin().unwrap();
    let foreign = manager_b.suspend().unwrap();

    manager_a.begin().unwrap();
    let error = manager_a.resume(&foreign).unwrap_err();
    assert!(error.is_invalid_state());
}

#[test]
fn attributes_are_reachable_through_the_manager() {
    let manager = new_manager();
    manager.begin().unwrap();

    manager
        .put_resource("user", Some(Arc::new("alice".to_string())))
        .unwrap();
    let value = manager.get_resource("user").unwrap().unwrap();
    assert_eq!(value.downcast_ref::<String>().map(String::as_str), Some("alice"));

    manager.commit().unwrap();
}

#[test]
fn subscribe_observes_the_full_lifecycle() {
    let manager = new_manager();
    let events = manager.subscribe();

    let transaction = manager.begin().unwrap();
    let xid = transaction.xid();
    manager.commit().unwrap();

    let statuses: Vec<TransactionStatus> = events
        .try_iter()
        .filter(|event| event.xid == xid)
        .map(|event| event.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            TransactionStatus::Active,
            TransactionStatus::Preparing,
            TransactionStatus::Prepared,
            TransactionStatus::Committing,
            TransactionStatus::Committed,
        ]
    );
}

#[test]
fn listeners_are_invoked_on_every_event() {
    let manager = new_manager();
    let seen: Arc<parking_lot::Mutex<Vec<TransactionEvent>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        manager.listen(move |event| seen.lock().push(event.clone()));
    }

    manager.begin().unwrap();
    manager.rollback().unwrap();

    let seen = seen.lock();
    assert!(seen
        .iter()
        .any(|event| event.status == TransactionStatus::Active));
    assert!(seen
        .iter()
        .any(|event| event.status == TransactionStatus::RolledBack));
}

#[test]
fn live_set_drops_completed_transactions() {
    let manager = new_manager();
    assert!(manager.live().is_empty());

    let transaction = manager.begin().unwrap();
    let live = manager.live();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].xid(), transaction.xid());

    manager.commit().unwrap();
    assert!(manager.live().is_empty());
}

#[test]
fn clear_thread_state_unbinds_everything() {
    let manager = new_manager();
    let transaction = manager.begin().unwrap();

    manager.clear_thread_state();
    assert!(manager.current().is_none());

    // The transaction itself is untouched; only the binding is gone.
    assert_eq!(transaction.status(), TransactionStatus::Active);
    transaction.rollback().unwrap();
}

#[test]
fn timeout_reconfiguration_applies_to_new_roots() {
    let manager = new_manager();
    manager.set_transaction_timeout(Duration::from_secs(30));

    let transaction = manager.begin().unwrap();
    let remaining = transaction
        .expires()
        .saturating_duration_since(std::time::Instant::now());
    assert!(remaining <= Duration::from_secs(30));
    assert!(remaining > Duration::from_secs(25));
    manager.rollback().unwrap();
}
