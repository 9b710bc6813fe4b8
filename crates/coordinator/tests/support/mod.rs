//! Scripted participants for coordinator integration tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use veto_common::{
    CommitOutcome, EndFlag, PrepareVote, ResourceError, ResourceManager, StartFlag,
    Synchronization, SynchronizationError, TransactionStatus, Xid,
};

/// Ordered journal of protocol calls, shared across participants.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|recorded| recorded.as_str() == entry)
            .count()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0
            .lock()
            .iter()
            .position(|recorded| recorded.as_str() == entry)
    }
}

static NEXT_RM_ID: AtomicU32 = AtomicU32::new(0);

/// In-memory resource manager with scriptable votes and outcomes.
pub struct TestResource {
    name: &'static str,
    rm_id: u32,
    journal: Journal,
    prepare_vote: Mutex<Result<PrepareVote, ()>>,
    commit_script: Mutex<VecDeque<CommitOutcome>>,
}

impl TestResource {
    pub fn new(name: &'static str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            name,
            rm_id: NEXT_RM_ID.fetch_add(1, Ordering::Relaxed),
            journal: journal.clone(),
            prepare_vote: Mutex::new(Ok(PrepareVote::Ok)),
            commit_script: Mutex::new(VecDeque::new()),
        })
    }

    /// A second handle onto the same underlying manager.
    pub fn same_rm(&self, name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            rm_id: self.rm_id,
            journal: self.journal.clone(),
            prepare_vote: Mutex::new(Ok(PrepareVote::Ok)),
            commit_script: Mutex::new(VecDeque::new()),
        })
    }

    pub fn vote_read_only(&self) {
        *self.prepare_vote.lock() = Ok(PrepareVote::ReadOnly);
    }

    pub fn fail_prepare(&self) {
        *self.prepare_vote.lock() = Err(());
    }

    /// Scripts phase-2 outcomes, consumed one per commit call; once the
    /// script runs dry the resource commits normally.
    pub fn script_commit(&self, outcomes: impl IntoIterator<Item = CommitOutcome>) {
        self.commit_script.lock().extend(outcomes);
    }
}

impl ResourceManager for TestResource {
    fn start(&self, _xid: &Xid, flag: StartFlag) -> Result<(), ResourceError> {
        self.journal.record(format!("{}:start:{:?}", self.name, flag));
        Ok(())
    }

    fn end(&self, _xid: &Xid, flag: EndFlag) -> Result<(), ResourceError> {
        self.journal.record(format!("{}:end:{:?}", self.name, flag));
        Ok(())
    }

    fn prepare(&self, _xid: &Xid) -> Result<PrepareVote, ResourceError> {
        self.journal.record(format!("{}:prepare", self.name));
        let vote = *self.prepare_vote.lock();
        vote.map_err(|()| ResourceError::new("scripted prepare failure"))
    }

    fn commit(&self, _xid: &Xid, _one_phase: bool) -> Result<CommitOutcome, ResourceError> {
        self.journal.record(format!("{}:commit", self.name));
        Ok(self
            .commit_script
            .lock()
            .pop_front()
            .unwrap_or(CommitOutcome::Ok))
    }

    fn rollback(&self, _xid: &Xid) -> Result<(), ResourceError> {
        self.journal.record(format!("{}:rollback", self.name));
        Ok(())
    }

    fn forget(&self, _xid: &Xid) -> Result<(), ResourceError> {
        self.journal.record(format!("{}:forget", self.name));
        Ok(())
    }

    fn is_same_rm(&self, other: &dyn ResourceManager) -> bool {
        other
            .as_any()
            .downcast_ref::<TestResource>()
            .is_some_and(|other| other.rm_id == self.rm_id)
    }

    fn set_timeout(&self, _timeout: Duration) -> Result<(), ResourceError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Completion observer recording its callbacks into the journal.
pub struct TestSync {
    name: &'static str,
    journal: Journal,
    fail_before: bool,
}

impl TestSync {
    pub fn new(name: &'static str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            name,
            journal: journal.clone(),
            fail_before: false,
        })
    }

    pub fn failing(name: &'static str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            name,
            journal: journal.clone(),
            fail_before: true,
        })
    }
}

impl Synchronization for TestSync {
    fn before_completion(&self) -> Result<(), SynchronizationError> {
        self.journal.record(format!("{}:before", self.name));
        if self.fail_before {
            return Err(SynchronizationError::new("scripted failure"));
        }
        Ok(())
    }

    fn after_completion(&self, status: TransactionStatus) {
        self.journal.record(format!("{}:after:{status}", self.name));
    }
}
