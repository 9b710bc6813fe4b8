//! Transaction engine: per-unit-of-work state machine and two-phase
//! commit.
//!
//! A [`Transaction`] owns one unit of work: resource enlistment,
//! synchronization registration, suspend/resume, branch spawning and
//! joining, and the commit/rollback protocol. All mutable state lives
//! behind one exclusive lock per transaction; every blocking wait is
//! bounded by the transaction's deadline and re-checks it on wake, so the
//! deadline always wins the race against a slow participant.
//!
//! Commit failure and rollback share one drain ([`Continuation`]): a
//! commit that fails part-way hands its partially-drained queues to the
//! rollback path, so nothing prepared is silently dropped.

use crate::error::{suppress, Result, TransactionError};
use crate::feed::{TransactionEvent, TransactionFeed};
use crate::scheduler::{RollbackScheduler, RollbackTicket};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use veto_common::{
    CommitOutcome, EndFlag, PrepareVote, ResourceManager, StartFlag, Synchronization,
    TransactionStatus, Xid,
};

/// Enlisted resource timeouts are whole seconds, so a transaction counts
/// as expired once less than one full second remains.
const MIN_REMAINING: Duration = Duration::from_secs(1);

/// A resource detached from active use, re-attachable later under the
/// original identifier (`Resume`) or a joining one (`Join`).
struct SuspendedResource {
    xid: Xid,
    flag: StartFlag,
    resource: Arc<dyn ResourceManager>,
}

/// Scratch queues shared by the "finish committing, but something
/// failed" path and the "roll back from scratch" path.
#[derive(Default)]
struct Continuation {
    synchronizations: Vec<Arc<dyn Synchronization>>,
    interposed: Vec<Arc<dyn Synchronization>>,
    delisted: VecDeque<Arc<dyn ResourceManager>>,
    prepared: VecDeque<Arc<dyn ResourceManager>>,
}

struct TxState {
    status: TransactionStatus,
    rollback_only: Option<TransactionError>,
    resources: VecDeque<Arc<dyn ResourceManager>>,
    suspended: VecDeque<SuspendedResource>,
    synchronizations: Vec<Arc<dyn Synchronization>>,
    interposed: Vec<Arc<dyn Synchronization>>,
    branches: Vec<Transaction>,
    attributes: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl TxState {
    fn new() -> Self {
        Self {
            status: TransactionStatus::Active,
            rollback_only: None,
            resources: VecDeque::new(),
            suspended: VecDeque::new(),
            synchronizations: Vec::new(),
            interposed: Vec::new(),
            branches: Vec::new(),
            attributes: HashMap::new(),
        }
    }
}

pub(crate) struct TxInner {
    xid: Xid,
    expires: Instant,
    ticket: RollbackTicket,
    scheduler: Arc<RollbackScheduler>,
    feed: Arc<TransactionFeed>,
    state: Mutex<TxState>,
    completion: Condvar,
}

/// One atomic unit of work.
///
/// Cheaply cloneable handle; all clones refer to the same transaction.
/// The handle may be passed between threads; `suspend`/`resume` is the
/// sanctioned hand-off protocol.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl Transaction {
    /// Creates a new root transaction.
    ///
    /// Unless completed beforehand, the transaction automatically rolls
    /// back when `timeout` expires. Timeouts below one second are
    /// rejected.
    pub fn root(
        timeout: Duration,
        scheduler: Arc<RollbackScheduler>,
        feed: Arc<TransactionFeed>,
    ) -> Result<Self> {
        if timeout < MIN_REMAINING {
            return Err(TransactionError::invalid_state(
                "transaction timeout must be at least one second",
            ));
        }
        let transaction = Self::create(Xid::new_root(), Instant::now() + timeout, scheduler, feed);
        debug!("{} begin", transaction.inner.xid);
        Ok(transaction)
    }

    /// Creates a new branch of `parent`.
    ///
    /// The branch shares the parent's global id and deadline. Rejected
    /// when under one second remains on the parent's deadline.
    pub fn branch(parent: &Transaction) -> Result<Self> {
        if parent.remaining() < MIN_REMAINING {
            return Err(TransactionError::invalid_state(format!(
                "{} expired",
                parent.inner.xid
            )));
        }
        let transaction = Self::create(
            Xid::new_branch(&parent.inner.xid),
            parent.inner.expires,
            parent.inner.scheduler.clone(),
            parent.inner.feed.clone(),
        );
        parent
            .inner
            .state
            .lock()
            .branches
            .push(transaction.clone());
        debug!("{} branch {}", transaction.inner.xid, parent.inner.xid);
        Ok(transaction)
    }

    fn create(
        xid: Xid,
        expires: Instant,
        scheduler: Arc<RollbackScheduler>,
        feed: Arc<TransactionFeed>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak| TxInner {
            xid,
            expires,
            ticket: scheduler.schedule(weak.clone(), expires),
            scheduler: scheduler.clone(),
            feed: feed.clone(),
            state: Mutex::new(TxState::new()),
            completion: Condvar::new(),
        });
        feed.register(&inner);
        feed.emit(TransactionEvent {
            xid,
            status: TransactionStatus::Active,
        });
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<TxInner>) -> Self {
        Self { inner }
    }

    /// Identifier binding this transaction to its root.
    pub fn xid(&self) -> Xid {
        self.inner.xid
    }

    /// Absolute deadline shared by every branch of the root.
    pub fn expires(&self) -> Instant {
        self.inner.expires
    }

    /// Current status.
    pub fn status(&self) -> TransactionStatus {
        self.inner.state.lock().status
    }

    /// Whether the transaction has been marked rollback-only.
    pub fn is_rollback_only(&self) -> bool {
        self.inner.state.lock().rollback_only.is_some()
    }

    /// The recorded cause of a rollback-only mark, if any.
    pub fn rollback_cause(&self) -> Option<TransactionError> {
        self.inner.state.lock().rollback_only.clone()
    }

    /// Reads a transaction-scoped attribute. Valid only while `Active`.
    pub fn get_resource(&self, key: &str) -> Result<Option<Arc<dyn Any + Send + Sync>>> {
        let state = self.inner.state.lock();
        assert_status(state.status, &[TransactionStatus::Active])?;
        Ok(state.attributes.get(key).cloned())
    }

    /// Stores a transaction-scoped attribute. Valid only while `Active`;
    /// `None` removes the entry.
    pub fn put_resource(
        &self,
        key: impl Into<String>,
        value: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        assert_status(state.status, &[TransactionStatus::Active])?;
        match value {
            Some(value) => {
                state.attributes.insert(key.into(), value);
            }
            None => {
                state.attributes.remove(&key.into());
            }
        }
        Ok(())
    }

    /// Registers a completion observer.
    ///
    /// Rejected once the transaction is marked for rollback or past its
    /// deadline.
    pub fn register_synchronization(&self, synchronization: Arc<dyn Synchronization>) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.check_expired()?;
        check_for_rollback(&state)?;
        assert_status(
            state.status,
            &[TransactionStatus::Active, TransactionStatus::Unknown],
        )?;
        state.synchronizations.push(synchronization);
        Ok(())
    }

    /// Registers an interposed completion observer, which fires after
    /// ordinary synchronizations at each completion boundary.
    pub fn register_interposed_synchronization(
        &self,
        synchronization: Arc<dyn Synchronization>,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.check_expired()?;
        check_for_rollback(&state)?;
        assert_status(
            state.status,
            &[TransactionStatus::Active, TransactionStatus::Unknown],
        )?;
        state.interposed.push(synchronization);
        Ok(())
    }

    /// Enlists a resource manager as a participant.
    ///
    /// Returns `Ok(false)` without side effect when an equivalent manager
    /// is already enlisted. The remaining time to the deadline is
    /// propagated to the resource as its operation timeout.
    pub fn enlist_resource(&self, resource: Arc<dyn ResourceManager>) -> Result<bool> {
        let mut state = self.inner.state.lock();
        self.check_expired()?;
        check_for_rollback(&state)?;
        assert_status(
            state.status,
            &[TransactionStatus::Active, TransactionStatus::Unknown],
        )?;

        for enlisted in &state.resources {
            if enlisted.is_same_rm(resource.as_ref()) {
                return Ok(false);
            }
        }

        self.do_enlist(&mut state, resource)?;
        Ok(true)
    }

    /// Delists a resource, ending it with the caller-supplied flag.
    ///
    /// Suspended resources are searched first. Returns `Ok(false)` when
    /// the resource was never enlisted.
    pub fn delist_resource(&self, resource: &dyn ResourceManager, flag: EndFlag) -> Result<bool> {
        let mut state = self.inner.state.lock();
        self.check_expired()?;
        assert_status(
            state.status,
            &[
                TransactionStatus::Active,
                TransactionStatus::Unknown,
                TransactionStatus::MarkedRollback,
            ],
        )?;

        if let Some(index) = state.suspended.iter().position(|suspended| {
            suspended.flag == StartFlag::Resume && suspended.resource.is_same_rm(resource)
        }) {
            let suspended = state.suspended.remove(index).expect("indexed entry");
            resource.end(&suspended.xid, flag)?;
            trace!("{}: delist suspended resource", self.inner.xid);
            return Ok(true);
        }

        if let Some(index) = state
            .resources
            .iter()
            .position(|enlisted| enlisted.is_same_rm(resource))
        {
            let enlisted = state.resources.remove(index).expect("indexed entry");
            enlisted.end(&self.inner.xid, flag)?;
            trace!("{}: delist resource", self.inner.xid);
            return Ok(true);
        }

        Ok(false)
    }

    /// Joins a branch back into this transaction.
    ///
    /// Both transactions must share a global id and be active or
    /// suspended. The branch's resources and synchronizations move to
    /// this transaction; the branch is destroyed (`NoTransaction`).
    pub fn join(&self, branch: &Transaction) -> Result<()> {
        if !self.inner.xid.same_global(&branch.inner.xid) {
            return Err(TransactionError::invalid_state(
                "cannot join a branch of a different global transaction",
            ));
        }

        let mut state = self.inner.state.lock();
        assert_status(
            state.status,
            &[TransactionStatus::Active, TransactionStatus::Unknown],
        )?;
        {
            let mut branch_state = branch.inner.state.lock();
            assert_status(
                branch_state.status,
                &[TransactionStatus::Active, TransactionStatus::Unknown],
            )?;

            while let Some(suspended) = branch_state.suspended.pop_front() {
                if suspended.flag == StartFlag::Resume {
                    suspended.resource.end(&suspended.xid, EndFlag::Success)?;
                }
                state.suspended.push_back(SuspendedResource {
                    xid: suspended.xid,
                    flag: StartFlag::Join,
                    resource: suspended.resource,
                });
            }

            while let Some(resource) = branch_state.resources.pop_front() {
                resource.end(&branch.inner.xid, EndFlag::Success)?;
                state.suspended.push_back(SuspendedResource {
                    xid: branch.inner.xid,
                    flag: StartFlag::Join,
                    resource,
                });
            }

            branch.inner.ticket.cancel();
            branch.update_status(&mut branch_state, TransactionStatus::NoTransaction);

            while let Some(synchronization) = branch_state.synchronizations.pop() {
                synchronization.after_completion(TransactionStatus::NoTransaction);
                state.synchronizations.push(synchronization);
            }
            while let Some(synchronization) = branch_state.interposed.pop() {
                synchronization.after_completion(TransactionStatus::NoTransaction);
                state.interposed.push(synchronization);
            }

            branch.inner.completion.notify_all();
        }

        if state.status == TransactionStatus::Active {
            self.enlist_suspended(&mut state)?;
        }

        drop(state);
        self.inner.completion.notify_all();
        Ok(())
    }

    /// Suspends this transaction so it can be handed to another thread.
    ///
    /// Every active resource is ended with a suspend flag and parked for
    /// resume. While suspended (`Unknown`), no thread holds an implicit
    /// claim on the transaction's resources.
    pub fn suspend(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        assert_status(state.status, &[TransactionStatus::Active])?;

        while let Some(resource) = state.resources.pop_front() {
            resource.end(&self.inner.xid, EndFlag::Suspend)?;
            state.suspended.push_back(SuspendedResource {
                xid: self.inner.xid,
                flag: StartFlag::Resume,
                resource,
            });
            trace!("{}: suspend resource", self.inner.xid);
        }

        self.update_status(&mut state, TransactionStatus::Unknown);
        debug!("{} suspend", self.inner.xid);
        drop(state);
        // Unknown is an idle status; wake any parent blocked on it.
        self.inner.completion.notify_all();
        Ok(())
    }

    /// Resumes a suspended transaction on the calling thread.
    pub fn resume(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        assert_status(state.status, &[TransactionStatus::Unknown])?;

        self.enlist_suspended(&mut state)?;

        self.update_status(&mut state, TransactionStatus::Active);
        debug!("{} resume", self.inner.xid);
        drop(state);
        self.inner.completion.notify_all();
        Ok(())
    }

    /// Marks the transaction so the only possible outcome is rollback.
    ///
    /// Valid from `Active` through any in-flight completion phase;
    /// idempotent; prior causes are chained.
    pub fn set_rollback_only(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        assert_status(
            state.status,
            &[
                TransactionStatus::Active,
                TransactionStatus::MarkedRollback,
                TransactionStatus::Preparing,
                TransactionStatus::Prepared,
                TransactionStatus::Committing,
                TransactionStatus::RollingBack,
            ],
        )?;

        let mut rollback = TransactionError::rollback("marked rollback-only");
        if let Some(prior) = state.rollback_only.take() {
            rollback = rollback.with_cause(prior);
        }
        state.rollback_only = Some(rollback);

        if !self.update_status(&mut state, TransactionStatus::MarkedRollback) {
            return Ok(());
        }

        debug!("{} rollback-only", self.inner.xid);
        drop(state);
        self.inner.completion.notify_all();
        Ok(())
    }

    /// Commits the unit of work.
    ///
    /// The full branch subtree is collected with an explicit stack walk,
    /// each branch is waited on (bounded by the shared deadline) and then
    /// committed or, after the first failure, forced through rollback.
    /// Branch outcome disagreement surfaces as a heuristic error layered
    /// over the first underlying failure. The transaction itself then
    /// runs the inner two-phase procedure, or rolls back if anything
    /// already failed.
    pub fn commit(&self) -> Result<()> {
        self.check_expired()?;

        let mut to_commit: Vec<Transaction> = Vec::new();
        let mut to_check: Vec<Transaction> = self.inner.state.lock().branches.clone();
        while let Some(transaction) = to_check.pop() {
            to_check.extend(transaction.inner.state.lock().branches.iter().cloned());
            to_commit.push(transaction);
        }

        let mut error: Option<TransactionError> = None;
        let mut branch_committed = false;
        let mut branch_rolledback = false;

        while let Some(transaction) = to_commit.pop() {
            if error.is_none() && !transaction.is_rollback_only() {
                // The deadline always wins the race against a slow branch.
                error = suppress(
                    error,
                    transaction
                        .wait_for_idle(self.inner.expires)
                        .and_then(|()| self.check_expired()),
                );
            }

            match transaction.status() {
                TransactionStatus::Committed => branch_committed = true,
                TransactionStatus::RolledBack => branch_rolledback = true,
                TransactionStatus::NoTransaction => {}
                _ => {
                    if error.is_none() {
                        error = suppress(error, transaction.do_commit());
                        if error.is_some() {
                            branch_rolledback = true;
                        } else {
                            branch_committed = true;
                        }
                    } else {
                        error = suppress(error, transaction.continue_rollback());
                        branch_rolledback = true;
                    }
                }
            }
        }

        if branch_rolledback {
            let heuristic = if branch_committed {
                TransactionError::heuristic_mixed()
            } else {
                TransactionError::heuristic_rollback()
            };
            error = Some(match error {
                None => heuristic,
                Some(underlying) => heuristic.with_cause(underlying),
            });
        }

        let error = if error.is_none() {
            suppress(None, self.do_commit())
        } else {
            suppress(error, self.continue_rollback())
        };

        match error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Rolls back the unit of work, branches first.
    ///
    /// Every branch gets a rollback attempt regardless of earlier
    /// failures; a branch that already committed surfaces as a heuristic
    /// error.
    pub fn rollback(&self) -> Result<()> {
        let mut to_rollback: Vec<Transaction> = Vec::new();
        let mut to_check: Vec<Transaction> = self.inner.state.lock().branches.clone();
        while let Some(transaction) = to_check.pop() {
            to_check.extend(transaction.inner.state.lock().branches.iter().cloned());
            to_rollback.push(transaction);
        }

        let mut error: Option<TransactionError> = None;
        let mut branch_committed = false;
        let mut branch_rolledback = false;

        while let Some(transaction) = to_rollback.pop() {
            match transaction.status() {
                TransactionStatus::Committed => branch_committed = true,
                TransactionStatus::RolledBack => branch_rolledback = true,
                TransactionStatus::NoTransaction => {}
                _ => {
                    error = suppress(error, transaction.continue_rollback());
                    branch_rolledback = true;
                }
            }
        }

        if branch_committed {
            let heuristic = if branch_rolledback {
                TransactionError::heuristic_mixed()
            } else {
                TransactionError::heuristic_commit()
            };
            error = Some(match error {
                None => heuristic,
                Some(underlying) => heuristic.with_cause(underlying),
            });
        }

        let error = suppress(error, self.continue_rollback());

        match error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    fn remaining(&self) -> Duration {
        self.inner.expires.saturating_duration_since(Instant::now())
    }

    fn check_expired(&self) -> Result<()> {
        if self.remaining() < MIN_REMAINING {
            return Err(TransactionError::invalid_state(format!(
                "{} expired",
                self.inner.xid
            )));
        }
        Ok(())
    }

    fn update_status(&self, state: &mut TxState, status: TransactionStatus) -> bool {
        if state.status == status {
            return false;
        }
        state.status = status;
        trace!("{}: {}", self.inner.xid, status);
        self.inner.feed.emit(TransactionEvent {
            xid: self.inner.xid,
            status,
        });
        true
    }

    /// Blocks until the transaction reaches an idle status or `deadline`
    /// passes.
    fn wait_for_idle(&self, deadline: Instant) -> Result<()> {
        let mut state = self.inner.state.lock();
        while !state.status.is_idle() {
            if self
                .inner
                .completion
                .wait_until(&mut state, deadline)
                .timed_out()
                && !state.status.is_idle()
            {
                return Err(TransactionError::invalid_state(format!(
                    "{} timed out waiting for idle",
                    self.inner.xid
                )));
            }
        }
        Ok(())
    }

    fn do_enlist(&self, state: &mut TxState, resource: Arc<dyn ResourceManager>) -> Result<()> {
        if let Err(error) = resource.set_timeout(self.remaining()) {
            warn!("{} set_timeout failure: {error}", self.inner.xid);
        }

        resource.start(&self.inner.xid, StartFlag::NoFlags)?;
        if state.status == TransactionStatus::Active {
            state.resources.push_back(resource);
            trace!("{}: enlist resource", self.inner.xid);
        } else {
            resource.end(&self.inner.xid, EndFlag::Suspend)?;
            state.suspended.push_back(SuspendedResource {
                xid: self.inner.xid,
                flag: StartFlag::Resume,
                resource,
            });
            trace!("{}: enlist suspended resource", self.inner.xid);
        }
        Ok(())
    }

    /// Re-attaches every parked resource: resume-flagged entries restart
    /// under this transaction's id, join-flagged entries fold their
    /// branch id into an equivalent enlisted manager.
    fn enlist_suspended(&self, state: &mut TxState) -> Result<()> {
        let mut to_join = Vec::new();
        while let Some(suspended) = state.suspended.pop_front() {
            match suspended.flag {
                StartFlag::Join => to_join.push(suspended),
                _ => {
                    suspended
                        .resource
                        .start(&self.inner.xid, StartFlag::Resume)?;
                    state.resources.push_back(suspended.resource);
                }
            }
        }

        for suspended in to_join {
            self.enlist_and_join(state, suspended.resource, suspended.xid)?;
        }
        Ok(())
    }

    fn enlist_and_join(
        &self,
        state: &mut TxState,
        resource: Arc<dyn ResourceManager>,
        branch_xid: Xid,
    ) -> Result<()> {
        let same_rm = state
            .resources
            .iter()
            .find(|enlisted| enlisted.is_same_rm(resource.as_ref()))
            .cloned();

        let same_rm = match same_rm {
            Some(enlisted) => enlisted,
            None => {
                resource.set_timeout(self.remaining())?;
                resource.start(&self.inner.xid, StartFlag::NoFlags)?;
                state.resources.push_back(resource.clone());
                resource
            }
        };

        same_rm.start(&branch_xid, StartFlag::Join)?;
        Ok(())
    }

    /// Inner two-phase commit over this transaction alone.
    pub(crate) fn do_commit(&self) -> Result<()> {
        let mut guard = self.inner.state.lock();
        let result = self.do_commit_locked(&mut guard);
        drop(guard);
        self.inner.completion.notify_all();
        result
    }

    fn do_commit_locked(&self, guard: &mut MutexGuard<'_, TxState>) -> Result<()> {
        self.inner.ticket.cancel();

        if guard.status == TransactionStatus::MarkedRollback {
            let mut rollback = create_rollback(guard);
            let mut continuation = Continuation::default();
            if let Err(error) = self.continue_rollback_locked(guard, &mut continuation) {
                rollback.push_suppressed(error);
            }
            if let Err(error) = assert_status(guard.status, &[TransactionStatus::RolledBack]) {
                rollback.push_suppressed(error);
            }
            return Err(rollback);
        }

        self.check_expired()?;
        check_for_rollback(guard)?;
        assert_status(
            guard.status,
            &[TransactionStatus::Active, TransactionStatus::Unknown],
        )?;

        trace!("{}: commit begin", self.inner.xid);
        let mut continuation = Continuation::default();
        if let Err(error) = self.commit_phases(guard, &mut continuation) {
            let mut rollback =
                TransactionError::rollback(guard.status.to_string()).with_cause(error);
            if let Err(error) = self.continue_rollback_locked(guard, &mut continuation) {
                rollback.push_suppressed(error);
            }
            if let Err(error) = assert_status(guard.status, &[TransactionStatus::RolledBack]) {
                rollback.push_suppressed(error);
            }
            return Err(rollback);
        }

        // Symmetric with before-completion: interposed first, then
        // ordinary, each stack most-recently-registered first.
        for synchronization in continuation.interposed.drain(..) {
            synchronization.after_completion(TransactionStatus::Committed);
        }
        for synchronization in continuation.synchronizations.drain(..) {
            synchronization.after_completion(TransactionStatus::Committed);
        }

        debug!("{} commit", self.inner.xid);
        Ok(())
    }

    fn commit_phases(
        &self,
        guard: &mut MutexGuard<'_, TxState>,
        continuation: &mut Continuation,
    ) -> Result<()> {
        let xid = self.inner.xid;

        trace!("{xid}: before-completion");
        while let Some(synchronization) = guard.synchronizations.pop() {
            continuation.synchronizations.push(synchronization.clone());
            synchronization.before_completion()?;
        }

        trace!("{xid}: before-completion interposed");
        while let Some(synchronization) = guard.interposed.pop() {
            continuation.interposed.push(synchronization.clone());
            synchronization.before_completion()?;
        }

        trace!("{xid}: delist suspended resources");
        while let Some(suspended) = guard.suspended.pop_front() {
            match suspended.flag {
                StartFlag::Resume => {
                    suspended.resource.end(&suspended.xid, EndFlag::Success)?;
                    continuation.delisted.push_back(suspended.resource);
                }
                _ => self.enlist_and_join(guard, suspended.resource, suspended.xid)?,
            }
        }

        trace!("{xid}: delist resources");
        while let Some(resource) = guard.resources.pop_front() {
            continuation.delisted.push_back(resource.clone());
            resource.end(&xid, EndFlag::Success)?;
        }

        trace!("{xid}: commit phase 1");
        self.update_status(guard, TransactionStatus::Preparing);
        while let Some(resource) = continuation.delisted.pop_front() {
            let vote = resource.prepare(&xid)?;
            trace!("{xid}: prepare vote {vote:?}");
            if vote == PrepareVote::Ok {
                continuation.prepared.push_back(resource);
            }
        }
        self.update_status(guard, TransactionStatus::Prepared);

        trace!("{xid}: commit phase 2");
        self.update_status(guard, TransactionStatus::Committing);
        while let Some(resource) = continuation.prepared.pop_front() {
            self.commit_resource(guard, &resource)?;
        }
        self.update_status(guard, TransactionStatus::Committed);
        Ok(())
    }

    /// Phase-2 commit of one resource, retrying transient failures until
    /// the deadline.
    fn commit_resource(
        &self,
        guard: &mut MutexGuard<'_, TxState>,
        resource: &Arc<dyn ResourceManager>,
    ) -> Result<()> {
        let xid = self.inner.xid;
        while Instant::now() < self.inner.expires {
            let outcome = resource.commit(&xid, false)?;
            trace!("{xid}: commit outcome {outcome}");
            match outcome {
                CommitOutcome::Ok => return Ok(()),
                CommitOutcome::Retry => {
                    let pause = self.remaining() / 2 + Duration::from_millis(1);
                    let _ = self.inner.completion.wait_for(guard, pause);
                }
                CommitOutcome::HeuristicCommit => {
                    // Consistent with the decision once the resource
                    // forgets the branch.
                    resource.forget(&xid)?;
                    return Ok(());
                }
                outcome => {
                    let mut error =
                        TransactionError::resource(format!("commit returned {outcome}"));
                    if let Err(forget_error) = resource.forget(&xid) {
                        error.push_suppressed(forget_error.into());
                    }
                    return Err(error);
                }
            }
        }
        warn!("{xid}: deadline exhausted retrying commit");
        Ok(())
    }

    /// Rolls this transaction back through a fresh continuation.
    pub(crate) fn continue_rollback(&self) -> Result<()> {
        let mut guard = self.inner.state.lock();
        let mut continuation = Continuation::default();
        let result = self.continue_rollback_locked(&mut guard, &mut continuation);
        drop(guard);
        self.inner.completion.notify_all();
        result
    }

    /// Deadline-triggered rollback, invoked from the scheduler workers.
    pub(crate) fn timed_rollback(&self) {
        let mut guard = self.inner.state.lock();
        if guard.status.is_terminal() {
            // Completion won the race; disarming was best-effort.
            return;
        }
        let mut continuation = Continuation::default();
        if let Err(error) = self.continue_rollback_locked(&mut guard, &mut continuation) {
            warn!("{} timed rollback failure: {error}", self.inner.xid);
        }
        drop(guard);
        self.inner.completion.notify_all();
    }

    /// Drains every participant into `continuation` and rolls back.
    ///
    /// Failures are collected, not short-circuited: every resource gets a
    /// rollback attempt and every synchronization its completion call
    /// before the first failure is re-raised.
    fn continue_rollback_locked(
        &self,
        state: &mut TxState,
        continuation: &mut Continuation,
    ) -> Result<()> {
        self.inner.ticket.cancel();
        let xid = self.inner.xid;

        let mut error = suppress(
            None,
            assert_status(
                state.status,
                &[
                    TransactionStatus::Active,
                    TransactionStatus::Unknown,
                    TransactionStatus::Preparing,
                    TransactionStatus::Prepared,
                    TransactionStatus::MarkedRollback,
                    TransactionStatus::Committing,
                    TransactionStatus::RollingBack,
                ],
            ),
        );

        self.update_status(state, TransactionStatus::MarkedRollback);

        while let Some(synchronization) = state.synchronizations.pop() {
            continuation.synchronizations.push(synchronization);
        }
        while let Some(synchronization) = state.interposed.pop() {
            continuation.interposed.push(synchronization);
        }

        trace!("{xid}: delist suspended resources for rollback");
        while let Some(suspended) = state.suspended.pop_front() {
            match suspended.flag {
                StartFlag::Resume => {
                    error = suppress(
                        error,
                        suspended
                            .resource
                            .end(&suspended.xid, EndFlag::Fail)
                            .map_err(Into::into),
                    );
                    continuation.delisted.push_back(suspended.resource);
                }
                _ => {
                    error = suppress(
                        error,
                        self.enlist_and_join(state, suspended.resource, suspended.xid),
                    );
                }
            }
        }

        trace!("{xid}: delist resources for rollback");
        while let Some(resource) = state.resources.pop_front() {
            error = suppress(
                error,
                resource.end(&xid, EndFlag::Fail).map_err(Into::into),
            );
            continuation.delisted.push_back(resource);
        }

        // Everything delisted joins whatever was already prepared so a
        // failed commit and a rollback from scratch drain identically.
        let delisted: Vec<_> = continuation.delisted.drain(..).collect();
        continuation.prepared.extend(delisted);

        self.update_status(state, TransactionStatus::RollingBack);
        while let Some(resource) = continuation.prepared.pop_front() {
            error = suppress(error, resource.rollback(&xid).map_err(Into::into));
            trace!("{xid}: rollback resource");
        }
        self.update_status(state, TransactionStatus::RolledBack);

        for synchronization in continuation.interposed.drain(..) {
            synchronization.after_completion(TransactionStatus::RolledBack);
        }
        for synchronization in continuation.synchronizations.drain(..) {
            synchronization.after_completion(TransactionStatus::RolledBack);
        }

        debug!("{xid} rollback");
        match error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("xid", &self.inner.xid)
            .finish_non_exhaustive()
    }
}

fn assert_status(actual: TransactionStatus, expected: &[TransactionStatus]) -> Result<()> {
    if expected.contains(&actual) {
        return Ok(());
    }
    let mut message = format!("status is {actual}, expected one of");
    for status in expected {
        let _ = write!(message, " {status}");
    }
    Err(TransactionError::invalid_state(message))
}

fn create_rollback(state: &TxState) -> TransactionError {
    let error = TransactionError::rollback(state.status.to_string());
    match &state.rollback_only {
        Some(cause) => error.with_cause(cause.clone()),
        None => error,
    }
}

fn check_for_rollback(state: &TxState) -> Result<()> {
    if matches!(
        state.status,
        TransactionStatus::MarkedRollback | TransactionStatus::RolledBack
    ) {
        return Err(create_rollback(state));
    }
    Ok(())
}
