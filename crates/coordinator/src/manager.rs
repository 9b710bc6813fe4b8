//! Transaction manager facade.
//!
//! The manager binds "the current transaction" to the calling thread:
//! each thread has its own stack of active transactions, held inside the
//! manager rather than in process-wide state so independent managers can
//! coexist. A nested `begin` creates a branch of whatever is on top of
//! the calling thread's stack; `suspend`/`resume` pop and push across
//! threads, which is how a transaction migrates between threads of
//! control.

use crate::config::CoordinatorConfig;
use crate::error::{Result, TransactionError};
use crate::feed::{TransactionEvent, TransactionFeed};
use crate::scheduler::RollbackScheduler;
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use veto_common::{Synchronization, TransactionStatus, Xid};

/// Coordinator facade tracking the active transaction per thread.
pub struct TransactionManager {
    timeout: Mutex<Duration>,
    scheduler: Arc<RollbackScheduler>,
    feed: Arc<TransactionFeed>,
    contexts: Mutex<HashMap<ThreadId, Vec<Transaction>>>,
}

impl TransactionManager {
    /// Creates a manager with the default configuration.
    pub fn new() -> Self {
        Self::with_config(CoordinatorConfig::default())
    }

    /// Creates a manager from `config`.
    pub fn with_config(config: CoordinatorConfig) -> Self {
        Self {
            timeout: Mutex::new(config.default_timeout),
            scheduler: Arc::new(RollbackScheduler::new(config.scheduler_workers)),
            feed: Arc::new(TransactionFeed::new()),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the timeout applied to subsequent root transactions.
    ///
    /// A zero duration restores the two-minute default.
    pub fn set_transaction_timeout(&self, timeout: Duration) {
        let mut current = self.timeout.lock();
        *current = if timeout.is_zero() {
            CoordinatorConfig::default().default_timeout
        } else {
            timeout
        };
    }

    /// Begins a transaction on the calling thread.
    ///
    /// The first `begin` creates a root; nested calls create a branch of
    /// the transaction currently on top of the thread's stack. Returns a
    /// handle to the new transaction, which is also tracked as current.
    pub fn begin(&self) -> Result<Transaction> {
        let mut contexts = self.contexts.lock();
        let stack = contexts.entry(thread::current().id()).or_default();

        let transaction = match stack.last() {
            None => Transaction::root(
                *self.timeout.lock(),
                self.scheduler.clone(),
                self.feed.clone(),
            )?,
            Some(parent) => Transaction::branch(parent)?,
        };

        stack.push(transaction.clone());
        Ok(transaction)
    }

    /// The transaction currently bound to the calling thread, if any.
    pub fn current(&self) -> Option<Transaction> {
        self.contexts
            .lock()
            .get(&thread::current().id())
            .and_then(|stack| stack.last().cloned())
    }

    /// Status of the current transaction, or `NoTransaction`.
    pub fn status(&self) -> TransactionStatus {
        self.current()
            .map(|transaction| transaction.status())
            .unwrap_or(TransactionStatus::NoTransaction)
    }

    /// Identifier of the current transaction, if any.
    pub fn transaction_key(&self) -> Option<Xid> {
        self.current().map(|transaction| transaction.xid())
    }

    /// Marks the current transaction rollback-only.
    pub fn set_rollback_only(&self) -> Result<()> {
        self.require_current()?.set_rollback_only()
    }

    /// Whether the current transaction is marked rollback-only.
    pub fn is_rollback_only(&self) -> Result<bool> {
        Ok(self.require_current()?.is_rollback_only())
    }

    /// Stores an attribute on the current transaction.
    pub fn put_resource(
        &self,
        key: impl Into<String>,
        value: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<()> {
        self.require_current()?.put_resource(key, value)
    }

    /// Reads an attribute from the current transaction.
    pub fn get_resource(&self, key: &str) -> Result<Option<Arc<dyn Any + Send + Sync>>> {
        self.require_current()?.get_resource(key)
    }

    /// Registers a synchronization with the current transaction.
    pub fn register_synchronization(&self, synchronization: Arc<dyn Synchronization>) -> Result<()> {
        self.require_current()?
            .register_synchronization(synchronization)
    }

    /// Registers an interposed synchronization with the current
    /// transaction.
    pub fn register_interposed_synchronization(
        &self,
        synchronization: Arc<dyn Synchronization>,
    ) -> Result<()> {
        self.require_current()?
            .register_interposed_synchronization(synchronization)
    }

    /// Suspends the current transaction and unbinds it from the thread.
    ///
    /// The returned handle can be passed to [`resume`](Self::resume) on
    /// any thread.
    pub fn suspend(&self) -> Result<Transaction> {
        let transaction = self.pop_current()?;
        transaction.suspend()?;
        Ok(transaction)
    }

    /// Resumes a suspended transaction on the calling thread.
    ///
    /// Rejected when the thread already has an active transaction of a
    /// different unit of work.
    pub fn resume(&self, transaction: &Transaction) -> Result<()> {
        let mut contexts = self.contexts.lock();
        let id = thread::current().id();
        if let Some(top) = contexts.get(&id).and_then(|stack| stack.last()) {
            if !top.xid().same_global(&transaction.xid()) {
                return Err(TransactionError::invalid_state(
                    "cannot resume a transaction of a different unit of work",
                ));
            }
        }

        transaction.resume()?;
        contexts.entry(id).or_default().push(transaction.clone());
        Ok(())
    }

    /// Commits the current transaction and unbinds it from the thread.
    pub fn commit(&self) -> Result<()> {
        self.pop_current()?.commit()
    }

    /// Rolls back the current transaction and unbinds it from the
    /// thread.
    pub fn rollback(&self) -> Result<()> {
        self.pop_current()?.rollback()
    }

    /// Subscribes to lifecycle events of every transaction this manager
    /// creates.
    pub fn subscribe(&self) -> Receiver<TransactionEvent> {
        self.feed.subscribe()
    }

    /// Registers a callback invoked on every lifecycle event.
    pub fn listen(&self, callback: impl Fn(&TransactionEvent) + Send + Sync + 'static) {
        self.feed.listen(callback)
    }

    /// In-flight transactions created by this manager.
    pub fn live(&self) -> Vec<Transaction> {
        self.feed.live()
    }

    /// Clears the transaction state bound to the calling thread.
    ///
    /// A final safeguard to invoke after all transaction resources should
    /// have been released, before returning the thread for reuse.
    pub fn clear_thread_state(&self) {
        self.contexts.lock().remove(&thread::current().id());
    }

    fn require_current(&self) -> Result<Transaction> {
        self.current()
            .ok_or_else(|| TransactionError::invalid_state("no transaction on the current thread"))
    }

    fn pop_current(&self) -> Result<Transaction> {
        let mut contexts = self.contexts.lock();
        let id = thread::current().id();
        let stack = contexts
            .get_mut(&id)
            .ok_or_else(|| TransactionError::invalid_state("no transaction on the current thread"))?;
        let transaction = stack
            .pop()
            .ok_or_else(|| TransactionError::invalid_state("no transaction on the current thread"))?;
        if stack.is_empty() {
            contexts.remove(&id);
        }
        Ok(transaction)
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
