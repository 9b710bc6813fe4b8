//! Lifecycle event feed.
//!
//! Each [`TransactionManager`](crate::TransactionManager) owns one feed;
//! there is no process-wide registry, so independent coordinators can
//! coexist. The feed emits an event for every transaction it knows about
//! at creation and again on every status change, and keeps a weak registry
//! of live transactions for enumeration without polling.

use crate::transaction::{Transaction, TxInner};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use veto_common::{TransactionStatus, Xid};

/// A single lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEvent {
    /// Identifier of the transaction the event concerns.
    pub xid: Xid,
    /// Status the transaction entered.
    pub status: TransactionStatus,
}

type Listener = Box<dyn Fn(&TransactionEvent) + Send + Sync>;

/// Broadcast channel for transaction lifecycle events.
pub struct TransactionFeed {
    subscribers: RwLock<Vec<Sender<TransactionEvent>>>,
    listeners: RwLock<Vec<Listener>>,
    live: Mutex<Vec<Weak<TxInner>>>,
}

impl TransactionFeed {
    /// Creates an empty feed.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            live: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes to the feed.
    ///
    /// Returns a receiver that observes all future lifecycle events. The
    /// receiver should be drained regularly; a dropped receiver is pruned
    /// on the next emit.
    pub fn subscribe(&self) -> Receiver<TransactionEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Registers a callback invoked synchronously on every event.
    ///
    /// The callback runs while the emitting transaction's lock is held and
    /// must not call back into that transaction.
    pub fn listen(&self, callback: impl Fn(&TransactionEvent) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(callback));
    }

    /// Transactions registered with this feed that have not reached a
    /// terminal status. Dead and completed entries are culled.
    pub fn live(&self) -> Vec<Transaction> {
        let mut registry = self.live.lock();
        let mut alive = Vec::new();
        registry.retain(|weak| match weak.upgrade() {
            Some(inner) => {
                let transaction = Transaction::from_inner(inner);
                if transaction.status().is_terminal() {
                    false
                } else {
                    alive.push(transaction);
                    true
                }
            }
            None => false,
        });
        alive
    }

    pub(crate) fn register(&self, inner: &Arc<TxInner>) {
        self.live.lock().push(Arc::downgrade(inner));
    }

    pub(crate) fn emit(&self, event: TransactionEvent) {
        {
            let mut subscribers = self.subscribers.write();
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
        for listener in self.listeners.read().iter() {
            listener(&event);
        }
    }
}

impl Default for TransactionFeed {
    fn default() -> Self {
        Self::new()
    }
}
