//! Deadline-triggered rollback scheduling.
//!
//! A shared pool of background workers services a min-heap delay queue.
//! Every transaction arms exactly one entry at creation; completion
//! disarms it. Disarming is best-effort: a task that already started
//! firing is harmless because the fire path re-checks the transaction's
//! state under its lock.

use crate::transaction::{Transaction, TxInner};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

/// Cancellation handle for one scheduled rollback.
pub(crate) struct RollbackTicket {
    cancelled: Arc<AtomicBool>,
}

impl RollbackTicket {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Release);
    }
}

struct Entry {
    due: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    target: Weak<TxInner>,
}

// BinaryHeap is a max-heap; invert the comparison so the earliest
// deadline surfaces first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

struct Shared {
    queue: Mutex<BinaryHeap<Entry>>,
    available: Condvar,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
}

/// Shared pool of workers that roll back transactions at their deadline.
pub struct RollbackScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RollbackScheduler {
    /// Creates a scheduler backed by `workers` background threads.
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });

        let handles = (0..workers.max(1))
            .map(|n| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("veto-rollback/{n}"))
                    .spawn(move || run_worker(shared))
                    .expect("spawn rollback worker")
            })
            .collect();

        Self {
            shared,
            workers: Mutex::new(handles),
        }
    }

    /// Arms one rollback to fire at `due` against `target`.
    pub(crate) fn schedule(&self, target: Weak<TxInner>, due: Instant) -> RollbackTicket {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = Entry {
            due,
            seq: self.shared.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
            cancelled: cancelled.clone(),
            target,
        };
        self.shared.queue.lock().push(entry);
        self.shared.available.notify_one();
        RollbackTicket { cancelled }
    }

    /// Stops the worker pool. Pending entries are dropped; transactions
    /// still in flight fail their own expiry checks independently.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, AtomicOrdering::Release);
        self.shared.available.notify_all();
        let current = std::thread::current().id();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            // The last reference can be dropped from a worker firing the
            // final rollback; that worker must not join itself.
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Default for RollbackScheduler {
    fn default() -> Self {
        Self::new(8)
    }
}

impl Drop for RollbackScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: Arc<Shared>) {
    let mut queue = shared.queue.lock();
    loop {
        if shared.shutdown.load(AtomicOrdering::Acquire) {
            return;
        }

        let now = Instant::now();
        match queue.peek() {
            None => {
                shared.available.wait(&mut queue);
            }
            Some(entry) if entry.due > now => {
                let due = entry.due;
                let _ = shared.available.wait_until(&mut queue, due);
            }
            Some(_) => {
                let entry = queue.pop().expect("peeked entry");
                drop(queue);
                fire(entry);
                queue = shared.queue.lock();
            }
        }
    }
}

fn fire(entry: Entry) {
    if entry.cancelled.load(AtomicOrdering::Acquire) {
        return;
    }
    if let Some(inner) = entry.target.upgrade() {
        Transaction::from_inner(inner).timed_rollback();
    }
}
