use std::collections::{HashMap, HashSet};

use log::trace;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use super::dependency_graph::DependencyGraph;
use super::transaction::TransactionId;
use crate::storage::PageId;

/// How a page is locked. Shared locks may be held by many
/// transactions at once; an exclusive lock shuts everyone else out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// The only failures this module produces. Both mean the transaction
/// is done for: the caller aborts it and may retry with a fresh one.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// Waiting for the requested lock would close a cycle in the
    /// wait-for graph. Reported synchronously, before blocking.
    #[error("{0} would deadlock waiting for page {1}")]
    Deadlock(TransactionId, PageId),

    /// The transaction was aborted by another thread while it was
    /// asleep waiting for this lock.
    #[error("{0} was aborted while waiting for page {1}")]
    AbortedWhileWaiting(TransactionId, PageId),
}

/// Outcome of a non-blocking acquisition probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    Granted,
    WouldBlock,
}

// A granted lock: who holds the page, and how.
#[derive(Debug, Clone, Copy)]
struct PageLock {
    tid: TransactionId,
    mode: LockMode,
}

// Everything the manager mutates lives behind one mutex, so a grant
// decision and its wait-for edges are a single atomic step.
#[derive(Debug)]
struct LockState {
    // Holders per page. Either every entry is Shared, or there is
    // exactly one entry and it is Exclusive. Pages with no holders
    // are removed from the map entirely.
    lock_table: HashMap<PageId, Vec<PageLock>>,
    wait_for: DependencyGraph,
    // Transactions currently asleep inside acquire_lock.
    waiting: HashSet<TransactionId>,
    // Sleeping transactions whose locks were torn down while they
    // slept. They must give up instead of retrying.
    cancelled: HashSet<TransactionId>,
}

impl LockState {
    fn new() -> Self {
        Self {
            lock_table: HashMap::new(),
            wait_for: DependencyGraph::new(),
            waiting: HashSet::new(),
            cancelled: HashSet::new(),
        }
    }

    // The decision table. Grants mutate the holder set; a refusal
    // leaves it untouched so the caller can decide whether to wait.
    fn try_grant(&mut self, tid: TransactionId, pid: PageId, mode: LockMode) -> LockAttempt {
        let holders = self.lock_table.entry(pid).or_default();
        if holders.is_empty() {
            holders.push(PageLock { tid, mode });
            return LockAttempt::Granted;
        }

        match mode {
            LockMode::Shared => {
                if let Some(exclusive) = holders.iter().find(|l| l.mode == LockMode::Exclusive) {
                    // An exclusive holder re-reading its own page
                    // keeps the stronger lock; anyone else waits.
                    if exclusive.tid == tid {
                        LockAttempt::Granted
                    } else {
                        LockAttempt::WouldBlock
                    }
                } else if holders.iter().any(|l| l.tid == tid) {
                    LockAttempt::Granted
                } else {
                    holders.push(PageLock {
                        tid,
                        mode: LockMode::Shared,
                    });
                    LockAttempt::Granted
                }
            }
            LockMode::Exclusive => match holders.as_mut_slice() {
                // Sole holder: upgrade in place. Also covers the
                // plain reacquire, where this rewrite is a no-op.
                [lock] if lock.tid == tid => {
                    lock.mode = LockMode::Exclusive;
                    LockAttempt::Granted
                }
                _ => LockAttempt::WouldBlock,
            },
        }
    }

    // Current holders of a page, excluding the requester itself.
    fn blockers_of(&self, tid: TransactionId, pid: &PageId) -> Vec<TransactionId> {
        self.lock_table
            .get(pid)
            .map(|holders| {
                holders
                    .iter()
                    .map(|l| l.tid)
                    .filter(|holder| *holder != tid)
                    .collect()
            })
            .unwrap_or_default()
    }

    // Remove tid's lock on pid, looking holders up by transaction id.
    // Returns whether anything was actually released.
    fn release(&mut self, tid: TransactionId, pid: &PageId) -> bool {
        if let Some(holders) = self.lock_table.get_mut(pid) {
            let before = holders.len();
            holders.retain(|l| l.tid != tid);
            let released = holders.len() != before;
            if holders.is_empty() {
                self.lock_table.remove(pid);
            }
            released
        } else {
            false
        }
    }
}

/// Grants page locks under strict two phase locking.
///
/// The lock table and the wait-for graph are owned by the manager and
/// only ever touched inside its mutex, so at most one grant decision,
/// release or edge update is in flight at a time. A request that
/// cannot be granted sleeps on a condvar and re-runs the whole
/// decision from scratch on every wake-up; a request that would have
/// to wait for itself transitively is refused as a deadlock instead
/// of ever going to sleep.
pub struct LockManager {
    state: Mutex<LockState>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        LockManager {
            state: Mutex::new(LockState::new()),
            released: Condvar::new(),
        }
    }

    /// Acquire a lock on `pid` for `tid`, blocking until granted.
    ///
    /// `None` means non-transactional internal access: it always
    /// succeeds and records no holder.
    ///
    /// Fails without blocking when waiting would deadlock, and after
    /// a wake-up when the transaction was aborted in its sleep.
    pub fn acquire_lock(
        &self,
        tid: Option<TransactionId>,
        pid: PageId,
        mode: LockMode,
    ) -> Result<(), LockError> {
        let tid = match tid {
            Some(tid) => tid,
            None => return Ok(()),
        };

        let mut state = self.state.lock();
        loop {
            if state.try_grant(tid, pid, mode) == LockAttempt::Granted {
                trace!("{tid} acquired {mode:?} on page {pid}");
                return Ok(());
            }

            // We are about to wait on every current holder. If one of
            // the edges would close a cycle, the deadlock is on us:
            // refuse now rather than sleep forever. Edges added so
            // far in this attempt are rolled back.
            let blockers = state.blockers_of(tid, &pid);
            for (i, &holder) in blockers.iter().enumerate() {
                if !state.wait_for.add_dependency(tid, holder) {
                    for &added in &blockers[..i] {
                        state.wait_for.remove_dependency(tid, added);
                    }
                    trace!("{tid} would deadlock on page {pid}, refusing");
                    return Err(LockError::Deadlock(tid, pid));
                }
            }

            state.waiting.insert(tid);
            self.released.wait(&mut state);
            state.waiting.remove(&tid);

            // The holder set may have changed while we slept. Drop
            // the stale edges; the retry derives fresh ones.
            for &holder in &blockers {
                state.wait_for.remove_dependency(tid, holder);
            }

            if state.cancelled.remove(&tid) {
                trace!("{tid} was aborted while waiting for page {pid}");
                return Err(LockError::AbortedWhileWaiting(tid, pid));
            }
        }
    }

    /// Non-blocking probe of the decision table. Grants the lock when
    /// compatible; otherwise reports `WouldBlock` without touching
    /// the wait-for graph.
    pub fn try_acquire_lock(
        &self,
        tid: Option<TransactionId>,
        pid: PageId,
        mode: LockMode,
    ) -> LockAttempt {
        let tid = match tid {
            Some(tid) => tid,
            None => return LockAttempt::Granted,
        };

        let mut state = self.state.lock();
        state.try_grant(tid, pid, mode)
    }

    /// Release a single lock. No-op if `tid` holds nothing on `pid`.
    ///
    /// Rare in practice: two phase locking means most callers release
    /// everything at once through `release_all_locks`.
    pub fn release_lock(&self, tid: TransactionId, pid: PageId) {
        let mut state = self.state.lock();
        if state.release(tid, &pid) {
            trace!("{tid} released page {pid}");
            self.released.notify_all();
        }
    }

    /// Release every lock held by `tid` and drop its wait-for edges,
    /// as one atomic step. Called once, at commit or abort.
    ///
    /// If `tid` is itself asleep waiting for a lock (a concurrent
    /// abort), that sleeping call wakes up and returns an error
    /// instead of continuing to wait.
    pub fn release_all_locks(&self, tid: TransactionId) {
        let mut state = self.state.lock();
        state.lock_table.retain(|_, holders| {
            holders.retain(|l| l.tid != tid);
            !holders.is_empty()
        });
        state.wait_for.remove_waiter(tid);
        if state.waiting.contains(&tid) {
            state.cancelled.insert(tid);
        }
        trace!("released all locks of {tid}");
        self.released.notify_all();
    }

    /// Does `tid` currently hold a lock on `pid`, in any mode?
    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        let state = self.state.lock();
        state
            .lock_table
            .get(&pid)
            .map_or(false, |holders| holders.iter().any(|l| l.tid == tid))
    }

    /// Snapshot of the transactions currently holding `pid`. For
    /// diagnostics and tests.
    pub fn peek_lock(&self, pid: PageId) -> HashSet<TransactionId> {
        let state = self.state.lock();
        state
            .lock_table
            .get(&pid)
            .map(|holders| holders.iter().map(|l| l.tid).collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn is_waiting(&self, tid: TransactionId) -> bool {
        self.state.lock().waiting.contains(&tid)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
