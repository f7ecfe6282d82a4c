use std::collections::HashMap;
use std::sync::{self, atomic::AtomicU64, Arc};

use log::debug;
use parking_lot::RwLock;

use super::lock_manager::{LockError, LockManager, LockMode};
use super::transaction::{Transaction, TransactionId, TransactionState};
use crate::storage::PageId;

/// Hands out transaction ids and drives the locking lifecycle: page
/// access goes through `lock_page` first, and commit or abort release
/// every lock the transaction holds in one step.
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    transaction_map: Arc<RwLock<HashMap<TransactionId, Arc<RwLock<Transaction>>>>>,
    lock_manager: Arc<LockManager>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            transaction_map: Arc::new(RwLock::new(HashMap::new())),
            lock_manager,
        }
    }

    pub fn begin(&self) -> Arc<RwLock<Transaction>> {
        let id = self
            .next_txn_id
            .fetch_add(1, sync::atomic::Ordering::SeqCst);
        let id = TransactionId::new(id);

        let transaction = Arc::new(RwLock::new(Transaction::new(id)));

        let mut map = self.transaction_map.write();
        map.insert(id, Arc::clone(&transaction));
        drop(map);

        transaction
    }

    /// Begin a transaction, run `f` with it, and commit afterwards
    /// unless `f` already finished the transaction itself.
    pub fn execute<F, T>(&self, f: F) -> T
    where
        F: FnOnce(Arc<RwLock<Transaction>>, &TransactionManager) -> T,
    {
        let transaction = self.begin();
        let result = f(Arc::clone(&transaction), self);

        let mut t = transaction.write();
        if !t.is_finished() {
            self.commit(&mut t);
        }

        result
    }

    /// The page-access hook: the page layer calls this before handing
    /// a page to anyone.
    ///
    /// A deadlock (or an abort that raced our wait) aborts the
    /// transaction on the spot, releasing its locks, and the error is
    /// passed back up so the caller can retry with a fresh
    /// transaction.
    pub fn lock_page(
        &self,
        transaction: &Arc<RwLock<Transaction>>,
        pid: PageId,
        mode: LockMode,
    ) -> Result<(), LockError> {
        let tid = transaction.read().id();

        match self.lock_manager.acquire_lock(Some(tid), pid, mode) {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!("aborting {tid}: {err}");
                let mut t = transaction.write();
                self.abort(&mut t);
                Err(err)
            }
        }
    }

    pub fn commit(&self, transaction: &mut Transaction) {
        self.finish(transaction, TransactionState::Committed);
    }

    pub fn abort(&self, transaction: &mut Transaction) {
        self.finish(transaction, TransactionState::Aborted);
    }

    // Finishing twice is a no-op, so locks are released exactly once
    // no matter how commit and abort race.
    fn finish(&self, transaction: &mut Transaction, state: TransactionState) {
        if transaction.is_finished() {
            return;
        }

        transaction.set_state(state);
        self.lock_manager.release_all_locks(transaction.id());
        self.transaction_map.write().remove(&transaction.id());
        debug!("{} finished: {state:?}", transaction.id());
    }

    pub fn get_transaction(&self, id: &TransactionId) -> Option<Arc<RwLock<Transaction>>> {
        self.transaction_map.read().get(id).cloned()
    }
}
