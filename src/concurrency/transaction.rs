use std::fmt;

/// Opaque handle identifying a running transaction.
///
/// Allocated by the `TransactionManager` when a transaction begins and
/// never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub(crate) fn new(id: u64) -> Self {
        TransactionId(id)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    // Under two phase locking a transaction only ever acquires locks
    // until it ends, so this is the only live state.
    Growing,
    Committed,
    Aborted,
}

/// A running transaction. The lock manager is the single authority on
/// which pages it holds, so none of that is duplicated here.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: TransactionState::Growing,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    pub fn is_finished(&self) -> bool {
        self.state == TransactionState::Committed || self.state == TransactionState::Aborted
    }
}
