use std::collections::{HashMap, HashSet, VecDeque};

use super::transaction::TransactionId;

/// Wait-for graph between transactions. An edge `u -> v` means `u`
/// cannot proceed until `v` releases a lock.
///
/// The graph is kept acyclic at all times: an edge that would close a
/// cycle is refused, which is how the lock manager detects a deadlock
/// before putting a transaction to sleep.
#[derive(Debug)]
pub(crate) struct DependencyGraph {
    // key: waiting transaction, value: the transactions it is blocked on
    edges: HashMap<TransactionId, HashSet<TransactionId>>,
}

impl DependencyGraph {
    pub(crate) fn new() -> Self {
        Self {
            edges: HashMap::new(),
        }
    }

    /// Record that `u` waits for `v`.
    ///
    /// Refuses, returning `false` and leaving the graph untouched,
    /// when `u` is already reachable from `v`: inserting the edge
    /// would close the cycle `u -> v -> .. -> u`. Waiting on yourself
    /// is meaningless, so `u == v` is a trivial success. Inserting an
    /// edge that already exists is fine.
    pub(crate) fn add_dependency(&mut self, u: TransactionId, v: TransactionId) -> bool {
        if u == v {
            return true;
        }
        if self.reachable(v, u) {
            return false;
        }
        self.edges.entry(u).or_default().insert(v);
        true
    }

    /// Drop the edge `u -> v` if present. No-op otherwise.
    pub(crate) fn remove_dependency(&mut self, u: TransactionId, v: TransactionId) {
        if let Some(blocking) = self.edges.get_mut(&u) {
            blocking.remove(&v);
            if blocking.is_empty() {
                self.edges.remove(&u);
            }
        }
    }

    /// Drop every edge where `u` is the waiter. Called whenever `u`
    /// stops waiting: a grant, a retry with fresh edges, or an abort.
    pub(crate) fn remove_waiter(&mut self, u: TransactionId) {
        self.edges.remove(&u);
    }

    // Breadth first search from `from` towards `to`. The visited set
    // guarantees termination when transactions share blockers.
    fn reachable(&self, from: TransactionId, to: TransactionId) -> bool {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(from);

        while let Some(tid) = queue.pop_front() {
            if tid == to {
                return true;
            }
            if !visited.insert(tid) {
                continue;
            }
            if let Some(blocking) = self.edges.get(&tid) {
                queue.extend(blocking.iter().copied());
            }
        }

        false
    }
}
