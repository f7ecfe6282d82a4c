//! Concurrency control core of the storage engine: page-granularity
//! two phase locking with wait-for-graph deadlock detection.
//!
//! Page access layers take locks through
//! [`concurrency::LockManager::acquire_lock`] before returning a page
//! to anyone, and release everything at commit or abort through
//! [`concurrency::TransactionManager`]. A deadlock is reported to the
//! requester that would have closed the waiting cycle; that
//! transaction aborts and may retry.

pub mod concurrency;
pub mod storage;
