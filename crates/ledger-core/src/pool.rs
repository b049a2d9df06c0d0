use crate::Block;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Order-preserving multiset of pending transactions.
///
/// The block producer peeks at the head and leaves it in place; a transaction only
/// leaves the pool once a block carrying it has been committed and [`TxPool::prune`] runs.
#[derive(Debug, Default)]
pub struct TxPool {
    inner: Mutex<VecDeque<String>>,
}

impl TxPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, transaction: String) {
        self.lock().push_back(transaction);
    }

    pub fn peek(&self) -> Option<String> {
        self.lock().front().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, transaction: &str) -> bool {
        self.lock().iter().any(|t| t == transaction)
    }

    /// Removes every occurrence of each listed transaction; returns how many entries went.
    pub fn remove_all(&self, transactions: &[String]) -> usize {
        let mut pool = self.lock();
        let before = pool.len();
        pool.retain(|t| !transactions.contains(t));
        before - pool.len()
    }

    /// Drops every transaction that appears in any of `blocks`.
    pub fn prune<'a>(&self, blocks: impl IntoIterator<Item = &'a Block>) -> usize {
        let removed = blocks
            .into_iter()
            .map(|block| self.remove_all(block.transactions()))
            .sum();
        if removed > 0 {
            debug!(removed, remaining = self.len(), "pruned transaction pool");
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }
}
