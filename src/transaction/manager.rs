// ============================================================================
// Transaction Manager
// ============================================================================

use super::{Change, Transaction, TransactionId, TransactionState};
use crate::core::{AggregateKey, Result, TallyError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Tracks active transactions for a store.
pub struct TransactionManager {
    transactions: Arc<RwLock<HashMap<TransactionId, Transaction>>>,

    // Transactions that lost a serializable validation.
    conflicted_ids: Arc<RwLock<HashSet<u64>>>,

    committed: AtomicU64,
    aborted: AtomicU64,
    conflicts: AtomicU64,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            transactions: Arc::new(RwLock::new(HashMap::new())),
            conflicted_ids: Arc::new(RwLock::new(HashSet::new())),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
        }
    }

    pub async fn begin(&self) -> TransactionId {
        let transaction_id = TransactionId::new();
        let mut transactions = self.transactions.write().await;
        transactions.insert(transaction_id, Transaction::new(transaction_id));
        transaction_id
    }

    pub async fn record_change(&self, txn_id: TransactionId, change: Change) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        let transaction = transactions
            .get_mut(&txn_id)
            .ok_or_else(|| not_found(txn_id))?;
        transaction.record_change(change)
    }

    pub async fn record_read(
        &self,
        txn_id: TransactionId,
        key: AggregateKey,
        version: u64,
    ) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        let transaction = transactions
            .get_mut(&txn_id)
            .ok_or_else(|| not_found(txn_id))?;
        transaction.record_read(key, version)
    }

    /// Remove an active transaction so its changes can be applied.
    ///
    /// The caller must hand it back through [`finish`](Self::finish).
    pub async fn take_for_commit(&self, txn_id: TransactionId) -> Result<Transaction> {
        let mut transactions = self.transactions.write().await;
        let transaction = transactions
            .remove(&txn_id)
            .ok_or_else(|| not_found(txn_id))?;
        if transaction.state() != TransactionState::Active {
            return Err(TallyError::Execution(format!(
                "Transaction {} not active",
                txn_id
            )));
        }
        Ok(transaction)
    }

    /// Settle a transaction taken by [`take_for_commit`](Self::take_for_commit).
    pub async fn finish(&self, mut transaction: Transaction, committed: bool) -> Result<()> {
        if committed {
            transaction.commit()?;
            self.committed.fetch_add(1, Ordering::Relaxed);
        } else {
            transaction.rollback()?;
            self.aborted.fetch_add(1, Ordering::Relaxed);
        }
        let mut conflicts = self.conflicted_ids.write().await;
        conflicts.remove(&transaction.id().0);
        Ok(())
    }

    /// Discard an active transaction. Unknown ids are ignored: the transaction has already
    /// been committed or rolled back.
    pub async fn rollback(&self, txn_id: TransactionId) -> Result<bool> {
        let removed = {
            let mut transactions = self.transactions.write().await;
            transactions.remove(&txn_id)
        };
        match removed {
            Some(mut transaction) => {
                transaction.rollback()?;
                self.aborted.fetch_add(1, Ordering::Relaxed);
                let mut conflicts = self.conflicted_ids.write().await;
                conflicts.remove(&txn_id.0);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn mark_conflict(&self, txn_id: TransactionId) {
        let mut conflicts = self.conflicted_ids.write().await;
        if conflicts.insert(txn_id.0) {
            self.conflicts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn is_conflicted(&self, txn_id: TransactionId) -> bool {
        let conflicts = self.conflicted_ids.read().await;
        conflicts.contains(&txn_id.0)
    }

    pub async fn active_count(&self) -> usize {
        self.transactions.read().await.len()
    }

    pub async fn get_transaction_info(&self, txn_id: TransactionId) -> Option<TransactionInfo> {
        let transactions = self.transactions.read().await;
        transactions.get(&txn_id).map(|txn| TransactionInfo {
            id: txn.id(),
            state: txn.state(),
            change_count: txn.change_count(),
            reads: txn.read_set().len(),
            duration: txn.duration(),
        })
    }

    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}

fn not_found(txn_id: TransactionId) -> TallyError {
    TallyError::Execution(format!("Transaction {} not found", txn_id))
}

pub struct TransactionInfo {
    pub id: TransactionId,
    pub state: TransactionState,
    pub change_count: usize,
    pub reads: usize,
    pub duration: std::time::Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub committed: u64,
    pub aborted: u64,
    /// Commits refused by serializable validation.
    pub conflicts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NewDetail;

    #[tokio::test]
    async fn test_take_and_finish() {
        let manager = TransactionManager::new();
        let txn = manager.begin().await;
        manager
            .record_change(txn, Change::insert(NewDetail::like("alice", "p1")))
            .await
            .unwrap();

        let info = manager.get_transaction_info(txn).await.unwrap();
        assert_eq!(info.change_count, 1);

        let transaction = manager.take_for_commit(txn).await.unwrap();
        manager.finish(transaction, true).await.unwrap();
        assert_eq!(manager.active_count().await, 0);
        assert_eq!(manager.stats().committed, 1);

        // Already settled: nothing left to take.
        assert!(manager.take_for_commit(txn).await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_is_idempotent() {
        let manager = TransactionManager::new();
        let txn = manager.begin().await;
        manager.mark_conflict(txn).await;
        assert!(manager.is_conflicted(txn).await);

        assert!(manager.rollback(txn).await.unwrap());
        assert!(!manager.rollback(txn).await.unwrap());
        assert!(!manager.is_conflicted(txn).await);
        assert_eq!(manager.stats().aborted, 1);
    }
}
