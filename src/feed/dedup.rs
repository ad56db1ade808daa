use super::event::EventId;
use crate::core::Result;
use crate::storage::RecordStore;
use crate::transaction::{Change, TransactionId};
use async_trait::async_trait;
use std::sync::Arc;

/// Guards a listener against applying the same event twice.
#[async_trait]
pub trait DedupLock: Send + Sync {
    /// Claim `event_id` as part of `txn`. False when an earlier commit already claimed it.
    ///
    /// The claim only holds if `txn` commits, so it cannot outlive a failed counter update or
    /// go missing from a successful one.
    async fn acquire_once(&self, txn: TransactionId, event_id: EventId) -> Result<bool>;
}

/// Claims live in the record store next to the data they protect.
pub struct StoreDedupLock {
    store: Arc<dyn RecordStore>,
}

impl StoreDedupLock {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DedupLock for StoreDedupLock {
    async fn acquire_once(&self, txn: TransactionId, event_id: EventId) -> Result<bool> {
        if self.store.is_event_processed(event_id).await? {
            return Ok(false);
        }
        // A concurrent claim of the same id is caught at commit.
        self.store.stage(txn, Change::ClaimEvent { event_id }).await?;
        Ok(true)
    }
}

/// Accepts every delivery. A redelivered event is applied again.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDedup;

#[async_trait]
impl DedupLock for NoDedup {
    async fn acquire_once(&self, _txn: TransactionId, _event_id: EventId) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeedConfig, StoreConfig};
    use crate::core::TallyError;
    use crate::feed::ChangeFeed;
    use crate::storage::{FaultInjector, InMemoryRecordStore};

    fn store() -> Arc<dyn RecordStore> {
        let faults = Arc::new(FaultInjector::new());
        let feed = ChangeFeed::new(&FeedConfig::default(), faults.clone());
        Arc::new(InMemoryRecordStore::new(StoreConfig::default(), feed, faults))
    }

    #[tokio::test]
    async fn test_store_lock_claims_on_commit() {
        let store = store();
        let lock = StoreDedupLock::new(store.clone());
        let id = EventId::new();

        let first = store.begin().await.unwrap();
        assert!(lock.acquire_once(first, id).await.unwrap());
        // Not visible until the claiming transaction commits.
        assert!(!store.is_event_processed(id).await.unwrap());
        store.commit(first).await.unwrap();

        let second = store.begin().await.unwrap();
        assert!(!lock.acquire_once(second, id).await.unwrap());
        store.rollback(second).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_claims_commit_once() {
        let store = store();
        let lock = StoreDedupLock::new(store.clone());
        let id = EventId::new();

        let first = store.begin().await.unwrap();
        let second = store.begin().await.unwrap();
        assert!(lock.acquire_once(first, id).await.unwrap());
        assert!(lock.acquire_once(second, id).await.unwrap());

        store.commit(first).await.unwrap();
        let err = store.commit(second).await.unwrap_err();
        assert!(matches!(err, TallyError::EventAlreadyClaimed(_)));
        assert_eq!(store.processed_events().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rolled_back_claim_is_forgotten() {
        let store = store();
        let lock = StoreDedupLock::new(store.clone());
        let id = EventId::new();

        let txn = store.begin().await.unwrap();
        assert!(lock.acquire_once(txn, id).await.unwrap());
        store.rollback(txn).await.unwrap();
        assert!(!store.is_event_processed(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_dedup_accepts_repeats() {
        let store = store();
        let id = EventId::new();
        let txn = store.begin().await.unwrap();
        assert!(NoDedup.acquire_once(txn, id).await.unwrap());
        assert!(NoDedup.acquire_once(txn, id).await.unwrap());
    }
}
