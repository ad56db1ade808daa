use super::TransactionId;
use crate::config::TransactionPolicy;
use crate::core::{Result, TallyError};
use crate::storage::{CommitSummary, RecordStore};
use std::future::Future;
use std::sync::Arc;
use tracing::{Level, event};

/// Run `work` in a fresh transaction and commit it.
///
/// `work` must finish within `policy.timeout()`; when it does not, the transaction is rolled
/// back and nothing it staged is applied. The commit itself runs on its own task and is never
/// cut short: a commit abandoned halfway could not tell the caller whether its changes landed.
/// On any failure the transaction is rolled back, so neither details nor aggregates keep
/// partial changes. Retryable failures run `work` again in a new transaction, up to
/// `policy.retry.max_attempts` times.
pub async fn within_transaction<T, F, Fut>(
    store: &Arc<dyn RecordStore>,
    policy: &TransactionPolicy,
    mut work: F,
) -> Result<(T, CommitSummary)>
where
    F: FnMut(Arc<dyn RecordStore>, TransactionId) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let txn = store.begin().await?;

        let err = match tokio::time::timeout(policy.timeout(), work(store.clone(), txn)).await {
            Ok(Ok(value)) => match commit_detached(store, txn).await {
                Ok(summary) => return Ok((value, summary)),
                Err(err) => err,
            },
            Ok(Err(err)) => err,
            Err(_) => TallyError::TransactionAbort {
                txn: txn.as_u64(),
                reason: format!("timed out after {}ms", policy.timeout_ms),
            },
        };
        store.rollback(txn).await?;

        if !err.is_retryable() || attempt >= max_attempts {
            event!(
                Level::WARN,
                txn = %txn,
                attempt,
                error = %err,
                "transaction failed"
            );
            return Err(err);
        }
        event!(
            Level::DEBUG,
            txn = %txn,
            attempt,
            error = %err,
            "transaction failed, retrying"
        );
        tokio::time::sleep(policy.retry.backoff(attempt)).await;
    }
}

/// Commit on a spawned task, so dropping the caller cannot stop it between applying the
/// changes and publishing them.
async fn commit_detached(
    store: &Arc<dyn RecordStore>,
    txn: TransactionId,
) -> Result<CommitSummary> {
    let store = store.clone();
    tokio::spawn(async move { store.commit(txn).await })
        .await
        .map_err(|e| TallyError::Execution(format!("commit task for {} failed: {}", txn, e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeedConfig, RetryPolicy, StoreConfig};
    use crate::core::{AggregateKey, EntityId, LIKES, NewDetail, OwnerRole};
    use crate::feed::{ChangeFeed, Checkpoint};
    use crate::storage::{FaultInjector, FaultPoint, InMemoryRecordStore};
    use crate::transaction::Change;
    use std::time::Duration;

    fn store() -> (Arc<dyn RecordStore>, Arc<FaultInjector>) {
        let faults = Arc::new(FaultInjector::new());
        let feed = ChangeFeed::new(&FeedConfig::default(), faults.clone());
        let store = InMemoryRecordStore::new(StoreConfig::default(), feed, faults.clone());
        (Arc::new(store), faults)
    }

    fn slow_store(latency_ms: u64) -> Arc<InMemoryRecordStore> {
        let faults = Arc::new(FaultInjector::new());
        let feed = ChangeFeed::new(&FeedConfig::default(), faults.clone());
        let config = StoreConfig {
            operation_latency_ms: Some(latency_ms),
            ..StoreConfig::default()
        };
        Arc::new(InMemoryRecordStore::new(config, feed, faults))
    }

    fn like_unit(
        store: Arc<dyn RecordStore>,
        txn: TransactionId,
    ) -> impl Future<Output = Result<()>> {
        async move {
            store
                .stage(txn, Change::insert_if_absent(NewDetail::like("alice", "p1")))
                .await?;
            store
                .stage(txn, Change::adjust(AggregateKey::new("alice", "number_of_posts_liked"), 1))
                .await
        }
    }

    #[tokio::test]
    async fn test_retries_aborted_commit() {
        let (store, faults) = store();
        faults.fail_next(FaultPoint::Commit, 1).unwrap();

        let (_, summary) = within_transaction(&store, &TransactionPolicy::default(), like_unit)
            .await
            .unwrap();
        assert_eq!(summary.inserted.len(), 1);
        assert_eq!(faults.triggered(FaultPoint::Commit), 1);
    }

    #[tokio::test]
    async fn test_no_retry_surfaces_abort() {
        let (store, faults) = store();
        faults.fail_next(FaultPoint::AggregateWrite, 1).unwrap();
        let policy = TransactionPolicy {
            retry: RetryPolicy::no_retry(),
            ..TransactionPolicy::default()
        };

        let err = within_transaction(&store, &policy, like_unit).await.unwrap_err();
        assert!(matches!(err, TallyError::TransactionAbort { .. }));
        let alice = EntityId::from("alice");
        assert_eq!(store.count_where(LIKES, OwnerRole::Owner, &alice).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timeout_rolls_back() {
        let (store, _) = store();
        let policy = TransactionPolicy {
            timeout_ms: 20,
            retry: RetryPolicy::no_retry(),
        };

        let err = within_transaction(&store, &policy, |store, txn| async move {
            store
                .stage(txn, Change::insert(NewDetail::like("alice", "p1")))
                .await?;
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, TallyError::TransactionAbort { .. }));
        let found = store
            .find_detail(LIKES, &EntityId::from("alice"), &EntityId::from("p1"))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_slow_commit_is_not_cut_short() {
        let concrete = slow_store(60);
        let store: Arc<dyn RecordStore> = concrete.clone();
        let policy = TransactionPolicy {
            timeout_ms: 20,
            retry: RetryPolicy::no_retry(),
        };

        let (_, summary) = within_transaction(&store, &policy, like_unit).await.unwrap();
        assert_eq!(summary.inserted.len(), 1);
        let key = AggregateKey::new("alice", "number_of_posts_liked");
        assert_eq!(store.read_aggregate(&key).await.unwrap(), 1);
        assert_eq!(concrete.active_transactions().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_strand_commit() {
        let concrete = slow_store(60);
        let store: Arc<dyn RecordStore> = concrete.clone();
        let policy = TransactionPolicy::default();

        let caller = within_transaction(&store, &policy, like_unit);
        assert!(tokio::time::timeout(Duration::from_millis(10), caller).await.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let alice = EntityId::from("alice");
        let key = AggregateKey::new("alice", "number_of_posts_liked");
        assert_eq!(store.count_where(LIKES, OwnerRole::Owner, &alice).await.unwrap(), 1);
        assert_eq!(store.read_aggregate(&key).await.unwrap(), 1);
        assert_eq!(concrete.active_transactions().await, 0);
        assert_eq!(concrete.feed().head().await, Checkpoint(1));
    }
}
