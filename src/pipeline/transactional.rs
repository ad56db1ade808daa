use super::{
    AggregateHandling, MutationJournal, MutationKind, MutationOutcome, MutationPipeline,
    MutationState,
};
use crate::config::{AggregateUpdateMode, TransactionPolicy};
use crate::core::{AggregateKey, CounterRegistry, DetailId, NewDetail, Result, TallyError};
use crate::storage::{CommitSummary, RecordStore};
use crate::transaction::{Change, TransactionId, within_transaction};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{Level, event};

const NAME: &str = "transactional";

/// Writes the detail and its counters in one transaction.
///
/// A single invocation is all-or-nothing. The counters can still drift: a retry after a lost
/// commit acknowledgement re-applies the adjustment (the detail insert is `ON CONFLICT DO
/// NOTHING`, the increment is not), read-modify-write under read-committed loses concurrent
/// updates, and writes that bypass the pipeline are never counted.
pub struct TransactionalPipeline {
    store: Arc<dyn RecordStore>,
    registry: Arc<CounterRegistry>,
    journal: Arc<MutationJournal>,
    policy: TransactionPolicy,
    mode: AggregateUpdateMode,
}

impl TransactionalPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        registry: Arc<CounterRegistry>,
        journal: Arc<MutationJournal>,
        policy: TransactionPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            journal,
            policy,
            mode: AggregateUpdateMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: AggregateUpdateMode) -> Self {
        self.mode = mode;
        self
    }

    async fn stage_adjustments(
        store: &Arc<dyn RecordStore>,
        txn: TransactionId,
        keys: &[AggregateKey],
        delta: i64,
        mode: AggregateUpdateMode,
    ) -> Result<()> {
        for key in keys {
            let change = match mode {
                AggregateUpdateMode::AtomicIncrement => Change::adjust(key.clone(), delta),
                AggregateUpdateMode::ReadModifyWrite => {
                    let current = store.read_aggregate_in(txn, key).await?;
                    Change::SetAggregate {
                        key: key.clone(),
                        value: current + delta,
                    }
                }
            };
            store.stage(txn, change).await?;
        }
        Ok(())
    }

    fn settle(
        &self,
        mut outcome: MutationOutcome,
        result: Result<(Vec<AggregateKey>, CommitSummary)>,
    ) -> Result<MutationOutcome> {
        match result {
            Ok((keys, summary)) => {
                outcome.detail = summary
                    .inserted
                    .into_iter()
                    .next()
                    .or_else(|| summary.deleted.into_iter().next());
                outcome.aggregates = keys;
                outcome.advance(MutationState::DetailCommitted)?;
                outcome.advance(MutationState::AggregateApplied)?;
                self.journal.record(outcome.clone())?;
                Ok(outcome)
            }
            Err(err) => {
                // Both sides were rolled back, or the caller cannot tell: report nothing written.
                event!(
                    Level::WARN,
                    pipeline = NAME,
                    error = %err,
                    "transactional mutation failed"
                );
                outcome.advance(MutationState::DetailFailed)?;
                outcome.error = Some(err.clone());
                self.journal.record(outcome)?;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl MutationPipeline for TransactionalPipeline {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handling(&self) -> AggregateHandling {
        AggregateHandling::Inline
    }

    async fn create(&self, detail: NewDetail) -> Result<MutationOutcome> {
        let outcome = MutationOutcome::new(NAME, MutationKind::Create, AggregateHandling::Inline);
        let keys = self.registry.keys_for_new(&detail);
        let mode = self.mode;

        let result = within_transaction(&self.store, &self.policy, |store, txn| {
            let detail = detail.clone();
            let keys = keys.clone();
            async move {
                store.stage(txn, Change::insert_if_absent(detail)).await?;
                Self::stage_adjustments(&store, txn, &keys, 1, mode).await?;
                Ok(keys)
            }
        })
        .await;
        self.settle(outcome, result)
    }

    async fn delete(&self, id: DetailId) -> Result<MutationOutcome> {
        let outcome = MutationOutcome::new(NAME, MutationKind::Delete, AggregateHandling::Inline);
        let registry = self.registry.clone();
        let mode = self.mode;

        let result = within_transaction(&self.store, &self.policy, |store, txn| {
            let registry = registry.clone();
            async move {
                let record = store
                    .get_detail(id)
                    .await?
                    .ok_or(TallyError::DetailNotFound(id))?;
                let keys = registry.keys_for(&record);
                store.stage(txn, Change::DeleteDetail { id }).await?;
                Self::stage_adjustments(&store, txn, &keys, -1, mode).await?;
                Ok(keys)
            }
        })
        .await;
        self.settle(outcome, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeedConfig, RetryPolicy, StoreConfig};
    use crate::core::{EntityId, LIKES, OwnerRole};
    use crate::feed::ChangeFeed;
    use crate::storage::{FaultInjector, FaultPoint, InMemoryRecordStore};

    fn pipeline(
        retry: RetryPolicy,
    ) -> (TransactionalPipeline, Arc<dyn RecordStore>, Arc<FaultInjector>) {
        let faults = Arc::new(FaultInjector::new());
        let feed = ChangeFeed::new(&FeedConfig::default(), faults.clone());
        let store: Arc<dyn RecordStore> =
            Arc::new(InMemoryRecordStore::new(StoreConfig::default(), feed, faults.clone()));
        let policy = TransactionPolicy {
            retry,
            ..TransactionPolicy::default()
        };
        let pipeline = TransactionalPipeline::new(
            store.clone(),
            Arc::new(CounterRegistry::social()),
            Arc::new(MutationJournal::new()),
            policy,
        );
        (pipeline, store, faults)
    }

    #[tokio::test]
    async fn test_abort_leaves_nothing() {
        let (pipeline, store, faults) = pipeline(RetryPolicy::no_retry());
        faults.fail_next(FaultPoint::AggregateWrite, 1).unwrap();

        let err = pipeline.create(NewDetail::like("alice", "p1")).await.unwrap_err();
        assert!(matches!(err, TallyError::TransactionAbort { .. }));

        let alice = EntityId::from("alice");
        assert_eq!(store.count_where(LIKES, OwnerRole::Owner, &alice).await.unwrap(), 0);
        assert_eq!(
            store
                .read_aggregate(&AggregateKey::new("alice", "number_of_posts_liked"))
                .await
                .unwrap(),
            0
        );
        assert!(pipeline.journal.drifted().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_adjusts_counters() {
        let (pipeline, store, _) = pipeline(RetryPolicy::default());
        let outcome = pipeline.create(NewDetail::like("alice", "p1")).await.unwrap();
        pipeline.delete(outcome.detail_id().unwrap()).await.unwrap();

        assert_eq!(
            store
                .read_aggregate(&AggregateKey::new("p1", "like_count"))
                .await
                .unwrap(),
            0
        );
        assert!(matches!(
            pipeline.delete(outcome.detail_id().unwrap()).await,
            Err(TallyError::DetailNotFound(_))
        ));
    }
}
