use super::{
    AggregateHandling, MutationJournal, MutationKind, MutationOutcome, MutationPipeline,
    MutationState,
};
use crate::config::AggregateUpdateMode;
use crate::core::{
    AggregateKey, CounterRegistry, DetailId, DetailRecord, NewDetail, Result, TallyError,
};
use crate::storage::{FaultInjector, FaultPoint, RecordStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{Level, event};

const NAME: &str = "dual-write";

/// Writes the detail, then the counters, as two independent store calls.
///
/// Nothing ties the second write to the first: a failure in between leaves the detail committed
/// and the counters stale. Failures are logged and returned, never retried.
pub struct DualWritePipeline {
    store: Arc<dyn RecordStore>,
    registry: Arc<CounterRegistry>,
    faults: Arc<FaultInjector>,
    journal: Arc<MutationJournal>,
    mode: AggregateUpdateMode,
}

impl DualWritePipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        registry: Arc<CounterRegistry>,
        faults: Arc<FaultInjector>,
        journal: Arc<MutationJournal>,
    ) -> Self {
        Self {
            store,
            registry,
            faults,
            journal,
            mode: AggregateUpdateMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: AggregateUpdateMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> AggregateUpdateMode {
        self.mode
    }

    async fn apply(&self, key: &AggregateKey, delta: i64) -> Result<i64> {
        match self.mode {
            AggregateUpdateMode::AtomicIncrement => {
                self.store.increment_aggregate(key, delta).await
            }
            AggregateUpdateMode::ReadModifyWrite => {
                let current = self.store.read_aggregate(key).await?;
                tokio::task::yield_now().await;
                let next = current + delta;
                self.store.write_aggregate(key, next).await?;
                Ok(next)
            }
        }
    }

    /// Second half of a mutation: adjust every counter the committed `record` touches.
    async fn finish(
        &self,
        mut outcome: MutationOutcome,
        record: DetailRecord,
    ) -> Result<MutationOutcome> {
        outcome.advance(MutationState::DetailCommitted)?;
        let keys = self.registry.keys_for(&record);
        outcome.detail = Some(record);
        outcome.aggregates = keys.clone();
        let delta = outcome.kind.delta();

        for (i, key) in keys.iter().enumerate() {
            if i == 0 && self.faults.should_fail(FaultPoint::BetweenWrites)? {
                let err = TallyError::AggregateWriteFailure {
                    owner: key.owner.clone(),
                    field: key.field.clone(),
                    reason: "interrupted after the detail write".into(),
                };
                // The aggregate step never ran: the mutation stays at DetailCommitted.
                return self.fail(outcome, err);
            }
            if let Err(err) = self.apply(key, delta).await {
                let err = match err {
                    err @ TallyError::AggregateWriteFailure { .. } => err,
                    other => TallyError::AggregateWriteFailure {
                        owner: key.owner.clone(),
                        field: key.field.clone(),
                        reason: other.to_string(),
                    },
                };
                outcome.advance(MutationState::AggregateFailed)?;
                return self.fail(outcome, err);
            }
        }

        outcome.advance(MutationState::AggregateApplied)?;
        self.journal.record(outcome.clone())?;
        Ok(outcome)
    }

    fn fail(&self, mut outcome: MutationOutcome, err: TallyError) -> Result<MutationOutcome> {
        if err.causes_drift() {
            event!(
                Level::ERROR,
                pipeline = NAME,
                state = %outcome.state,
                detail = ?outcome.detail_id(),
                error = %err,
                "counters no longer match their records"
            );
        } else {
            event!(
                Level::ERROR,
                pipeline = NAME,
                state = %outcome.state,
                error = %err,
                "detail write failed; nothing was counted"
            );
        }
        outcome.error = Some(err.clone());
        self.journal.record(outcome)?;
        Err(err)
    }
}

#[async_trait]
impl MutationPipeline for DualWritePipeline {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handling(&self) -> AggregateHandling {
        AggregateHandling::Inline
    }

    async fn create(&self, detail: NewDetail) -> Result<MutationOutcome> {
        let mut outcome =
            MutationOutcome::new(NAME, MutationKind::Create, AggregateHandling::Inline);
        match self.store.create_detail(detail).await {
            Ok(record) => self.finish(outcome, record).await,
            Err(err) => {
                outcome.advance(MutationState::DetailFailed)?;
                self.fail(outcome, err)
            }
        }
    }

    async fn delete(&self, id: DetailId) -> Result<MutationOutcome> {
        let mut outcome =
            MutationOutcome::new(NAME, MutationKind::Delete, AggregateHandling::Inline);
        match self.store.delete_detail(id).await {
            Ok(record) => self.finish(outcome, record).await,
            Err(err) => {
                outcome.advance(MutationState::DetailFailed)?;
                self.fail(outcome, err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeedConfig, StoreConfig};
    use crate::feed::ChangeFeed;
    use crate::storage::InMemoryRecordStore;

    fn pipeline() -> (DualWritePipeline, Arc<dyn RecordStore>, Arc<FaultInjector>) {
        let faults = Arc::new(FaultInjector::new());
        let feed = ChangeFeed::new(&FeedConfig::default(), faults.clone());
        let store: Arc<dyn RecordStore> =
            Arc::new(InMemoryRecordStore::new(StoreConfig::default(), feed, faults.clone()));
        let pipeline = DualWritePipeline::new(
            store.clone(),
            Arc::new(CounterRegistry::social()),
            faults.clone(),
            Arc::new(MutationJournal::new()),
        );
        (pipeline, store, faults)
    }

    #[tokio::test]
    async fn test_create_and_delete_adjust_counters() {
        let (pipeline, store, _) = pipeline();
        let liked = AggregateKey::new("alice", "number_of_posts_liked");
        let likes = AggregateKey::new("p1", "like_count");

        let outcome = pipeline.create(NewDetail::like("alice", "p1")).await.unwrap();
        assert!(outcome.is_consistent());
        assert_eq!(outcome.aggregates, vec![liked.clone(), likes.clone()]);
        assert_eq!(store.read_aggregate(&liked).await.unwrap(), 1);
        assert_eq!(store.read_aggregate(&likes).await.unwrap(), 1);

        let id = outcome.detail_id().unwrap();
        pipeline.delete(id).await.unwrap();
        assert_eq!(store.read_aggregate(&liked).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_interrupted_write_leaves_detail_committed() {
        let (pipeline, store, faults) = pipeline();
        faults.fail_next(FaultPoint::BetweenWrites, 1).unwrap();

        let err = pipeline.create(NewDetail::like("alice", "p1")).await.unwrap_err();
        assert!(matches!(err, TallyError::AggregateWriteFailure { .. }));

        let drifted = pipeline.journal.drifted().unwrap();
        assert_eq!(drifted.len(), 1);
        assert_eq!(drifted[0].state, MutationState::DetailCommitted);
        assert!(store.get_detail(drifted[0].detail_id().unwrap()).await.unwrap().is_some());
        assert_eq!(
            store
                .read_aggregate(&AggregateKey::new("alice", "number_of_posts_liked"))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_detail_failure_is_not_drift() {
        let (pipeline, _, faults) = pipeline();
        faults.fail_next(FaultPoint::DetailWrite, 1).unwrap();

        let err = pipeline.create(NewDetail::like("alice", "p1")).await.unwrap_err();
        assert!(matches!(err, TallyError::DetailWriteFailure(_)));
        assert!(pipeline.journal.drifted().unwrap().is_empty());
        assert_eq!(pipeline.journal.len(), 1);
    }
}
