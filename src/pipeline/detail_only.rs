use super::{
    AggregateHandling, MutationJournal, MutationKind, MutationOutcome, MutationPipeline,
    MutationState,
};
use crate::core::{CounterRegistry, DetailId, DetailRecord, NewDetail, Result};
use crate::storage::RecordStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{Level, event};

/// Writes only the detail record.
///
/// With [`AggregateHandling::Derived`] there is no counter to maintain: reads count the
/// records. With [`AggregateHandling::Deferred`] a [`CounterListener`](super::CounterListener)
/// on the change feed maintains the counters.
pub struct DetailOnlyPipeline {
    store: Arc<dyn RecordStore>,
    registry: Arc<CounterRegistry>,
    journal: Arc<MutationJournal>,
    handling: AggregateHandling,
}

impl DetailOnlyPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        registry: Arc<CounterRegistry>,
        journal: Arc<MutationJournal>,
    ) -> Self {
        Self {
            store,
            registry,
            journal,
            handling: AggregateHandling::Derived,
        }
    }

    /// Leave the counters to a change-feed listener.
    pub fn deferred(mut self) -> Self {
        self.handling = AggregateHandling::Deferred;
        self
    }

    fn settle(
        &self,
        mut outcome: MutationOutcome,
        result: Result<DetailRecord>,
    ) -> Result<MutationOutcome> {
        match result {
            Ok(record) => {
                outcome.aggregates = self.registry.keys_for(&record);
                outcome.detail = Some(record);
                outcome.advance(MutationState::DetailCommitted)?;
                if self.handling == AggregateHandling::Derived {
                    outcome.advance(MutationState::AggregateApplied)?;
                }
                self.journal.record(outcome.clone())?;
                Ok(outcome)
            }
            Err(err) => {
                event!(Level::WARN, pipeline = self.name(), error = %err, "detail write failed");
                outcome.advance(MutationState::DetailFailed)?;
                outcome.error = Some(err.clone());
                self.journal.record(outcome)?;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl MutationPipeline for DetailOnlyPipeline {
    fn name(&self) -> &'static str {
        match self.handling {
            AggregateHandling::Deferred => "event",
            _ => "on-demand",
        }
    }

    fn handling(&self) -> AggregateHandling {
        self.handling
    }

    async fn create(&self, detail: NewDetail) -> Result<MutationOutcome> {
        let outcome = MutationOutcome::new(self.name(), MutationKind::Create, self.handling);
        let result = self.store.create_detail(detail).await;
        self.settle(outcome, result)
    }

    async fn delete(&self, id: DetailId) -> Result<MutationOutcome> {
        let outcome = MutationOutcome::new(self.name(), MutationKind::Delete, self.handling);
        let result = self.store.delete_detail(id).await;
        self.settle(outcome, result)
    }
}
