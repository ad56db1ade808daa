use crate::config::{AggregateUpdateMode, TallyConfig};
use crate::core::{CounterRegistry, EntityId, Result};
use crate::feed::{ChangeFeed, DedupLock, StoreDedupLock};
use crate::pipeline::{
    CounterListener, CounterListenerWorker, DetailOnlyPipeline, DualWritePipeline,
    MutationJournal, MutationPipeline, PipelineKind, TransactionalPipeline,
    spawn_counter_listener,
};
use crate::reconcile::{
    CounterReading, DriftDetector, OnDemandCounter, ReconcilerWorker, spawn_reconciler,
};
use crate::storage::{FaultInjector, InMemoryRecordStore, RecordStore, SnapshotFile};
use log::info;
use std::path::Path;
use std::sync::Arc;

/// One record store with its change feed, fault injector and counter registry.
///
/// Every pipeline, listener and reconciler built from the same `TallyDb` shares that state.
pub struct TallyDb {
    config: TallyConfig,
    registry: Arc<CounterRegistry>,
    faults: Arc<FaultInjector>,
    feed: ChangeFeed,
    store: Arc<InMemoryRecordStore>,
    journal: Arc<MutationJournal>,
}

impl TallyDb {
    pub fn open(config: TallyConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(config.registry());
        let faults = Arc::new(FaultInjector::new());
        let feed = ChangeFeed::new(&config.feed, faults.clone());
        let store = Arc::new(InMemoryRecordStore::new(
            config.store.clone(),
            feed.clone(),
            faults.clone(),
        ));
        info!(
            "tallydb opened: {} counters, isolation {:?}",
            registry.specs().len(),
            config.store.isolation
        );
        Ok(Self {
            config,
            registry,
            faults,
            feed,
            store,
            journal: Arc::new(MutationJournal::new()),
        })
    }

    /// Open and restore the snapshot at `path` if there is one.
    pub async fn open_snapshot(config: TallyConfig, path: impl AsRef<Path>) -> Result<Self> {
        let db = Self::open(config)?;
        if let Some(snapshot) = SnapshotFile::new(path).load()? {
            db.store.restore(snapshot).await?;
        }
        Ok(db)
    }

    /// Write every record, aggregate, dedup claim and checkpoint to `path`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use tallydb::{TallyConfig, TallyDb};
    ///
    /// # tokio_test::block_on(async {
    /// let db = TallyDb::open(TallyConfig::default()).unwrap();
    /// db.save_snapshot("./data/tally.snapshot").await.unwrap();
    /// # });
    /// ```
    pub async fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = self.store.snapshot().await;
        SnapshotFile::new(path).save(&snapshot)
    }

    pub fn config(&self) -> &TallyConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CounterRegistry> {
        &self.registry
    }

    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn journal(&self) -> &Arc<MutationJournal> {
        &self.journal
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        self.store.clone()
    }

    pub fn record_store(&self) -> &Arc<InMemoryRecordStore> {
        &self.store
    }

    pub fn dual_write(&self) -> DualWritePipeline {
        DualWritePipeline::new(
            self.store(),
            self.registry.clone(),
            self.faults.clone(),
            self.journal.clone(),
        )
    }

    pub fn transactional(&self) -> TransactionalPipeline {
        TransactionalPipeline::new(
            self.store(),
            self.registry.clone(),
            self.journal.clone(),
            self.config.transaction.clone(),
        )
    }

    /// Details only; counters are read with [`counter`](Self::counter).
    pub fn on_demand(&self) -> DetailOnlyPipeline {
        DetailOnlyPipeline::new(self.store(), self.registry.clone(), self.journal.clone())
    }

    /// Details only; counters are maintained by a [`listener`](Self::listener).
    pub fn event_driven(&self) -> DetailOnlyPipeline {
        self.on_demand().deferred()
    }

    pub fn pipeline(&self, kind: PipelineKind) -> Box<dyn MutationPipeline> {
        match kind {
            PipelineKind::DualWrite => Box::new(self.dual_write()),
            PipelineKind::Transactional => Box::new(self.transactional()),
            PipelineKind::EventDriven => Box::new(self.event_driven()),
            PipelineKind::OnDemand => Box::new(self.on_demand()),
        }
    }

    /// Like [`pipeline`](Self::pipeline) with an explicit counter update mode for the
    /// pipelines that write counters inline.
    pub fn pipeline_with_mode(
        &self,
        kind: PipelineKind,
        mode: AggregateUpdateMode,
    ) -> Box<dyn MutationPipeline> {
        match kind {
            PipelineKind::DualWrite => Box::new(self.dual_write().with_mode(mode)),
            PipelineKind::Transactional => Box::new(self.transactional().with_mode(mode)),
            other => self.pipeline(other),
        }
    }

    /// A listener whose dedup claims are stored in the record store.
    pub fn listener(&self, name: &str) -> CounterListener {
        self.listener_with(name, Arc::new(StoreDedupLock::new(self.store())))
    }

    pub fn listener_with(&self, name: &str, dedup: Arc<dyn DedupLock>) -> CounterListener {
        CounterListener::new(
            name,
            self.store(),
            self.registry.clone(),
            dedup,
            self.config.transaction.clone(),
        )
    }

    pub async fn spawn_listener(&self, name: &str) -> Result<CounterListenerWorker> {
        spawn_counter_listener(
            Arc::new(self.listener(name)),
            self.feed.clone(),
            self.config.transaction.retry.backoff(1),
        )
        .await
    }

    pub fn counter(&self) -> OnDemandCounter {
        OnDemandCounter::new(self.store(), self.registry.clone())
    }

    pub fn detector(&self) -> DriftDetector {
        DriftDetector::new(
            self.store(),
            self.registry.clone(),
            self.config.transaction.clone(),
        )
    }

    pub fn spawn_reconciler(&self) -> ReconcilerWorker {
        spawn_reconciler(Arc::new(self.detector()), self.config.reconcile.clone())
    }

    /// Stored and true value of every counter of `owner`.
    pub async fn inspect(&self, owner: &EntityId) -> Result<Vec<CounterReading>> {
        self.detector().inspect(owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AggregateKey, NewDetail, TallyError};
    use tempfile::TempDir;

    #[test]
    fn test_open_rejects_invalid_config() {
        let config = TallyConfig::default().transaction_timeout_ms(0);
        assert!(matches!(TallyDb::open(config), Err(TallyError::Config(_))));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tally.snapshot");

        let db = TallyDb::open(TallyConfig::default()).unwrap();
        db.dual_write().create(NewDetail::like("alice", "p1")).await.unwrap();
        db.save_snapshot(&path).await.unwrap();

        let reopened = TallyDb::open_snapshot(TallyConfig::default(), &path)
            .await
            .unwrap();
        let readings = reopened.inspect(&EntityId::from("alice")).await.unwrap();
        assert!(readings.iter().all(|r| r.is_consistent()));
        assert_eq!(
            reopened
                .store()
                .read_aggregate(&AggregateKey::new("alice", "number_of_posts_liked"))
                .await
                .unwrap(),
            1
        );
    }
}
