use super::engine::{CommitSummary, CountPlan, RecordStore, Recount};
use super::fault::{FaultInjector, FaultPoint};
use super::persistence::StoreSnapshot;
use super::table::DetailTable;
use crate::config::{IsolationLevel, StoreConfig};
use crate::core::{
    AggregateKey, CounterName, DetailId, DetailRecord, EntityId, NewDetail, OwnerRole, Result,
    TallyError,
};
use crate::feed::{ChangeFeed, ChangeOp, Checkpoint, EventId};
use crate::transaction::{
    Change, OnConflict, TransactionId, TransactionManager, TransactionStats,
};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A stored aggregate and the number of writes it has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCell {
    pub value: i64,
    pub version: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) tables: HashMap<String, DetailTable>,
    pub(crate) aggregates: BTreeMap<AggregateKey, AggregateCell>,
    pub(crate) processed_events: HashSet<EventId>,
    pub(crate) checkpoints: HashMap<String, Checkpoint>,
    pub(crate) next_detail_id: u64,
}

impl StoreState {
    fn table_mut(&mut self, collection: &str, config: &StoreConfig) -> &mut DetailTable {
        self.tables
            .entry(collection.to_string())
            .or_insert_with(|| {
                DetailTable::new(collection, config.index_owners, config.index_subjects)
            })
    }

    fn locate(&self, id: DetailId) -> Option<&DetailTable> {
        self.tables.values().find(|table| table.get(id).is_some())
    }

    fn count(&self, collection: &str, role: OwnerRole, entity: &EntityId) -> u64 {
        self.tables
            .get(collection)
            .map(|table| table.count(role, entity))
            .unwrap_or(0)
    }

    fn allocate_id(&mut self) -> DetailId {
        self.next_detail_id += 1;
        DetailId(self.next_detail_id)
    }

    fn materialize(&mut self, detail: NewDetail) -> DetailRecord {
        DetailRecord {
            id: self.allocate_id(),
            collection: detail.collection,
            owner: detail.owner,
            subject: detail.subject,
            payload: detail.payload,
            created_at: Utc::now(),
        }
    }
}

/// Reverse of one applied change.
enum Undo {
    RemoveDetail { collection: String, id: DetailId },
    RestoreDetail { record: DetailRecord },
    RestoreAggregate {
        key: AggregateKey,
        previous: Option<AggregateCell>,
    },
    ReleaseClaim { event_id: EventId },
}

/// In-memory [`RecordStore`].
///
/// All state sits behind one lock, so every operation and every commit is atomic and a write
/// is visible to the next read. Committed detail changes are published to the change feed
/// in commit order.
pub struct InMemoryRecordStore {
    state: RwLock<StoreState>,
    transactions: TransactionManager,
    feed: ChangeFeed,
    faults: Arc<FaultInjector>,
    config: StoreConfig,
}

impl InMemoryRecordStore {
    pub fn new(config: StoreConfig, feed: ChangeFeed, faults: Arc<FaultInjector>) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            transactions: TransactionManager::new(),
            feed,
            faults,
            config,
        }
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn transaction_stats(&self) -> TransactionStats {
        self.transactions.stats()
    }

    pub async fn active_transactions(&self) -> usize {
        self.transactions.active_count().await
    }

    /// Number of detail records in `collection`.
    pub async fn detail_count(&self, collection: &str) -> usize {
        let state = self.state.read().await;
        state.tables.get(collection).map(|t| t.len()).unwrap_or(0)
    }

    /// Capture the full store state.
    pub async fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.read().await;
        StoreSnapshot::capture(&state, self.feed.head().await)
    }

    /// Replace the store state with `snapshot`.
    ///
    /// Change events are not part of a snapshot: the feed resumes at the recorded head, so a
    /// listener whose checkpoint lags behind sees a gap.
    pub async fn restore(&self, snapshot: StoreSnapshot) -> Result<()> {
        let feed_head = snapshot.feed_head;
        let mut restored = snapshot.into_state()?;
        for table in restored.tables.values_mut() {
            table.rebuild_indexes();
        }
        let mut state = self.state.write().await;
        *state = restored;
        self.feed.resume_at(feed_head).await;
        debug!("store restored at feed head {}", feed_head);
        Ok(())
    }

    async fn io_pause(&self) {
        if let Some(latency) = self.config.operation_latency() {
            tokio::time::sleep(latency).await;
        }
    }

    fn detail_fault(&self) -> Result<()> {
        if self.faults.should_fail(FaultPoint::DetailWrite)? {
            return Err(TallyError::DetailWriteFailure(
                "injected fault at detail-write".into(),
            ));
        }
        Ok(())
    }

    fn aggregate_fault(&self, key: &AggregateKey) -> Result<()> {
        if self.faults.should_fail(FaultPoint::AggregateWrite)? {
            return Err(TallyError::AggregateWriteFailure {
                owner: key.owner.clone(),
                field: key.field.clone(),
                reason: "injected fault at aggregate-write".into(),
            });
        }
        Ok(())
    }

    async fn publish(&self, op: ChangeOp, records: &[DetailRecord]) {
        for record in records {
            if let Err(err) = self.feed.publish(op, record.clone()).await {
                warn!("failed to publish {} of {}: {}", op, record.id, err);
            }
        }
    }

    fn apply_change(
        &self,
        state: &mut StoreState,
        change: &Change,
        undo: &mut Vec<Undo>,
        summary: &mut CommitSummary,
    ) -> Result<()> {
        match change {
            Change::InsertDetail {
                detail,
                on_conflict,
            } => {
                self.detail_fault()?;
                let unique = detail.is_unique();
                if let (true, Some(subject)) = (unique, detail.subject.as_ref()) {
                    let existing = state
                        .tables
                        .get(&detail.collection)
                        .and_then(|table| table.find_unique(&detail.owner, subject))
                        .map(|record| record.id);
                    if let Some(existing) = existing {
                        return match on_conflict {
                            OnConflict::Ignore => {
                                summary.skipped.push(existing);
                                Ok(())
                            }
                            OnConflict::Fail => Err(TallyError::DetailWriteFailure(format!(
                                "unique constraint violation in '{}': {} -> {} already recorded",
                                detail.collection, detail.owner, subject
                            ))),
                        };
                    }
                }
                let record = state.materialize(detail.clone());
                let collection = record.collection.clone();
                state
                    .table_mut(&collection, &self.config)
                    .insert(record.clone(), unique)?;
                undo.push(Undo::RemoveDetail {
                    collection,
                    id: record.id,
                });
                summary.inserted.push(record);
                Ok(())
            }
            Change::DeleteDetail { id } => {
                self.detail_fault()?;
                let collection = state
                    .locate(*id)
                    .map(|table| table.name().to_string())
                    .ok_or(TallyError::DetailNotFound(*id))?;
                let record = state
                    .table_mut(&collection, &self.config)
                    .remove(*id)
                    .ok_or(TallyError::DetailNotFound(*id))?;
                undo.push(Undo::RestoreDetail {
                    record: record.clone(),
                });
                summary.deleted.push(record);
                Ok(())
            }
            Change::AdjustAggregate { key, delta } => {
                self.aggregate_fault(key)?;
                let value = Self::write_cell(state, key, undo, |current| current + delta);
                summary.aggregates.insert(key.clone(), value);
                Ok(())
            }
            Change::SetAggregate { key, value } => {
                self.aggregate_fault(key)?;
                let value = Self::write_cell(state, key, undo, |_| *value);
                summary.aggregates.insert(key.clone(), value);
                Ok(())
            }
            Change::RecountAggregate {
                key,
                collection,
                role,
            } => {
                self.aggregate_fault(key)?;
                let count = state.count(collection, *role, &key.owner);
                let previous = state.aggregates.get(key).map(|c| c.value).unwrap_or(0);
                let value = Self::write_cell(state, key, undo, |_| count as i64);
                summary.aggregates.insert(key.clone(), value);
                summary.recounted.push(Recount {
                    key: key.clone(),
                    previous,
                    count,
                });
                Ok(())
            }
            Change::ClaimEvent { event_id } => {
                if !state.processed_events.insert(*event_id) {
                    return Err(TallyError::EventAlreadyClaimed(event_id.to_string()));
                }
                undo.push(Undo::ReleaseClaim {
                    event_id: *event_id,
                });
                Ok(())
            }
        }
    }

    fn write_cell(
        state: &mut StoreState,
        key: &AggregateKey,
        undo: &mut Vec<Undo>,
        next: impl FnOnce(i64) -> i64,
    ) -> i64 {
        let previous = state.aggregates.get(key).copied();
        undo.push(Undo::RestoreAggregate {
            key: key.clone(),
            previous,
        });
        let cell = state.aggregates.entry(key.clone()).or_default();
        cell.value = next(cell.value);
        cell.version += 1;
        cell.value
    }

    fn undo_all(&self, state: &mut StoreState, undo: Vec<Undo>) {
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::RemoveDetail { collection, id } => {
                    if let Some(table) = state.tables.get_mut(&collection) {
                        table.remove(id);
                    }
                }
                Undo::RestoreDetail { record } => {
                    let unique = record.is_unique();
                    let collection = record.collection.clone();
                    if let Err(err) = state
                        .table_mut(&collection, &self.config)
                        .insert(record, unique)
                    {
                        warn!("undo failed to restore detail: {}", err);
                    }
                }
                Undo::RestoreAggregate { key, previous } => match previous {
                    Some(cell) => {
                        state.aggregates.insert(key, cell);
                    }
                    None => {
                        state.aggregates.remove(&key);
                    }
                },
                Undo::ReleaseClaim { event_id } => {
                    state.processed_events.remove(&event_id);
                }
            }
        }
    }

    fn abort(txn: TransactionId, reason: impl Into<String>) -> TallyError {
        TallyError::TransactionAbort {
            txn: txn.as_u64(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create_detail(&self, detail: NewDetail) -> Result<DetailRecord> {
        self.io_pause().await;
        self.detail_fault()?;
        let mut state = self.state.write().await;
        let unique = detail.is_unique();
        let record = state.materialize(detail);
        let collection = record.collection.clone();
        state
            .table_mut(&collection, &self.config)
            .insert(record.clone(), unique)?;
        self.publish(ChangeOp::Insert, std::slice::from_ref(&record))
            .await;
        Ok(record)
    }

    async fn delete_detail(&self, id: DetailId) -> Result<DetailRecord> {
        self.io_pause().await;
        self.detail_fault()?;
        let mut state = self.state.write().await;
        let collection = state
            .locate(id)
            .map(|table| table.name().to_string())
            .ok_or(TallyError::DetailNotFound(id))?;
        let record = state
            .table_mut(&collection, &self.config)
            .remove(id)
            .ok_or(TallyError::DetailNotFound(id))?;
        self.publish(ChangeOp::Delete, std::slice::from_ref(&record))
            .await;
        Ok(record)
    }

    async fn delete_where(
        &self,
        collection: &str,
        role: OwnerRole,
        entity: &EntityId,
    ) -> Result<Vec<DetailRecord>> {
        self.io_pause().await;
        self.detail_fault()?;
        let mut state = self.state.write().await;
        let removed = match state.tables.get_mut(collection) {
            Some(table) => table
                .ids_for(role, entity)
                .into_iter()
                .filter_map(|id| table.remove(id))
                .collect::<Vec<_>>(),
            None => Vec::new(),
        };
        debug!(
            "bulk delete removed {} records from '{}' for {} {}",
            removed.len(),
            collection,
            role,
            entity
        );
        self.publish(ChangeOp::Delete, &removed).await;
        Ok(removed)
    }

    async fn get_detail(&self, id: DetailId) -> Result<Option<DetailRecord>> {
        self.io_pause().await;
        let state = self.state.read().await;
        Ok(state.locate(id).and_then(|table| table.get(id)).cloned())
    }

    async fn find_detail(
        &self,
        collection: &str,
        owner: &EntityId,
        subject: &EntityId,
    ) -> Result<Option<DetailRecord>> {
        self.io_pause().await;
        let state = self.state.read().await;
        Ok(state
            .tables
            .get(collection)
            .and_then(|table| table.find_unique(owner, subject))
            .cloned())
    }

    async fn count_where(
        &self,
        collection: &str,
        role: OwnerRole,
        entity: &EntityId,
    ) -> Result<u64> {
        self.io_pause().await;
        let state = self.state.read().await;
        Ok(state.count(collection, role, entity))
    }

    async fn count_plan(&self, collection: &str, role: OwnerRole) -> Result<CountPlan> {
        let state = self.state.read().await;
        Ok(match state.tables.get(collection) {
            Some(table) => table.plan(role),
            None => DetailTable::new(
                collection,
                self.config.index_owners,
                self.config.index_subjects,
            )
            .plan(role),
        })
    }

    async fn owners(&self, collection: &str, role: OwnerRole) -> Result<Vec<EntityId>> {
        self.io_pause().await;
        let state = self.state.read().await;
        Ok(state
            .tables
            .get(collection)
            .map(|table| table.referenced(role).into_iter().collect())
            .unwrap_or_default())
    }

    async fn read_aggregate(&self, key: &AggregateKey) -> Result<i64> {
        self.io_pause().await;
        let state = self.state.read().await;
        Ok(state.aggregates.get(key).map(|cell| cell.value).unwrap_or(0))
    }

    async fn increment_aggregate(&self, key: &AggregateKey, delta: i64) -> Result<i64> {
        self.io_pause().await;
        self.aggregate_fault(key)?;
        let mut state = self.state.write().await;
        let cell = state.aggregates.entry(key.clone()).or_default();
        cell.value += delta;
        cell.version += 1;
        Ok(cell.value)
    }

    async fn write_aggregate(&self, key: &AggregateKey, value: i64) -> Result<()> {
        self.io_pause().await;
        self.aggregate_fault(key)?;
        let mut state = self.state.write().await;
        let cell = state.aggregates.entry(key.clone()).or_default();
        cell.value = value;
        cell.version += 1;
        Ok(())
    }

    async fn aggregate_values(&self, field: &CounterName) -> Result<Vec<(EntityId, i64)>> {
        self.io_pause().await;
        let state = self.state.read().await;
        Ok(state
            .aggregates
            .iter()
            .filter(|(key, _)| &key.field == field)
            .map(|(key, cell)| (key.owner.clone(), cell.value))
            .collect())
    }

    async fn begin(&self) -> Result<TransactionId> {
        Ok(self.transactions.begin().await)
    }

    async fn read_aggregate_in(&self, txn: TransactionId, key: &AggregateKey) -> Result<i64> {
        self.io_pause().await;
        let cell = {
            let state = self.state.read().await;
            state.aggregates.get(key).copied().unwrap_or_default()
        };
        self.transactions
            .record_read(txn, key.clone(), cell.version)
            .await?;
        Ok(cell.value)
    }

    async fn stage(&self, txn: TransactionId, change: Change) -> Result<()> {
        self.transactions.record_change(txn, change).await
    }

    async fn commit(&self, txn: TransactionId) -> Result<CommitSummary> {
        self.io_pause().await;
        let transaction = self.transactions.take_for_commit(txn).await?;

        if self.faults.should_fail(FaultPoint::Commit)? {
            self.transactions.finish(transaction, false).await?;
            return Err(Self::abort(txn, "injected fault at commit"));
        }

        let mut state = self.state.write().await;

        if self.config.isolation == IsolationLevel::Serializable {
            let stale = transaction.read_set().iter().find(|(key, version)| {
                state.aggregates.get(*key).map(|c| c.version).unwrap_or(0) != **version
            });
            if let Some((key, _)) = stale {
                let reason = TallyError::WriteConflict(format!(
                    "{} changed since it was read",
                    key
                ))
                .to_string();
                drop(state);
                self.transactions.mark_conflict(txn).await;
                self.transactions.finish(transaction, false).await?;
                debug!("{} refused: {}", txn, reason);
                return Err(Self::abort(txn, reason));
            }
        }

        let mut undo = Vec::new();
        let mut summary = CommitSummary::new(txn);
        for change in transaction.changes() {
            if let Err(err) = self.apply_change(&mut state, change, &mut undo, &mut summary) {
                self.undo_all(&mut state, undo);
                drop(state);
                self.transactions.finish(transaction, false).await?;
                debug!("{} rolled back: {}", txn, err);
                return Err(match err {
                    claimed @ TallyError::EventAlreadyClaimed(_) => claimed,
                    other => Self::abort(txn, other.to_string()),
                });
            }
        }

        self.publish(ChangeOp::Insert, &summary.inserted).await;
        self.publish(ChangeOp::Delete, &summary.deleted).await;
        drop(state);
        self.transactions.finish(transaction, true).await?;
        debug!(
            "{} committed: {} inserted, {} deleted, {} aggregates",
            txn,
            summary.inserted.len(),
            summary.deleted.len(),
            summary.aggregates.len()
        );

        if self.faults.should_fail(FaultPoint::CommitAckLost)? {
            return Err(TallyError::Timeout(format!(
                "acknowledgement for {} lost",
                txn
            )));
        }
        Ok(summary)
    }

    async fn rollback(&self, txn: TransactionId) -> Result<()> {
        if self.transactions.rollback(txn).await? {
            debug!("{} rolled back by caller", txn);
        }
        Ok(())
    }

    async fn is_event_processed(&self, event_id: EventId) -> Result<bool> {
        self.io_pause().await;
        let state = self.state.read().await;
        Ok(state.processed_events.contains(&event_id))
    }

    async fn processed_events(&self) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state.processed_events.len())
    }

    async fn load_checkpoint(&self, name: &str) -> Result<Option<Checkpoint>> {
        let state = self.state.read().await;
        Ok(state.checkpoints.get(name).copied())
    }

    async fn save_checkpoint(&self, name: &str, checkpoint: Checkpoint) -> Result<()> {
        let mut state = self.state.write().await;
        state.checkpoints.insert(name.to_string(), checkpoint);
        Ok(())
    }
}
