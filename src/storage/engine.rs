use crate::core::{
    AggregateKey, CounterName, DetailId, DetailRecord, EntityId, NewDetail, OwnerRole, Result,
};
use crate::feed::{Checkpoint, EventId};
use crate::transaction::{Change, TransactionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How the store answers a count query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountPlan {
    /// O(matching records) through an index on the counted reference.
    IndexLookup { collection: String, role: OwnerRole },
    /// O(rows) scan of the whole collection.
    FullScan {
        collection: String,
        role: OwnerRole,
        rows: usize,
    },
}

impl CountPlan {
    pub fn is_indexed(&self) -> bool {
        matches!(self, CountPlan::IndexLookup { .. })
    }
}

impl fmt::Display for CountPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountPlan::IndexLookup { collection, role } => {
                write!(f, "Index Lookup on {}.{}", collection, role)
            }
            CountPlan::FullScan {
                collection,
                role,
                rows,
            } => write!(f, "Full Scan of {} by {} ({} rows)", collection, role, rows),
        }
    }
}

/// An aggregate overwritten by a recount, with the value it held before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recount {
    pub key: AggregateKey,
    pub previous: i64,
    pub count: u64,
}

/// What a committed transaction did.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitSummary {
    pub txn: TransactionId,
    pub inserted: Vec<DetailRecord>,
    /// Inserts that found an existing unique record and were ignored.
    pub skipped: Vec<DetailId>,
    pub deleted: Vec<DetailRecord>,
    /// Final value of every aggregate the transaction wrote.
    pub aggregates: BTreeMap<AggregateKey, i64>,
    pub recounted: Vec<Recount>,
}

impl CommitSummary {
    pub fn new(txn: TransactionId) -> Self {
        Self {
            txn,
            inserted: Vec::new(),
            skipped: Vec::new(),
            deleted: Vec::new(),
            aggregates: BTreeMap::new(),
            recounted: Vec::new(),
        }
    }
}

/// Storage consumed by the pipelines, the listener and the reconciler.
///
/// Detail records are the source of truth. Aggregates are plain numbers the store does not
/// derive; keeping them equal to the matching record counts is the caller's problem.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a detail record outside any transaction.
    async fn create_detail(&self, detail: NewDetail) -> Result<DetailRecord>;

    /// Remove a detail record outside any transaction.
    async fn delete_detail(&self, id: DetailId) -> Result<DetailRecord>;

    /// Remove every record referencing `entity` in `role` in one call, without touching any
    /// aggregate. Models bulk clean-ups and manual fixes that bypass the mutation pipeline.
    async fn delete_where(
        &self,
        collection: &str,
        role: OwnerRole,
        entity: &EntityId,
    ) -> Result<Vec<DetailRecord>>;

    async fn get_detail(&self, id: DetailId) -> Result<Option<DetailRecord>>;

    /// The unique record for `(owner, subject)` in `collection`, if one exists.
    async fn find_detail(
        &self,
        collection: &str,
        owner: &EntityId,
        subject: &EntityId,
    ) -> Result<Option<DetailRecord>>;

    /// Number of committed records in `collection` referencing `entity` in `role`.
    async fn count_where(&self, collection: &str, role: OwnerRole, entity: &EntityId)
        -> Result<u64>;

    async fn count_plan(&self, collection: &str, role: OwnerRole) -> Result<CountPlan>;

    /// Every entity referenced in `role` by at least one record of `collection`.
    async fn owners(&self, collection: &str, role: OwnerRole) -> Result<Vec<EntityId>>;

    /// Stored aggregate value; zero when it was never written.
    async fn read_aggregate(&self, key: &AggregateKey) -> Result<i64>;

    /// Atomically add `delta` and return the new value.
    async fn increment_aggregate(&self, key: &AggregateKey, delta: i64) -> Result<i64>;

    /// Overwrite the aggregate with `value`.
    async fn write_aggregate(&self, key: &AggregateKey, value: i64) -> Result<()>;

    /// Every stored value of `field`.
    async fn aggregate_values(&self, field: &CounterName) -> Result<Vec<(EntityId, i64)>>;

    async fn begin(&self) -> Result<TransactionId>;

    /// Read an aggregate inside `txn`, remembering its version for commit-time validation.
    async fn read_aggregate_in(&self, txn: TransactionId, key: &AggregateKey) -> Result<i64>;

    /// Stage a change; nothing is visible until commit.
    async fn stage(&self, txn: TransactionId, change: Change) -> Result<()>;

    /// Apply every staged change or none of them.
    async fn commit(&self, txn: TransactionId) -> Result<CommitSummary>;

    /// Discard `txn`. Rolling back a settled transaction is a no-op.
    async fn rollback(&self, txn: TransactionId) -> Result<()>;

    /// True once a committed transaction has claimed `event_id` with `Change::ClaimEvent`.
    async fn is_event_processed(&self, event_id: EventId) -> Result<bool>;

    async fn processed_events(&self) -> Result<usize>;

    async fn load_checkpoint(&self, name: &str) -> Result<Option<Checkpoint>>;

    async fn save_checkpoint(&self, name: &str, checkpoint: Checkpoint) -> Result<()>;
}
