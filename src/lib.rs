// ============================================================================
// TallyDB Library
// ============================================================================
//
// Detail records (likes, comments, posts) and the denormalized counters
// derived from them, with the pipelines that try to keep the two in step
// and the tools that measure and repair the difference.
//
// ============================================================================

pub mod config;
pub mod core;
pub mod facade;
pub mod feed;
pub mod harness;
pub mod pipeline;
pub mod reconcile;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use config::{
    AggregateUpdateMode, FeedConfig, IsolationLevel, ReconcilePolicy, RetryPolicy, StoreConfig,
    TallyConfig, TransactionPolicy,
};
pub use core::{
    AggregateKey, CounterName, CounterRegistry, CounterSpec, DetailId, DetailRecord, EntityId,
    NewDetail, OwnerRole, Result, TallyError,
};
pub use facade::TallyDb;
pub use feed::{ChangeEvent, ChangeFeed, ChangeOp, Checkpoint, DedupLock, FeedItem};
pub use pipeline::{
    CounterListener, MutationOutcome, MutationPipeline, MutationState, PipelineKind,
};
pub use reconcile::{Drift, DriftDetector, DriftReport, OnDemandCounter, RepairMode};
pub use storage::{FaultInjector, FaultPoint, InMemoryRecordStore, RecordStore};
pub use transaction::within_transaction;

/// Open a store with the default social counters.
///
/// # Examples
///
/// ```
/// use tallydb::{CounterName, EntityId, NewDetail, MutationPipeline};
///
/// # #[tokio::main]
/// # async fn main() -> tallydb::Result<()> {
/// let db = tallydb::open()?;
///
/// // Write only the like; read the count from the records.
/// db.on_demand().create(NewDetail::like("alice", "post-1")).await?;
/// let liked = db
///     .counter()
///     .count(&CounterName::from("number_of_posts_liked"), &EntityId::from("alice"))
///     .await?;
/// assert_eq!(liked, 1);
/// # Ok(())
/// # }
/// ```
pub fn open() -> Result<TallyDb> {
    TallyDb::open(TallyConfig::default())
}
