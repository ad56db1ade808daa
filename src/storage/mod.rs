pub mod engine;
pub mod fault;
pub mod memory;
pub mod persistence;
pub mod table;

pub use engine::{CommitSummary, CountPlan, RecordStore, Recount};
pub use fault::{FaultInjector, FaultPoint};
pub use memory::{AggregateCell, InMemoryRecordStore};
pub use persistence::{SnapshotFile, StoreSnapshot};
pub use table::DetailTable;
