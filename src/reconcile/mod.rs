//! Reading counters from the records, and bringing stored counters back in line with them.

pub mod counter;
pub mod drift;
pub mod worker;

pub use counter::OnDemandCounter;
pub use drift::{CounterReading, Drift, DriftDetector, DriftReport, RepairMode};
pub use worker::{ReconcilerWorker, spawn_reconciler};
