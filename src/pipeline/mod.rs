//! Mutation pipelines: the ways a create or delete of a detail record can keep (or fail to
//! keep) the materialized counters in step.

pub mod detail_only;
pub mod dual_write;
pub mod listener;
pub mod transactional;

pub use detail_only::DetailOnlyPipeline;
pub use dual_write::DualWritePipeline;
pub use listener::{
    CatchUpReport, CounterListener, CounterListenerWorker, EventOutcome, ListenerStats,
    spawn_counter_listener,
};
pub use transactional::TransactionalPipeline;

use crate::core::{AggregateKey, DetailId, DetailRecord, NewDetail, Result, TallyError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

/// Progress of one create or delete.
///
/// `Pending -> DetailCommitted | DetailFailed`, then `DetailCommitted -> AggregateApplied |
/// AggregateFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationState {
    Pending,
    DetailCommitted,
    DetailFailed,
    AggregateApplied,
    AggregateFailed,
}

impl MutationState {
    pub fn can_advance_to(self, next: MutationState) -> bool {
        use MutationState::*;
        matches!(
            (self, next),
            (Pending, DetailCommitted)
                | (Pending, DetailFailed)
                | (DetailCommitted, AggregateApplied)
                | (DetailCommitted, AggregateFailed)
        )
    }

    pub fn advance(self, next: MutationState) -> Result<MutationState> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(TallyError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationState::Pending => "pending",
            MutationState::DetailCommitted => "detail-committed",
            MutationState::DetailFailed => "detail-failed",
            MutationState::AggregateApplied => "aggregate-applied",
            MutationState::AggregateFailed => "aggregate-failed",
        };
        f.write_str(name)
    }
}

/// Who is responsible for the counters after the detail write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateHandling {
    /// The pipeline writes the counters itself.
    Inline,
    /// A change-feed listener writes them later.
    Deferred,
    /// Nothing is materialized; counts are computed on read.
    Derived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    Create,
    Delete,
}

impl MutationKind {
    pub fn delta(&self) -> i64 {
        match self {
            MutationKind::Create => 1,
            MutationKind::Delete => -1,
        }
    }
}

/// What happened to one mutation, as recorded in the [`MutationJournal`].
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub pipeline: &'static str,
    pub kind: MutationKind,
    pub handling: AggregateHandling,
    pub state: MutationState,
    pub detail: Option<DetailRecord>,
    /// Counters the mutation was meant to adjust.
    pub aggregates: Vec<AggregateKey>,
    pub error: Option<TallyError>,
}

impl MutationOutcome {
    pub fn new(pipeline: &'static str, kind: MutationKind, handling: AggregateHandling) -> Self {
        Self {
            pipeline,
            kind,
            handling,
            state: MutationState::Pending,
            detail: None,
            aggregates: Vec::new(),
            error: None,
        }
    }

    pub fn advance(&mut self, next: MutationState) -> Result<()> {
        self.state = self.state.advance(next)?;
        Ok(())
    }

    pub fn detail_id(&self) -> Option<DetailId> {
        self.detail.as_ref().map(|d| d.id)
    }

    /// Detail and counters agree.
    pub fn is_consistent(&self) -> bool {
        self.state == MutationState::AggregateApplied
    }

    /// Detail committed, counters left to the listener.
    pub fn is_pending(&self) -> bool {
        self.handling == AggregateHandling::Deferred && self.state == MutationState::DetailCommitted
    }

    /// The detail was written but the counters were not, and nothing else will fix them.
    pub fn is_drift(&self) -> bool {
        match self.state {
            MutationState::AggregateFailed => true,
            MutationState::DetailCommitted => self.handling == AggregateHandling::Inline,
            MutationState::Pending
            | MutationState::DetailFailed
            | MutationState::AggregateApplied => false,
        }
    }
}

/// Log of every mutation a set of pipelines ran.
#[derive(Debug, Default)]
pub struct MutationJournal {
    outcomes: Mutex<Vec<MutationOutcome>>,
}

impl MutationJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: MutationOutcome) -> Result<()> {
        self.outcomes.lock()?.push(outcome);
        Ok(())
    }

    pub fn outcomes(&self) -> Result<Vec<MutationOutcome>> {
        Ok(self.outcomes.lock()?.clone())
    }

    pub fn drifted(&self) -> Result<Vec<MutationOutcome>> {
        Ok(self
            .outcomes
            .lock()?
            .iter()
            .filter(|o| o.is_drift())
            .cloned()
            .collect())
    }

    pub fn len(&self) -> usize {
        self.outcomes.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> Result<()> {
        self.outcomes.lock()?.clear();
        Ok(())
    }
}

/// A way of running "create detail" and "delete detail".
#[async_trait]
pub trait MutationPipeline: Send + Sync {
    fn name(&self) -> &'static str;

    fn handling(&self) -> AggregateHandling;

    async fn create(&self, detail: NewDetail) -> Result<MutationOutcome>;

    async fn delete(&self, id: DetailId) -> Result<MutationOutcome>;
}

/// Selects a pipeline by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineKind {
    DualWrite,
    Transactional,
    #[serde(rename = "event")]
    EventDriven,
    #[default]
    OnDemand,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 4] = [
        PipelineKind::DualWrite,
        PipelineKind::Transactional,
        PipelineKind::EventDriven,
        PipelineKind::OnDemand,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::DualWrite => "dual-write",
            PipelineKind::Transactional => "transactional",
            PipelineKind::EventDriven => "event",
            PipelineKind::OnDemand => "on-demand",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineKind {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        PipelineKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                TallyError::Parse(format!(
                    "unknown pipeline '{}' (expected dual-write, transactional, event, on-demand)",
                    s
                ))
            })
    }
}
