use crate::core::DetailRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Delete,
    Update,
}

impl ChangeOp {
    /// Effect of this operation on a count of matching records.
    pub fn delta(&self) -> i64 {
        match self {
            ChangeOp::Insert => 1,
            ChangeOp::Delete => -1,
            ChangeOp::Update => 0,
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOp::Insert => write!(f, "insert"),
            ChangeOp::Delete => write!(f, "delete"),
            ChangeOp::Update => write!(f, "update"),
        }
    }
}

/// A committed change to a detail record, as seen by feed subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_id: EventId,
    /// Position in the feed; strictly increasing across all collections.
    pub seq: u64,
    pub collection: String,
    pub op: ChangeOp,
    pub detail: DetailRecord,
    pub published_at: DateTime<Utc>,
}

/// Resume position in the change feed: the sequence number of the next event to read.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Checkpoint(pub u64);

impl Checkpoint {
    pub const BEGINNING: Checkpoint = Checkpoint(0);

    pub fn after(event: &ChangeEvent) -> Self {
        Checkpoint(event.seq + 1)
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Events a subscriber can never receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedGap {
    /// Sequence number the subscriber expected next.
    pub expected: u64,
    /// Sequence number delivery resumed at.
    pub resumed_at: u64,
}

impl FeedGap {
    pub fn missed(&self) -> u64 {
        self.resumed_at.saturating_sub(self.expected)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Event(ChangeEvent),
    Gap(FeedGap),
}
