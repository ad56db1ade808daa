// ============================================================================
// Staged Changes
// ============================================================================
//
// A transaction collects changes without touching the store. At commit the
// store applies them in order under its write lock, recording an undo entry
// for each one; a failure replays the undo log so no partial state is left.
//
// ============================================================================

use crate::core::{AggregateKey, DetailId, NewDetail, OwnerRole};
use crate::feed::EventId;
use serde::{Deserialize, Serialize};

/// What an insert does when a unique `(owner, subject)` record already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OnConflict {
    /// Abort the transaction.
    #[default]
    Fail,
    /// Keep the existing record and carry on, like `INSERT … ON CONFLICT DO NOTHING`.
    Ignore,
}

/// A single change staged in a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    /// Persist a new detail record
    InsertDetail {
        detail: NewDetail,
        on_conflict: OnConflict,
    },

    /// Remove a detail record
    DeleteDetail { id: DetailId },

    /// Add `delta` to an aggregate at the storage layer
    AdjustAggregate { key: AggregateKey, delta: i64 },

    /// Overwrite an aggregate with a value computed by the caller
    SetAggregate { key: AggregateKey, value: i64 },

    /// Overwrite an aggregate with the count of its detail records, computed at commit
    RecountAggregate {
        key: AggregateKey,
        collection: String,
        role: OwnerRole,
    },

    /// Mark a change event as processed. Commit fails with `EventAlreadyClaimed` when an
    /// earlier transaction already marked it, so the claim lands together with the counter
    /// adjustments or not at all.
    ClaimEvent { event_id: EventId },
}

impl Change {
    pub fn insert(detail: NewDetail) -> Self {
        Change::InsertDetail {
            detail,
            on_conflict: OnConflict::Fail,
        }
    }

    pub fn insert_if_absent(detail: NewDetail) -> Self {
        Change::InsertDetail {
            detail,
            on_conflict: OnConflict::Ignore,
        }
    }

    pub fn adjust(key: AggregateKey, delta: i64) -> Self {
        Change::AdjustAggregate { key, delta }
    }

    /// The aggregate this change writes, if any.
    pub fn aggregate_key(&self) -> Option<&AggregateKey> {
        match self {
            Change::AdjustAggregate { key, .. }
            | Change::SetAggregate { key, .. }
            | Change::RecountAggregate { key, .. } => Some(key),
            Change::InsertDetail { .. }
            | Change::DeleteDetail { .. }
            | Change::ClaimEvent { .. } => None,
        }
    }

    pub fn is_detail_write(&self) -> bool {
        matches!(
            self,
            Change::InsertDetail { .. } | Change::DeleteDetail { .. }
        )
    }

    pub fn is_aggregate_write(&self) -> bool {
        self.aggregate_key().is_some()
    }
}
