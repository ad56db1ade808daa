// ============================================================================
// Transaction State
// ============================================================================
//
// A transaction collects detail and aggregate changes without applying them.
// The store applies the whole set at commit or drops it. Aggregates read
// inside the transaction are kept with the version they had, so serializable
// commits can refuse a set built on a stale counter.
//
// ============================================================================

use super::Change;
use crate::core::{AggregateKey, Result, TallyError};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static TXN_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Process-wide, strictly increasing transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(TXN_SEQUENCE.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// `Active` until the store settles it as `Committed` or `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        *self == TransactionState::Active
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::Aborted => "aborted",
        })
    }
}

/// Staged changes and observed aggregate versions of one transaction.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    changes: Vec<Change>,
    read_set: HashMap<AggregateKey, u64>,
    began_at: Instant,
}

impl Transaction {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            changes: Vec::new(),
            read_set: HashMap::new(),
            began_at: Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    pub fn read_set(&self) -> &HashMap<AggregateKey, u64> {
        &self.read_set
    }

    pub fn duration(&self) -> Duration {
        self.began_at.elapsed()
    }

    pub fn record_change(&mut self, change: Change) -> Result<()> {
        self.ensure_active("record change")?;
        self.changes.push(change);
        Ok(())
    }

    /// Remember the version an aggregate had when it was first read
    pub fn record_read(&mut self, key: AggregateKey, version: u64) -> Result<()> {
        self.ensure_active("record read")?;
        self.read_set.entry(key).or_insert(version);
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active("commit")?;
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Drop every staged change and read.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_active("rollback")?;
        self.changes.clear();
        self.read_set.clear();
        self.state = TransactionState::Aborted;
        Ok(())
    }

    fn ensure_active(&self, action: &str) -> Result<()> {
        if !self.state.is_active() {
            return Err(TallyError::Execution(format!(
                "{} already {}, cannot {}",
                self.id, self.state, action
            )));
        }
        Ok(())
    }
}
