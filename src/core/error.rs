use super::types::{CounterName, DetailId, EntityId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TallyError {
    #[error("Detail write failed: {0}")]
    DetailWriteFailure(String),

    #[error("Aggregate write failed for {owner}.{field}: {reason}")]
    AggregateWriteFailure {
        owner: EntityId,
        field: CounterName,
        reason: String,
    },

    #[error("Transaction {txn} aborted: {reason}")]
    TransactionAbort { txn: u64, reason: String },

    #[error("Drift detected on {owner}.{field}: stored {stored}, actual {actual}")]
    DriftDetected {
        owner: EntityId,
        field: CounterName,
        stored: i64,
        actual: u64,
    },

    /// The event was processed by an earlier commit. Listeners report it as a duplicate.
    #[error("Change event {0} already processed")]
    EventAlreadyClaimed(String),

    #[error("Detail record {0} not found")]
    DetailNotFound(DetailId),

    #[error("Write conflict: {0}")]
    WriteConflict(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid mutation transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Counter '{0}' is not registered")]
    UnknownCounter(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl TallyError {
    /// Errors after which the whole action may be retried without leaving partial state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TallyError::TransactionAbort { .. }
                | TallyError::WriteConflict(_)
                | TallyError::Timeout(_)
        )
    }

    /// Errors that leave the aggregate out of step with its detail records.
    pub fn causes_drift(&self) -> bool {
        matches!(
            self,
            TallyError::AggregateWriteFailure { .. } | TallyError::DriftDetected { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TallyError>;

impl<T> From<std::sync::PoisonError<T>> for TallyError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for TallyError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
