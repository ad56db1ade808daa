use crate::core::{CounterRegistry, CounterSpec, Result, TallyError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Isolation the record store provides to transactional units.
///
/// Which level a production store actually runs at is an assumption the application has to
/// state, so it is configuration rather than a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Reads see the latest committed value; concurrent read-modify-write loses updates.
    #[default]
    ReadCommitted,
    /// Aggregates read inside a transaction are validated at commit.
    Serializable,
}

/// How a pipeline changes a materialized aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregateUpdateMode {
    /// `UPDATE … SET n = n + 1` at the storage layer.
    #[default]
    AtomicIncrement,
    /// Read the value in the application, add one, write it back.
    ReadModifyWrite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub isolation: IsolationLevel,
    /// Maintain an index on the owner reference of every collection.
    pub index_owners: bool,
    /// Maintain an index on the subject reference of every collection.
    pub index_subjects: bool,
    /// Artificial latency added to every store operation, modelling blocking I/O.
    pub operation_latency_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            index_owners: true,
            index_subjects: true,
            operation_latency_ms: None,
        }
    }
}

impl StoreConfig {
    pub fn operation_latency(&self) -> Option<Duration> {
        self.operation_latency_ms.map(Duration::from_millis)
    }
}

/// Configuration for retry behavior on aborted transactions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 250,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Exponential backoff before attempt `attempt + 1`, capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

/// Bounds on a transactional unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransactionPolicy {
    /// A unit that does not commit within this many milliseconds is rolled back.
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for TransactionPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl TransactionPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct FeedConfig {
    /// Number of events kept in the change log. `None` keeps everything.
    pub retention: Option<usize>,
    /// Whether the deployment assumes the feed never drops events during listener downtime.
    pub assume_durable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcilePolicy {
    /// Interval between scheduled reconciliation passes.
    pub interval_ms: u64,
    /// Overwrite mismatched aggregates with the true count.
    pub repair: bool,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            repair: true,
        }
    }
}

impl ReconcilePolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Top-level configuration.
///
/// ```
/// use tallydb::TallyConfig;
///
/// let config = TallyConfig::default()
///     .transaction_timeout_ms(500)
///     .feed_retention(1_000);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TallyConfig {
    pub store: StoreConfig,
    pub transaction: TransactionPolicy,
    pub feed: FeedConfig,
    pub reconcile: ReconcilePolicy,
    pub counters: Vec<CounterSpec>,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            transaction: TransactionPolicy::default(),
            feed: FeedConfig::default(),
            reconcile: ReconcilePolicy::default(),
            counters: CounterRegistry::social().specs().to_vec(),
        }
    }
}

impl TallyConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TallyError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            TallyError::Config(format!("failed to read '{}': {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transaction.retry.max_attempts == 0 {
            return Err(TallyError::Config(
                "transaction.retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.transaction.timeout_ms == 0 {
            return Err(TallyError::Config(
                "transaction.timeout_ms must be positive".into(),
            ));
        }
        if self.feed.retention == Some(0) {
            return Err(TallyError::Config("feed.retention must be positive".into()));
        }
        if self.reconcile.interval_ms == 0 {
            return Err(TallyError::Config(
                "reconcile.interval_ms must be positive".into(),
            ));
        }
        let mut seen = HashSet::new();
        for spec in &self.counters {
            if !seen.insert(&spec.field) {
                return Err(TallyError::Config(format!(
                    "counter '{}' is declared twice",
                    spec.field
                )));
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> CounterRegistry {
        CounterRegistry::new(self.counters.clone())
    }

    /// Set the store isolation level
    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.store.isolation = isolation;
        self
    }

    /// Set simulated per-operation latency
    pub fn operation_latency_ms(mut self, millis: u64) -> Self {
        self.store.operation_latency_ms = Some(millis);
        self
    }

    /// Disable the owner and subject indexes
    pub fn without_indexes(mut self) -> Self {
        self.store.index_owners = false;
        self.store.index_subjects = false;
        self
    }

    /// Set transaction timeout
    pub fn transaction_timeout_ms(mut self, millis: u64) -> Self {
        self.transaction.timeout_ms = millis;
        self
    }

    /// Set transaction retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.transaction.retry = retry;
        self
    }

    /// Bound the change log
    pub fn feed_retention(mut self, events: usize) -> Self {
        self.feed.retention = Some(events);
        self
    }

    /// Set reconciliation interval
    pub fn reconcile_interval_ms(mut self, millis: u64) -> Self {
        self.reconcile.interval_ms = millis;
        self
    }

    /// Replace the counter declarations
    pub fn counters(mut self, counters: Vec<CounterSpec>) -> Self {
        self.counters = counters;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OwnerRole;

    #[test]
    fn test_defaults_validate() {
        let config = TallyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.isolation, IsolationLevel::ReadCommitted);
        assert_eq!(config.registry().specs().len(), 5);
    }

    #[test]
    fn test_from_json_partial() {
        let config = TallyConfig::from_json_str(
            r#"{ "store": { "isolation": "serializable" }, "feed": { "retention": 16 } }"#,
        )
        .unwrap();
        assert_eq!(config.store.isolation, IsolationLevel::Serializable);
        assert!(config.store.index_owners);
        assert_eq!(config.feed.retention, Some(16));
        assert_eq!(config.transaction.retry.max_attempts, 3);
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(TallyConfig::default().feed_retention(0).validate().is_err());
        assert!(TallyConfig::default()
            .retry(RetryPolicy {
                max_attempts: 0,
                ..RetryPolicy::default()
            })
            .validate()
            .is_err());

        let duplicated = TallyConfig::default().counters(vec![
            CounterSpec::new("like_count", "likes", OwnerRole::Subject),
            CounterSpec::new("like_count", "likes", OwnerRole::Owner),
        ]);
        assert!(matches!(duplicated.validate(), Err(TallyError::Config(_))));
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(10));
        assert_eq!(retry.backoff(2), Duration::from_millis(20));
        assert_eq!(retry.backoff(6), Duration::from_millis(50));
    }
}
