use crate::config::TransactionPolicy;
use crate::core::{
    AggregateKey, CounterName, CounterRegistry, CounterSpec, EntityId, Result, TallyError,
};
use crate::storage::RecordStore;
use crate::transaction::{Change, within_transaction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepairMode {
    #[default]
    ReportOnly,
    Repair,
}

/// A stored counter that disagrees with its records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drift {
    pub owner: EntityId,
    pub field: CounterName,
    pub stored: i64,
    pub actual: u64,
}

impl Drift {
    pub fn difference(&self) -> i64 {
        self.stored - self.actual as i64
    }

    pub fn to_error(&self) -> TallyError {
        TallyError::DriftDetected {
            owner: self.owner.clone(),
            field: self.field.clone(),
            stored: self.stored,
            actual: self.actual,
        }
    }
}

/// Result of one reconciliation pass over a counter field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub field: CounterName,
    /// Entities compared.
    pub checked: usize,
    pub mismatches: Vec<Drift>,
    /// Entities whose stored value was overwritten with the true count.
    pub repaired: Vec<EntityId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }

    pub fn mismatch_for(&self, owner: &EntityId) -> Option<&Drift> {
        self.mismatches.iter().find(|drift| &drift.owner == owner)
    }
}

/// Stored and true value of one counter on one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterReading {
    pub field: CounterName,
    pub stored: i64,
    pub actual: u64,
}

impl CounterReading {
    pub fn is_consistent(&self) -> bool {
        self.stored == self.actual as i64
    }
}

/// Compares stored counters with record counts and optionally repairs them.
///
/// A repair is a [`Change::RecountAggregate`] committed in its own transaction: the count and
/// the overwrite happen under the store lock, so writers that race with the pass are not lost.
pub struct DriftDetector {
    store: Arc<dyn RecordStore>,
    registry: Arc<CounterRegistry>,
    policy: TransactionPolicy,
}

impl DriftDetector {
    pub fn new(
        store: Arc<dyn RecordStore>,
        registry: Arc<CounterRegistry>,
        policy: TransactionPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
        }
    }

    pub fn registry(&self) -> &Arc<CounterRegistry> {
        &self.registry
    }

    pub async fn detect(&self, field: &CounterName) -> Result<DriftReport> {
        self.reconcile(field, RepairMode::ReportOnly).await
    }

    pub async fn reconcile(&self, field: &CounterName, mode: RepairMode) -> Result<DriftReport> {
        let spec = self.registry.require(field)?.clone();
        let started_at = Utc::now();

        // Entities with a stored value or at least one record.
        let mut owners: BTreeSet<EntityId> = self
            .store
            .aggregate_values(field)
            .await?
            .into_iter()
            .map(|(owner, _)| owner)
            .collect();
        owners.extend(self.store.owners(&spec.collection, spec.role).await?);

        let mut mismatches = Vec::new();
        let mut repaired = Vec::new();
        for owner in &owners {
            let key = AggregateKey::new(owner.clone(), field.clone());
            let stored = self.store.read_aggregate(&key).await?;
            let actual = self
                .store
                .count_where(&spec.collection, spec.role, owner)
                .await?;
            if stored == actual as i64 {
                continue;
            }

            let drift = Drift {
                owner: owner.clone(),
                field: field.clone(),
                stored,
                actual,
            };
            event!(
                Level::WARN,
                owner = %drift.owner,
                field = %drift.field,
                stored = drift.stored,
                actual = drift.actual,
                "counter drift detected"
            );
            if mode == RepairMode::Repair {
                let count = self.repair(&spec, key).await?;
                event!(
                    Level::INFO,
                    owner = %owner,
                    field = %field,
                    from = stored,
                    to = count,
                    "counter repaired"
                );
                repaired.push(owner.clone());
            }
            mismatches.push(drift);
        }

        Ok(DriftReport {
            field: field.clone(),
            checked: owners.len(),
            mismatches,
            repaired,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn repair(&self, spec: &CounterSpec, key: AggregateKey) -> Result<u64> {
        let (_, summary) = within_transaction(&self.store, &self.policy, |store, txn| {
            let change = Change::RecountAggregate {
                key: key.clone(),
                collection: spec.collection.clone(),
                role: spec.role,
            };
            async move { store.stage(txn, change).await }
        })
        .await?;
        Ok(summary
            .recounted
            .first()
            .map(|recount| recount.count)
            .unwrap_or_default())
    }

    /// One pass over every registered counter.
    pub async fn reconcile_all(&self, mode: RepairMode) -> Result<Vec<DriftReport>> {
        let mut reports = Vec::with_capacity(self.registry.specs().len());
        for spec in self.registry.specs() {
            reports.push(self.reconcile(&spec.field, mode).await?);
        }
        Ok(reports)
    }

    /// Every counter `owner` could have, stored next to true.
    pub async fn inspect(&self, owner: &EntityId) -> Result<Vec<CounterReading>> {
        let mut readings = Vec::new();
        for spec in self.registry.specs() {
            let key = AggregateKey::new(owner.clone(), spec.field.clone());
            readings.push(CounterReading {
                field: spec.field.clone(),
                stored: self.store.read_aggregate(&key).await?,
                actual: self
                    .store
                    .count_where(&spec.collection, spec.role, owner)
                    .await?,
            });
        }
        Ok(readings)
    }
}
