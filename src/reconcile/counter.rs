use crate::core::{CounterName, CounterRegistry, EntityId, OwnerRole, Result};
use crate::storage::{CountPlan, RecordStore};
use std::sync::Arc;

/// Answers counter reads by counting detail records at query time.
///
/// There is no stored copy to fall out of step: the result is the number of committed records
/// when the count runs. Each read costs an index lookup, or a scan of the collection when the
/// counted reference is not indexed (see [`plan`](Self::plan)).
#[derive(Clone)]
pub struct OnDemandCounter {
    store: Arc<dyn RecordStore>,
    registry: Arc<CounterRegistry>,
}

impl OnDemandCounter {
    pub fn new(store: Arc<dyn RecordStore>, registry: Arc<CounterRegistry>) -> Self {
        Self { store, registry }
    }

    pub async fn count(&self, field: &CounterName, owner: &EntityId) -> Result<u64> {
        let spec = self.registry.require(field)?;
        self.store.count_where(&spec.collection, spec.role, owner).await
    }

    pub async fn count_where(
        &self,
        collection: &str,
        role: OwnerRole,
        owner: &EntityId,
    ) -> Result<u64> {
        self.store.count_where(collection, role, owner).await
    }

    pub async fn count_many(
        &self,
        field: &CounterName,
        owners: &[EntityId],
    ) -> Result<Vec<(EntityId, u64)>> {
        let spec = self.registry.require(field)?;
        let mut counts = Vec::with_capacity(owners.len());
        for owner in owners {
            let count = self
                .store
                .count_where(&spec.collection, spec.role, owner)
                .await?;
            counts.push((owner.clone(), count));
        }
        Ok(counts)
    }

    /// How a read of `field` is executed.
    pub async fn plan(&self, field: &CounterName) -> Result<CountPlan> {
        let spec = self.registry.require(field)?;
        self.store.count_plan(&spec.collection, spec.role).await
    }
}
