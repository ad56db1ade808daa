use super::engine::CountPlan;
use crate::core::{DetailId, DetailRecord, EntityId, OwnerRole, Result, TallyError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

type ReferenceIndex = BTreeMap<EntityId, BTreeSet<DetailId>>;

/// One collection of detail records (`likes`, `comments`, …).
///
/// Indexes are derived data and are rebuilt after deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailTable {
    name: String,
    rows: BTreeMap<DetailId, DetailRecord>,
    index_owners: bool,
    index_subjects: bool,
    #[serde(skip)]
    owner_index: ReferenceIndex,
    #[serde(skip)]
    subject_index: ReferenceIndex,
    #[serde(skip)]
    unique_index: HashMap<(EntityId, EntityId), DetailId>,
}

impl DetailTable {
    pub fn new(name: impl Into<String>, index_owners: bool, index_subjects: bool) -> Self {
        Self {
            name: name.into(),
            rows: BTreeMap::new(),
            index_owners,
            index_subjects,
            owner_index: BTreeMap::new(),
            subject_index: BTreeMap::new(),
            unique_index: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: DetailId) -> Option<&DetailRecord> {
        self.rows.get(&id)
    }

    pub fn rows(&self) -> impl Iterator<Item = &DetailRecord> {
        self.rows.values()
    }

    /// Existing record for a unique `(owner, subject)` pair.
    pub fn find_unique(&self, owner: &EntityId, subject: &EntityId) -> Option<&DetailRecord> {
        self.unique_index
            .get(&(owner.clone(), subject.clone()))
            .and_then(|id| self.rows.get(id))
    }

    /// Insert a record. `unique` enforces one live record per `(owner, subject)`.
    pub fn insert(&mut self, record: DetailRecord, unique: bool) -> Result<()> {
        if self.rows.contains_key(&record.id) {
            return Err(TallyError::DetailWriteFailure(format!(
                "{} already exists in '{}'",
                record.id, self.name
            )));
        }
        if unique {
            if let Some(subject) = &record.subject {
                let key = (record.owner.clone(), subject.clone());
                if self.unique_index.contains_key(&key) {
                    return Err(TallyError::DetailWriteFailure(format!(
                        "unique constraint violation in '{}': {} -> {} already recorded",
                        self.name, record.owner, subject
                    )));
                }
                self.unique_index.insert(key, record.id);
            }
        }
        self.index_record(&record);
        self.rows.insert(record.id, record);
        Ok(())
    }

    pub fn remove(&mut self, id: DetailId) -> Option<DetailRecord> {
        let record = self.rows.remove(&id)?;
        if let Some(ids) = self.owner_index.get_mut(&record.owner) {
            ids.remove(&id);
            if ids.is_empty() {
                self.owner_index.remove(&record.owner);
            }
        }
        if let Some(subject) = &record.subject {
            if let Some(ids) = self.subject_index.get_mut(subject) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.subject_index.remove(subject);
                }
            }
            let key = (record.owner.clone(), subject.clone());
            if self.unique_index.get(&key) == Some(&id) {
                self.unique_index.remove(&key);
            }
        }
        Some(record)
    }

    /// Ids of every record referencing `entity` in `role`.
    pub fn ids_for(&self, role: OwnerRole, entity: &EntityId) -> Vec<DetailId> {
        match self.index(role) {
            Some(index) => index
                .get(entity)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default(),
            None => self
                .rows
                .values()
                .filter(|record| record.key_for(role) == Some(entity))
                .map(|record| record.id)
                .collect(),
        }
    }

    /// Cardinality of records referencing `entity` in `role`.
    pub fn count(&self, role: OwnerRole, entity: &EntityId) -> u64 {
        match self.index(role) {
            Some(index) => index.get(entity).map(|ids| ids.len() as u64).unwrap_or(0),
            None => self
                .rows
                .values()
                .filter(|record| record.key_for(role) == Some(entity))
                .count() as u64,
        }
    }

    /// Distinct entities referenced in `role`.
    pub fn referenced(&self, role: OwnerRole) -> BTreeSet<EntityId> {
        match self.index(role) {
            Some(index) => index.keys().cloned().collect(),
            None => self
                .rows
                .values()
                .filter_map(|record| record.key_for(role).cloned())
                .collect(),
        }
    }

    pub fn plan(&self, role: OwnerRole) -> CountPlan {
        match self.index(role) {
            Some(_) => CountPlan::IndexLookup {
                collection: self.name.clone(),
                role,
            },
            None => CountPlan::FullScan {
                collection: self.name.clone(),
                role,
                rows: self.rows.len(),
            },
        }
    }

    /// Recompute every index from the rows.
    pub fn rebuild_indexes(&mut self) {
        self.owner_index.clear();
        self.subject_index.clear();
        self.unique_index.clear();
        let records: Vec<DetailRecord> = self.rows.values().cloned().collect();
        for record in &records {
            if let Some(subject) = &record.subject {
                self.unique_index
                    .entry((record.owner.clone(), subject.clone()))
                    .or_insert(record.id);
            }
            self.index_record(record);
        }
    }

    fn index(&self, role: OwnerRole) -> Option<&ReferenceIndex> {
        match role {
            OwnerRole::Owner if self.index_owners => Some(&self.owner_index),
            OwnerRole::Subject if self.index_subjects => Some(&self.subject_index),
            _ => None,
        }
    }

    fn index_record(&mut self, record: &DetailRecord) {
        if self.index_owners {
            self.owner_index
                .entry(record.owner.clone())
                .or_default()
                .insert(record.id);
        }
        if self.index_subjects {
            if let Some(subject) = &record.subject {
                self.subject_index
                    .entry(subject.clone())
                    .or_default()
                    .insert(record.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LIKES;
    use chrono::Utc;

    fn like(id: u64, user: &str, post: &str) -> DetailRecord {
        DetailRecord {
            id: DetailId(id),
            collection: LIKES.to_string(),
            owner: EntityId::from(user),
            subject: Some(EntityId::from(post)),
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_indexed_and_scanned_counts_agree() {
        let mut indexed = DetailTable::new(LIKES, true, true);
        let mut scanned = DetailTable::new(LIKES, false, false);
        for (id, user, post) in [(1, "alice", "p1"), (2, "alice", "p2"), (3, "bob", "p1")] {
            indexed.insert(like(id, user, post), true).unwrap();
            scanned.insert(like(id, user, post), true).unwrap();
        }

        let alice = EntityId::from("alice");
        let p1 = EntityId::from("p1");
        assert_eq!(indexed.count(OwnerRole::Owner, &alice), 2);
        assert_eq!(scanned.count(OwnerRole::Owner, &alice), 2);
        assert_eq!(indexed.count(OwnerRole::Subject, &p1), 2);
        assert_eq!(scanned.count(OwnerRole::Subject, &p1), 2);
        assert!(matches!(indexed.plan(OwnerRole::Owner), CountPlan::IndexLookup { .. }));
        assert!(matches!(
            scanned.plan(OwnerRole::Owner),
            CountPlan::FullScan { rows: 3, .. }
        ));
    }

    #[test]
    fn test_unique_pair_rejected_until_removed() {
        let mut table = DetailTable::new(LIKES, true, true);
        table.insert(like(1, "alice", "p1"), true).unwrap();
        assert!(table.insert(like(2, "alice", "p1"), true).is_err());

        table.remove(DetailId(1)).unwrap();
        assert!(table.insert(like(2, "alice", "p1"), true).is_ok());
        assert_eq!(table.count(OwnerRole::Owner, &EntityId::from("alice")), 1);
    }

    #[test]
    fn test_rebuild_after_roundtrip() {
        let mut table = DetailTable::new(LIKES, true, true);
        table.insert(like(1, "alice", "p1"), true).unwrap();
        let bytes = rmp_serde::to_vec(&table).unwrap();
        let mut restored: DetailTable = rmp_serde::from_slice(&bytes).unwrap();
        restored.rebuild_indexes();

        assert_eq!(restored.count(OwnerRole::Subject, &EntityId::from("p1")), 1);
        assert!(restored
            .find_unique(&EntityId::from("alice"), &EntityId::from("p1"))
            .is_some());
    }
}
