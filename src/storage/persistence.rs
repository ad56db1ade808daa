//! Snapshots of the record store on disk.

use super::memory::{AggregateCell, StoreState};
use super::table::DetailTable;
use crate::core::{AggregateKey, Result, TallyError};
use crate::feed::{Checkpoint, EventId};
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const SNAPSHOT_VERSION: u32 = 1;

/// Full store state: detail tables, aggregates, processed event ids and listener checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub tables: HashMap<String, DetailTable>,
    /// Serialized as a list: map keys must be strings in JSON.
    pub aggregates: Vec<(AggregateKey, AggregateCell)>,
    pub processed_events: HashSet<EventId>,
    pub checkpoints: HashMap<String, Checkpoint>,
    pub next_detail_id: u64,
    pub feed_head: Checkpoint,
    pub metadata: SnapshotMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: DateTime<Utc>,
    pub detail_count: usize,
    pub aggregate_count: usize,
}

impl StoreSnapshot {
    pub(crate) fn capture(state: &StoreState, feed_head: Checkpoint) -> Self {
        let detail_count = state.tables.values().map(|t| t.len()).sum();
        Self {
            version: SNAPSHOT_VERSION,
            tables: state.tables.clone(),
            aggregates: state
                .aggregates
                .iter()
                .map(|(key, cell)| (key.clone(), *cell))
                .collect(),
            processed_events: state.processed_events.clone(),
            checkpoints: state.checkpoints.clone(),
            next_detail_id: state.next_detail_id,
            feed_head,
            metadata: SnapshotMetadata {
                created_at: Utc::now(),
                detail_count,
                aggregate_count: state.aggregates.len(),
            },
        }
    }

    pub(crate) fn into_state(self) -> Result<StoreState> {
        if self.version != SNAPSHOT_VERSION {
            return Err(TallyError::Serialization(format!(
                "unsupported snapshot version {}",
                self.version
            )));
        }
        Ok(StoreState {
            tables: self.tables,
            aggregates: self.aggregates.into_iter().collect(),
            processed_events: self.processed_events,
            checkpoints: self.checkpoints,
            next_detail_id: self.next_detail_id,
        })
    }
}

/// Reads and writes a [`StoreSnapshot`] as MessagePack.
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write through a temp file in the same directory and rename it into place.
    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let serialized = rmp_serde::to_vec_named(snapshot).map_err(|e| {
            TallyError::Serialization(format!("Failed to serialize snapshot: {}", e))
        })?;
        let mut temp = NamedTempFile::new_in(&dir)?;
        temp.write_all(&serialized)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .map_err(|e| TallyError::Io(format!("Failed to rename snapshot: {}", e)))?;

        info!(
            "snapshot saved to {} ({} details, {} aggregates)",
            self.path.display(),
            snapshot.metadata.detail_count,
            snapshot.metadata.aggregate_count
        );
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path)?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data).map_err(|e| {
            TallyError::Serialization(format!("Failed to deserialize snapshot: {}", e))
        })?;
        Ok(Some(snapshot))
    }

    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
