// Persists the (group-ids-in-batch, index) pair needed to resume a review
// batch mid-way after an interruption. At most one live checkpoint per
// collection; writes are last-write-wins.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::catalog::GroupCatalog;
use crate::core::group::CleanupBatch;
use crate::core::photo::PhotoRecord;

const KEY_PREFIX: &str = "checkpoint/";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Checkpoint storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The persisted resume point for one collection's in-progress batch: the
/// whole groups the batch was built from and an index into its flattened
/// photo sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub collection_id: String,
    pub group_ids: Vec<String>,
    pub index: usize,
    pub saved_at: String,
}

impl CheckpointRecord {
    pub fn new(collection_id: &str, group_ids: &[String], index: usize) -> Self {
        Self {
            collection_id: collection_id.to_string(),
            group_ids: group_ids.to_vec(),
            index,
            saved_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Checkpoint persistence on an embedded sled KV store. Debouncing of
/// high-frequency saves is the caller's concern; the store itself only
/// guarantees that rapid sequential writes never corrupt the record.
pub struct CheckpointStore {
    db: sled::Db,
}

impl CheckpointStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// An in-memory store backed by a temporary sled db. Used in tests and
    /// by callers that do not want resume to survive the process.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn save(&self, record: &CheckpointRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(record)?;
        self.db.insert(Self::key(&record.collection_id), bytes)?;
        Ok(())
    }

    /// Load the raw record for a collection. Malformed persisted bytes are
    /// treated as absence, never surfaced as an error.
    pub fn load(&self, collection_id: &str) -> Result<Option<CheckpointRecord>, StoreError> {
        let Some(bytes) = self.db.get(Self::key(collection_id))? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                log::warn!(
                    "Discarding malformed checkpoint for {}: {}",
                    collection_id,
                    err
                );
                self.db.remove(Self::key(collection_id))?;
                Ok(None)
            }
        }
    }

    pub fn clear(&self, collection_id: &str) -> Result<(), StoreError> {
        self.db.remove(Self::key(collection_id))?;
        Ok(())
    }

    /// Re-resolve the persisted checkpoint against the current catalog and
    /// photo list. A record referencing a group that no longer exists or is
    /// already processed is stale: it is deleted and `None` is returned. The
    /// saved index is clamped to the re-materialized photo count, since
    /// photo lists can shrink across a restart.
    pub fn checkpoint_batch(
        &self,
        catalog: &GroupCatalog,
        collection_id: &str,
        photos: &[PhotoRecord],
    ) -> Result<Option<(CleanupBatch, usize)>, StoreError> {
        let Some(record) = self.load(collection_id)? else {
            return Ok(None);
        };

        let mut groups = Vec::with_capacity(record.group_ids.len());
        for group_id in &record.group_ids {
            match catalog.group(collection_id, group_id) {
                Some(group) if !group.processed => groups.push(group),
                _ => {
                    log::debug!(
                        "Stale checkpoint for {}: group {} missing or processed",
                        collection_id,
                        group_id
                    );
                    self.clear(collection_id)?;
                    return Ok(None);
                }
            }
        }

        let by_id: HashMap<&str, &PhotoRecord> =
            photos.iter().map(|p| (p.id.as_str(), p)).collect();
        let mut materialized = Vec::new();
        for group in &groups {
            for photo_id in &group.photo_ids {
                if let Some(photo) = by_id.get(photo_id.as_str()) {
                    materialized.push((*photo).clone());
                }
            }
        }
        if materialized.is_empty() {
            self.clear(collection_id)?;
            return Ok(None);
        }

        let index = record.index.min(materialized.len() - 1);
        Ok(Some((
            CleanupBatch {
                group_ids: record.group_ids,
                photos: materialized,
            },
            index,
        )))
    }

    fn key(collection_id: &str) -> String {
        format!("{}{}", KEY_PREFIX, collection_id)
    }
}
