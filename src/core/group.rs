use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::photo::PhotoRecord;

/// A cluster of near-duplicate photos produced by the analyzer. The atomic
/// unit of bookkeeping: a group is wholly processed or wholly unprocessed,
/// never anything in between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityGroup {
    pub id: String,
    pub photo_ids: Vec<String>,
    pub processed: bool,
}

impl SimilarityGroup {
    pub fn new(photo_ids: Vec<String>) -> Self {
        Self {
            id: format!("grp_{}", Uuid::new_v4().simple()),
            photo_ids,
            processed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.photo_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.photo_ids.is_empty()
    }
}

/// The materialized photos for one or more whole groups, served for a single
/// review pass and later fed back to `mark_groups_processed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupBatch {
    pub group_ids: Vec<String>,
    pub photos: Vec<PhotoRecord>,
}

impl CleanupBatch {
    pub fn photo_count(&self) -> usize {
        self.photos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.group_ids.is_empty()
    }
}
