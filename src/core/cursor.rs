use std::collections::HashMap;

use crate::core::catalog::GroupCatalog;
use crate::core::group::{CleanupBatch, SimilarityGroup};
use crate::core::photo::PhotoRecord;

/// Soft per-batch image cap used when none is configured.
pub const DEFAULT_BATCH_IMAGE_CAP: usize = 30;

/// Turns the ordered set of unprocessed groups into capped-size batches.
/// Groups are never split: the cap is a soft bound, and a non-empty batch
/// always contains at least one whole group even when that group alone
/// exceeds the cap.
#[derive(Debug, Clone)]
pub struct BatchCursor {
    image_cap: usize,
}

impl BatchCursor {
    pub fn new(image_cap: usize) -> Self {
        Self { image_cap }
    }

    pub fn image_cap(&self) -> usize {
        self.image_cap
    }

    /// Next batch of whole groups for the collection, skipping
    /// `exclude_group_ids` (the currently displayed batch, during prefetch).
    /// Returns `None` only when no eligible unprocessed group remains.
    pub fn next_batch(
        &self,
        catalog: &GroupCatalog,
        collection_id: &str,
        photos: &[PhotoRecord],
        exclude_group_ids: &[String],
    ) -> Option<CleanupBatch> {
        let eligible: Vec<SimilarityGroup> = catalog
            .unprocessed_groups(collection_id)
            .into_iter()
            .filter(|g| !exclude_group_ids.contains(&g.id))
            .cloned()
            .collect();
        self.assemble(&eligible, photos)
    }

    /// Greedy whole-group packing over an explicit group slice, in slice
    /// order. Used directly by the prefetch path, which works from a
    /// snapshot instead of the live catalog.
    pub fn assemble(
        &self,
        groups: &[SimilarityGroup],
        photos: &[PhotoRecord],
    ) -> Option<CleanupBatch> {
        let mut selected: Vec<&SimilarityGroup> = Vec::new();
        let mut count = 0usize;
        for group in groups {
            if !selected.is_empty() && count + group.len() > self.image_cap {
                break;
            }
            count += group.len();
            selected.push(group);
        }
        if selected.is_empty() {
            return None;
        }

        // Materialize against the live photo list. Ids that have gone
        // missing (external deletion) are filtered out here; the group's
        // bookkeeping is left untouched.
        let by_id: HashMap<&str, &PhotoRecord> =
            photos.iter().map(|p| (p.id.as_str(), p)).collect();
        let mut materialized = Vec::with_capacity(count);
        for group in &selected {
            for photo_id in &group.photo_ids {
                if let Some(photo) = by_id.get(photo_id.as_str()) {
                    materialized.push((*photo).clone());
                }
            }
        }

        Some(CleanupBatch {
            group_ids: selected.iter().map(|g| g.id.clone()).collect(),
            photos: materialized,
        })
    }
}

impl Default for BatchCursor {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_IMAGE_CAP)
    }
}
