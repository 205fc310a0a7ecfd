// In-memory index of duplicate groups per collection and their
// processed/unprocessed status. The group order assigned at analysis time is
// the canonical processing order for the whole engine.

use std::collections::HashMap;

use serde::Serialize;

use crate::core::group::SimilarityGroup;

/// Cleanup state for one collection: the full grouping from the last
/// completed analysis plus per-group processed flags.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionCleanupState {
    pub collection_id: String,
    groups: Vec<SimilarityGroup>,
    stale: bool,
}

impl CollectionCleanupState {
    fn new(collection_id: String, groups: Vec<SimilarityGroup>) -> Self {
        Self {
            collection_id,
            groups,
            stale: false,
        }
    }

    pub fn total_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn remaining_groups(&self) -> usize {
        self.groups.iter().filter(|g| !g.processed).count()
    }

    pub fn total_images(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }

    pub fn remaining_images(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| !g.processed)
            .map(|g| g.len())
            .sum()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }
}

#[derive(Debug, Default)]
pub struct GroupCatalog {
    collections: HashMap<String, CollectionCleanupState>,
}

impl GroupCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the grouping from a completed analysis, fully replacing any
    /// prior state for the collection (never a merge).
    pub fn create(&mut self, collection_id: &str, groups: Vec<SimilarityGroup>) {
        log::info!(
            "catalog created for {}: {} groups, {} images",
            collection_id,
            groups.len(),
            groups.iter().map(|g| g.len()).sum::<usize>()
        );
        self.collections.insert(
            collection_id.to_string(),
            CollectionCleanupState::new(collection_id.to_string(), groups),
        );
    }

    /// Mark groups processed. Idempotent: ids already processed and ids the
    /// catalog has never seen are silently ignored. Returns the ids of the
    /// collections whose state actually changed.
    pub fn mark_processed(&mut self, group_ids: &[String]) -> Vec<String> {
        let mut affected = Vec::new();
        for state in self.collections.values_mut() {
            let mut changed = false;
            for group in state.groups.iter_mut() {
                if !group.processed && group_ids.contains(&group.id) {
                    group.processed = true;
                    changed = true;
                }
            }
            if changed {
                affected.push(state.collection_id.clone());
            }
        }
        affected
    }

    /// Unprocessed groups in analysis order. Empty for unknown collections.
    pub fn unprocessed_groups(&self, collection_id: &str) -> Vec<&SimilarityGroup> {
        self.collections
            .get(collection_id)
            .map(|state| state.groups.iter().filter(|g| !g.processed).collect())
            .unwrap_or_default()
    }

    pub fn group(&self, collection_id: &str, group_id: &str) -> Option<&SimilarityGroup> {
        self.collections
            .get(collection_id)?
            .groups
            .iter()
            .find(|g| g.id == group_id)
    }

    pub fn is_unprocessed(&self, collection_id: &str, group_id: &str) -> bool {
        self.group(collection_id, group_id)
            .map(|g| !g.processed)
            .unwrap_or(false)
    }

    pub fn total_groups(&self, collection_id: &str) -> usize {
        self.collections
            .get(collection_id)
            .map(CollectionCleanupState::total_groups)
            .unwrap_or(0)
    }

    pub fn remaining_groups(&self, collection_id: &str) -> usize {
        self.collections
            .get(collection_id)
            .map(CollectionCleanupState::remaining_groups)
            .unwrap_or(0)
    }

    pub fn total_images(&self, collection_id: &str) -> usize {
        self.collections
            .get(collection_id)
            .map(CollectionCleanupState::total_images)
            .unwrap_or(0)
    }

    pub fn remaining_images(&self, collection_id: &str) -> usize {
        self.collections
            .get(collection_id)
            .map(CollectionCleanupState::remaining_images)
            .unwrap_or(0)
    }

    /// Clear every processed flag and mark the state stale so the next
    /// `enter_collection` re-analyzes. Counters keep answering from the last
    /// analysis until the replacement lands.
    pub fn reset(&mut self, collection_id: &str) {
        if let Some(state) = self.collections.get_mut(collection_id) {
            for group in state.groups.iter_mut() {
                group.processed = false;
            }
            state.stale = true;
            log::info!("catalog reset for {}", collection_id);
        }
    }

    /// Whether the collection has usable (analyzed, not reset) state.
    pub fn is_fresh(&self, collection_id: &str) -> bool {
        self.collections
            .get(collection_id)
            .map(|state| !state.stale)
            .unwrap_or(false)
    }
}
