// The cleanup session orchestrator: owns per-collection phase machines,
// drives analysis, serves review batches, prefetches the next one, and
// round-robins across collections once the active one is exhausted. One
// explicit instance, owned by the application's composition root.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::seq::SliceRandom;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::catalog::GroupCatalog;
use crate::core::cursor::BatchCursor;
use crate::core::group::{CleanupBatch, SimilarityGroup};
use crate::core::photo::PhotoRecord;
use crate::services::analyzer::{AnalyzeError, AnalyzeProgress, CollectionAnalyzer};
use crate::store::checkpoint::{CheckpointRecord, CheckpointStore, StoreError};

/// Remaining photos in the active batch at or below which the next batch is
/// speculatively prefetched.
pub const DEFAULT_PREFETCH_THRESHOLD: usize = 3;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Analysis error: {0}")]
    Analyze(#[from] AnalyzeError),

    #[error("Checkpoint store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CollectionPhase {
    Idle,
    Analyzing,
    Browsing,
    Exhausted,
}

/// What the caller reviews next: a batch (with the photo index to resume
/// at), or nothing anywhere.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum NextReview {
    Review {
        collection_id: String,
        batch: CleanupBatch,
        resume_index: usize,
    },
    Exhausted,
}

#[derive(Debug)]
struct ActiveBatch {
    collection_id: String,
    batch: CleanupBatch,
}

#[derive(Default)]
struct SessionState {
    /// Epoch guard: bumped on every reset, exit, and foreground switch. Any
    /// in-flight analysis commit or prefetch result carrying an older value
    /// is discarded instead of applied.
    generation: u64,
    foreground: Option<String>,
    catalog: GroupCatalog,
    photos: HashMap<String, Vec<PhotoRecord>>,
    phases: HashMap<String, CollectionPhase>,
    pool: Vec<String>,
    active: Option<ActiveBatch>,
    prefetched: Option<CleanupBatch>,
    /// Cancellation flags of in-flight analyses, keyed by collection.
    analyses: HashMap<String, Arc<AtomicBool>>,
}

pub struct CleanupSession {
    analyzer: Arc<dyn CollectionAnalyzer>,
    checkpoints: CheckpointStore,
    cursor: BatchCursor,
    prefetch_threshold: usize,
    progress_sender: Option<mpsc::UnboundedSender<AnalyzeProgress>>,
    state: Arc<Mutex<SessionState>>,
}

impl CleanupSession {
    pub fn new(analyzer: Arc<dyn CollectionAnalyzer>, checkpoints: CheckpointStore) -> Self {
        Self {
            analyzer,
            checkpoints,
            cursor: BatchCursor::default(),
            prefetch_threshold: DEFAULT_PREFETCH_THRESHOLD,
            progress_sender: None,
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn with_batch_cap(mut self, image_cap: usize) -> Self {
        self.cursor = BatchCursor::new(image_cap);
        self
    }

    pub fn with_prefetch_threshold(mut self, threshold: usize) -> Self {
        self.prefetch_threshold = threshold;
        self
    }

    pub fn with_progress_sender(mut self, sender: mpsc::UnboundedSender<AnalyzeProgress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    /// Enter a collection for review. Analyzes it if no usable catalog state
    /// exists, then resumes from a valid checkpoint or serves the first
    /// batch. Entering cancels any in-flight work tied to the previously
    /// active collection.
    pub async fn enter_collection(
        &self,
        collection_id: &str,
        photos: Vec<PhotoRecord>,
    ) -> Result<NextReview, SessionError> {
        let pending = {
            let mut s = self.state();
            if let Some(prev) = s.foreground.clone() {
                if prev != collection_id {
                    if let Some(flag) = s.analyses.get(&prev) {
                        flag.store(true, Ordering::SeqCst);
                    }
                }
            }
            s.generation += 1;
            let generation = s.generation;
            s.foreground = Some(collection_id.to_string());
            s.photos.insert(collection_id.to_string(), photos);
            s.active = None;
            s.prefetched = None;

            if s.catalog.is_fresh(collection_id) {
                None
            } else {
                // Never two concurrent analyses of one collection: a stale
                // run is cancelled before the replacement starts.
                if let Some(flag) = s.analyses.get(collection_id) {
                    flag.store(true, Ordering::SeqCst);
                }
                let cancel = Arc::new(AtomicBool::new(false));
                s.analyses.insert(collection_id.to_string(), cancel.clone());
                s.phases
                    .insert(collection_id.to_string(), CollectionPhase::Analyzing);
                Some((generation, cancel))
            }
        };

        if let Some((generation, cancel)) = pending {
            self.run_analysis(collection_id, generation, cancel).await?;
        }
        self.serve_foreground(collection_id)
    }

    /// Called once the active batch's last photo has been disposed of. Marks
    /// its groups processed, clears its checkpoint, then serves the next
    /// batch: a prefetched one when available, a freshly computed one
    /// otherwise, or a batch from a randomly picked pool collection once
    /// this one is exhausted.
    pub fn advance_batch(&self) -> Result<NextReview, SessionError> {
        let retired = {
            let mut s = self.state();
            let retired = s.active.take();
            if let Some(active) = &retired {
                s.catalog.mark_processed(&active.batch.group_ids);
            }
            retired
        };
        if let Some(active) = &retired {
            self.checkpoints.clear(&active.collection_id)?;
        }

        let target = {
            let mut s = self.state();
            let Some(foreground) = s.foreground.clone() else {
                return Ok(NextReview::Exhausted);
            };

            // A prefetched batch is consumed only if every group in it is
            // still unprocessed; anything else is recomputed.
            if let Some(batch) = s.prefetched.take() {
                let valid = batch
                    .group_ids
                    .iter()
                    .all(|g| s.catalog.is_unprocessed(&foreground, g));
                if valid {
                    s.phases
                        .insert(foreground.clone(), CollectionPhase::Browsing);
                    s.active = Some(ActiveBatch {
                        collection_id: foreground.clone(),
                        batch: batch.clone(),
                    });
                    return Ok(NextReview::Review {
                        collection_id: foreground,
                        batch,
                        resume_index: 0,
                    });
                }
                log::debug!("Dropping invalidated prefetched batch for {}", foreground);
            }

            let photos = s.photos.get(&foreground).cloned().unwrap_or_default();
            if let Some(batch) = self.cursor.next_batch(&s.catalog, &foreground, &photos, &[]) {
                s.phases
                    .insert(foreground.clone(), CollectionPhase::Browsing);
                s.active = Some(ActiveBatch {
                    collection_id: foreground.clone(),
                    batch: batch.clone(),
                });
                return Ok(NextReview::Review {
                    collection_id: foreground,
                    batch,
                    resume_index: 0,
                });
            }

            s.phases
                .insert(foreground.clone(), CollectionPhase::Exhausted);
            log::info!("Collection {} exhausted", foreground);

            // Round-robin: a uniform pick among already-analyzed, not-yet-
            // exhausted pool members. Never-analyzed collections are not
            // candidates.
            let candidates: Vec<String> = s
                .pool
                .iter()
                .filter(|id| **id != foreground)
                .filter(|id| s.catalog.is_fresh(id) && s.catalog.remaining_groups(id) > 0)
                .cloned()
                .collect();
            let Some(next) = candidates.choose(&mut rand::thread_rng()).cloned() else {
                log::info!("Round-robin pool exhausted");
                return Ok(NextReview::Exhausted);
            };

            log::info!("Round-robin switching to collection {}", next);
            s.generation += 1; // in-flight prefetch for the old collection is now stale
            s.foreground = Some(next.clone());
            next
        };

        self.serve_foreground(&target)
    }

    /// Speculatively fetch the batch after the active one, excluding its
    /// groups. The result is held in memory only (never persisted, never
    /// marked) and is discarded when a reset, exit, or collection switch
    /// happens before it lands.
    pub fn prefetch(&self) {
        let snapshot = {
            let s = self.state();
            let Some(foreground) = s.foreground.clone() else {
                return;
            };
            let Some(active) = s.active.as_ref() else {
                return;
            };
            if s.prefetched.is_some() {
                return;
            }
            let exclude = active.batch.group_ids.clone();
            let groups: Vec<SimilarityGroup> = s
                .catalog
                .unprocessed_groups(&foreground)
                .into_iter()
                .filter(|g| !exclude.contains(&g.id))
                .cloned()
                .collect();
            let photos = s.photos.get(&foreground).cloned().unwrap_or_default();
            (s.generation, foreground, groups, photos)
        };

        let (generation, foreground, groups, photos) = snapshot;
        let cursor = self.cursor.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let Some(batch) = cursor.assemble(&groups, &photos) else {
                return;
            };
            let mut s = state.lock().unwrap_or_else(PoisonError::into_inner);
            // Stale-response guards: the session may have been reset,
            // exited, or switched to another collection while this ran.
            if s.generation != generation || s.foreground.as_deref() != Some(foreground.as_str())
            {
                log::debug!("Discarding stale prefetch for {}", foreground);
                return;
            }
            if !batch
                .group_ids
                .iter()
                .all(|g| s.catalog.is_unprocessed(&foreground, g))
            {
                log::debug!(
                    "Discarding prefetch for {}: groups processed meanwhile",
                    foreground
                );
                return;
            }
            log::debug!(
                "Prefetched next batch for {} ({} photos)",
                foreground,
                batch.photo_count()
            );
            s.prefetched = Some(batch);
        });
    }

    /// Persist the review position inside the active batch. No-op without a
    /// foreground collection. Also the prefetch trigger: once the remaining
    /// photo count in the active batch drops to the threshold, the next
    /// batch is fetched in the background.
    pub fn save_checkpoint(&self, group_ids: &[String], index: usize) -> Result<(), SessionError> {
        let (foreground, remaining) = {
            let s = self.state();
            let Some(foreground) = s.foreground.clone() else {
                return Ok(());
            };
            let remaining = s
                .active
                .as_ref()
                .map(|a| a.batch.photo_count().saturating_sub(index));
            (foreground, remaining)
        };
        self.checkpoints
            .save(&CheckpointRecord::new(&foreground, group_ids, index))?;
        if remaining.is_some_and(|r| r <= self.prefetch_threshold) {
            self.prefetch();
        }
        Ok(())
    }

    /// Re-resolve a persisted checkpoint against a (possibly rehydrated)
    /// photo list. Stale checkpoints read as absence.
    pub fn get_checkpoint_batch(
        &self,
        collection_id: &str,
        photos: &[PhotoRecord],
    ) -> Result<Option<(CleanupBatch, usize)>, SessionError> {
        let s = self.state();
        Ok(self
            .checkpoints
            .checkpoint_batch(&s.catalog, collection_id, photos)?)
    }

    pub fn clear_checkpoint(&self, collection_id: &str) -> Result<(), SessionError> {
        self.checkpoints.clear(collection_id)?;
        Ok(())
    }

    /// Mark groups processed. Idempotent; unknown ids are ignored. Any
    /// checkpoint referencing a newly processed group dies here, as does an
    /// invalidated prefetched batch.
    pub fn mark_groups_processed(&self, group_ids: &[String]) -> Result<(), SessionError> {
        if group_ids.is_empty() {
            return Ok(());
        }
        let affected = {
            let mut s = self.state();
            let affected = s.catalog.mark_processed(group_ids);
            if let Some(batch) = &s.prefetched {
                if batch.group_ids.iter().any(|g| group_ids.contains(g)) {
                    s.prefetched = None;
                }
            }
            affected
        };
        for collection_id in affected {
            if let Some(record) = self.checkpoints.load(&collection_id)? {
                if record.group_ids.iter().any(|g| group_ids.contains(g)) {
                    self.checkpoints.clear(&collection_id)?;
                }
            }
        }
        Ok(())
    }

    /// Compute the next batch without touching session state. Returns `None`
    /// for unknown or exhausted collections.
    pub fn next_batch(
        &self,
        collection_id: &str,
        photos: &[PhotoRecord],
        exclude_group_ids: &[String],
    ) -> Option<CleanupBatch> {
        let s = self.state();
        self.cursor
            .next_batch(&s.catalog, collection_id, photos, exclude_group_ids)
    }

    pub fn total_groups(&self, collection_id: &str) -> usize {
        self.state().catalog.total_groups(collection_id)
    }

    pub fn remaining_groups(&self, collection_id: &str) -> usize {
        self.state().catalog.remaining_groups(collection_id)
    }

    pub fn total_images(&self, collection_id: &str) -> usize {
        self.state().catalog.total_images(collection_id)
    }

    pub fn remaining_images(&self, collection_id: &str) -> usize {
        self.state().catalog.remaining_images(collection_id)
    }

    pub fn set_round_robin_pool(&self, collection_ids: Vec<String>) {
        self.state().pool = collection_ids;
    }

    pub fn phase(&self, collection_id: &str) -> CollectionPhase {
        self.state()
            .phases
            .get(collection_id)
            .copied()
            .unwrap_or(CollectionPhase::Idle)
    }

    /// Clear all processed flags and the checkpoint for the collection and
    /// force re-analysis on the next `enter_collection`.
    pub fn reset_collection_state(&self, collection_id: &str) -> Result<(), SessionError> {
        {
            let mut s = self.state();
            s.generation += 1;
            if let Some(flag) = s.analyses.remove(collection_id) {
                flag.store(true, Ordering::SeqCst);
            }
            s.catalog.reset(collection_id);
            if s.foreground.as_deref() == Some(collection_id) {
                s.active = None;
                s.prefetched = None;
            }
            s.phases
                .insert(collection_id.to_string(), CollectionPhase::Idle);
        }
        self.checkpoints.clear(collection_id)?;
        Ok(())
    }

    /// Tear down the active in-memory review only. Catalog state and
    /// persisted checkpoints survive, so a later `enter_collection` resumes
    /// exactly where review left off.
    pub fn exit_cleanup_mode(&self) {
        let mut s = self.state();
        s.generation += 1;
        for flag in s.analyses.values() {
            flag.store(true, Ordering::SeqCst);
        }
        s.analyses.clear();
        s.active = None;
        s.prefetched = None;
        s.foreground = None;
        for phase in s.phases.values_mut() {
            if *phase != CollectionPhase::Exhausted {
                *phase = CollectionPhase::Idle;
            }
        }
        log::info!("Cleanup session exited");
    }

    async fn run_analysis(
        &self,
        collection_id: &str,
        generation: u64,
        cancel: Arc<AtomicBool>,
    ) -> Result<(), SessionError> {
        log::info!("Analyzing collection {}", collection_id);
        let photos = self
            .state()
            .photos
            .get(collection_id)
            .cloned()
            .unwrap_or_default();

        let (tx, rx) = mpsc::unbounded_channel();
        self.spawn_progress_forwarder(collection_id, rx);

        let analyzer = self.analyzer.clone();
        let id = collection_id.to_string();
        let flag = cancel.clone();
        let outcome = tokio::task::spawn_blocking(move || analyzer.analyze(&id, &photos, tx, flag))
            .await
            .unwrap_or_else(|err| {
                Err(AnalyzeError::Failed(format!(
                    "analysis task panicked: {}",
                    err
                )))
            });

        let mut s = self.state();
        let ours = s
            .analyses
            .get(collection_id)
            .map(|f| Arc::ptr_eq(f, &cancel))
            .unwrap_or(false);
        match outcome {
            Ok(groups) => {
                if s.generation != generation || s.foreground.as_deref() != Some(collection_id) {
                    // A reset, exit, or collection switch raced this run;
                    // the grouping is dropped uncommitted.
                    log::debug!("Discarding superseded analysis for {}", collection_id);
                    if ours {
                        s.analyses.remove(collection_id);
                        s.phases
                            .insert(collection_id.to_string(), CollectionPhase::Idle);
                    }
                    return Err(SessionError::Analyze(AnalyzeError::Cancelled));
                }
                s.catalog.create(collection_id, groups);
                s.analyses.remove(collection_id);
                Ok(())
            }
            Err(err) => {
                if ours {
                    s.analyses.remove(collection_id);
                    s.phases
                        .insert(collection_id.to_string(), CollectionPhase::Idle);
                }
                log::warn!("Analysis of {} did not complete: {}", collection_id, err);
                Err(SessionError::Analyze(err))
            }
        }
    }

    /// Serve the foreground collection: checkpoint resume first, then the
    /// next batch, then exhaustion.
    fn serve_foreground(&self, collection_id: &str) -> Result<NextReview, SessionError> {
        let mut s = self.state();
        let photos = s.photos.get(collection_id).cloned().unwrap_or_default();

        if let Some((batch, index)) =
            self.checkpoints
                .checkpoint_batch(&s.catalog, collection_id, &photos)?
        {
            log::info!(
                "Resuming {} from checkpoint at photo {}",
                collection_id,
                index
            );
            s.phases
                .insert(collection_id.to_string(), CollectionPhase::Browsing);
            s.active = Some(ActiveBatch {
                collection_id: collection_id.to_string(),
                batch: batch.clone(),
            });
            return Ok(NextReview::Review {
                collection_id: collection_id.to_string(),
                batch,
                resume_index: index,
            });
        }

        if let Some(batch) = self.cursor.next_batch(&s.catalog, collection_id, &photos, &[]) {
            s.phases
                .insert(collection_id.to_string(), CollectionPhase::Browsing);
            s.active = Some(ActiveBatch {
                collection_id: collection_id.to_string(),
                batch: batch.clone(),
            });
            return Ok(NextReview::Review {
                collection_id: collection_id.to_string(),
                batch,
                resume_index: 0,
            });
        }

        s.phases
            .insert(collection_id.to_string(), CollectionPhase::Exhausted);
        log::info!("Collection {} exhausted", collection_id);
        Ok(NextReview::Exhausted)
    }

    fn spawn_progress_forwarder(
        &self,
        collection_id: &str,
        mut rx: mpsc::UnboundedReceiver<f64>,
    ) {
        let Some(sender) = self.progress_sender.clone() else {
            return;
        };
        let collection_id = collection_id.to_string();
        tokio::spawn(async move {
            // Clamp to [0, 1] and never go backwards, whatever the analyzer
            // emits.
            let mut last = 0.0f64;
            while let Some(fraction) = rx.recv().await {
                let fraction = fraction.clamp(0.0, 1.0).max(last);
                last = fraction;
                let update = AnalyzeProgress {
                    collection_id: collection_id.clone(),
                    fraction,
                };
                if sender.send(update).is_err() {
                    break;
                }
            }
        });
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn prefetched_batch(&self) -> Option<CleanupBatch> {
        self.state().prefetched.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::{Duration, Instant};

    fn photos_for(collection_id: &str, count: usize) -> Vec<PhotoRecord> {
        (1..=count)
            .map(|i| PhotoRecord {
                id: format!("{}-p{}", collection_id, i),
                source: format!("photos://{}/{}", collection_id, i),
                captured_at: None,
                collection_id: collection_id.to_string(),
                width: 1920,
                height: 1080,
            })
            .collect()
    }

    fn groups_for(collection_id: &str, sizes: &[usize]) -> Vec<SimilarityGroup> {
        let mut next = 0usize;
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| {
                let photo_ids = (0..*size)
                    .map(|_| {
                        next += 1;
                        format!("{}-p{}", collection_id, next)
                    })
                    .collect();
                SimilarityGroup {
                    id: format!("{}-g{}", collection_id, i + 1),
                    photo_ids,
                    processed: false,
                }
            })
            .collect()
    }

    /// Deterministic stand-in for the similarity classifier: returns a
    /// scripted grouping per collection, with optional delay and scripted
    /// failure for the cancellation and retry paths.
    struct ScriptedAnalyzer {
        groupings: HashMap<String, Vec<SimilarityGroup>>,
        calls: Mutex<HashMap<String, usize>>,
        delay: Option<Duration>,
        fail_next: AtomicBool,
    }

    impl ScriptedAnalyzer {
        fn new() -> Self {
            Self {
                groupings: HashMap::new(),
                calls: Mutex::new(HashMap::new()),
                delay: None,
                fail_next: AtomicBool::new(false),
            }
        }

        fn with_grouping(mut self, collection_id: &str, sizes: &[usize]) -> Self {
            self.groupings
                .insert(collection_id.to_string(), groups_for(collection_id, sizes));
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn fail_next(self) -> Self {
            self.fail_next.store(true, Ordering::SeqCst);
            self
        }

        fn calls_for(&self, collection_id: &str) -> usize {
            *self
                .calls
                .lock()
                .unwrap()
                .get(collection_id)
                .unwrap_or(&0)
        }
    }

    impl CollectionAnalyzer for ScriptedAnalyzer {
        fn analyze(
            &self,
            collection_id: &str,
            _photos: &[PhotoRecord],
            progress: mpsc::UnboundedSender<f64>,
            cancel: Arc<AtomicBool>,
        ) -> Result<Vec<SimilarityGroup>, AnalyzeError> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(collection_id.to_string())
                .or_insert(0) += 1;
            let _ = progress.send(0.0);
            if let Some(delay) = self.delay {
                let started = Instant::now();
                while started.elapsed() < delay {
                    if cancel.load(Ordering::SeqCst) {
                        return Err(AnalyzeError::Cancelled);
                    }
                    thread::sleep(Duration::from_millis(2));
                }
            }
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(AnalyzeError::Failed("scripted failure".to_string()));
            }
            if cancel.load(Ordering::SeqCst) {
                return Err(AnalyzeError::Cancelled);
            }
            let _ = progress.send(1.0);
            Ok(self
                .groupings
                .get(collection_id)
                .cloned()
                .unwrap_or_default())
        }
    }

    fn review(result: NextReview) -> (String, CleanupBatch, usize) {
        match result {
            NextReview::Review {
                collection_id,
                batch,
                resume_index,
            } => (collection_id, batch, resume_index),
            NextReview::Exhausted => panic!("expected a review batch"),
        }
    }

    #[tokio::test]
    async fn test_enter_analyzes_and_serves_first_batch() {
        let analyzer = Arc::new(ScriptedAnalyzer::new().with_grouping("trip", &[4, 3, 3]));
        let session = CleanupSession::new(analyzer.clone(), CheckpointStore::temporary().unwrap())
            .with_batch_cap(5);

        let result = session
            .enter_collection("trip", photos_for("trip", 10))
            .await
            .unwrap();
        let (collection_id, batch, resume_index) = review(result);
        assert_eq!(collection_id, "trip");
        assert_eq!(batch.group_ids, vec!["trip-g1"]);
        assert_eq!(batch.photo_count(), 4);
        assert_eq!(resume_index, 0);
        assert_eq!(session.phase("trip"), CollectionPhase::Browsing);
        assert_eq!(session.total_groups("trip"), 3);
        assert_eq!(session.remaining_images("trip"), 10);
        assert_eq!(analyzer.calls_for("trip"), 1);
    }

    #[tokio::test]
    async fn test_advance_drains_collection() {
        let analyzer = Arc::new(ScriptedAnalyzer::new().with_grouping("trip", &[4, 3, 3]));
        let session = CleanupSession::new(analyzer, CheckpointStore::temporary().unwrap())
            .with_batch_cap(5);

        session
            .enter_collection("trip", photos_for("trip", 10))
            .await
            .unwrap();

        let (_, batch, _) = review(session.advance_batch().unwrap());
        assert_eq!(batch.group_ids, vec!["trip-g2"]);
        assert_eq!(session.remaining_groups("trip"), 2);
        assert_eq!(session.remaining_images("trip"), 6);

        let (_, batch, _) = review(session.advance_batch().unwrap());
        assert_eq!(batch.group_ids, vec!["trip-g3"]);
        assert_eq!(session.remaining_groups("trip"), 1);
        assert_eq!(session.remaining_images("trip"), 3);

        assert_eq!(session.advance_batch().unwrap(), NextReview::Exhausted);
        assert_eq!(session.remaining_groups("trip"), 0);
        assert_eq!(session.phase("trip"), CollectionPhase::Exhausted);
    }

    #[tokio::test]
    async fn test_exit_and_reenter_resumes_checkpoint_without_reanalysis() {
        let analyzer = Arc::new(ScriptedAnalyzer::new().with_grouping("trip", &[4, 3, 3]));
        let session = CleanupSession::new(analyzer.clone(), CheckpointStore::temporary().unwrap())
            .with_batch_cap(5);

        let (_, batch, _) = review(
            session
                .enter_collection("trip", photos_for("trip", 10))
                .await
                .unwrap(),
        );
        session.save_checkpoint(&batch.group_ids, 2).unwrap();
        session.exit_cleanup_mode();
        assert_eq!(session.phase("trip"), CollectionPhase::Idle);

        let (_, resumed, resume_index) = review(
            session
                .enter_collection("trip", photos_for("trip", 10))
                .await
                .unwrap(),
        );
        assert_eq!(resumed.group_ids, batch.group_ids);
        assert_eq!(resume_index, 2);
        assert_eq!(analyzer.calls_for("trip"), 1);
    }

    #[tokio::test]
    async fn test_exit_preserves_processed_state() {
        let analyzer = Arc::new(ScriptedAnalyzer::new().with_grouping("trip", &[4, 3, 3]));
        let session = CleanupSession::new(analyzer.clone(), CheckpointStore::temporary().unwrap())
            .with_batch_cap(5);

        session
            .enter_collection("trip", photos_for("trip", 10))
            .await
            .unwrap();
        session.advance_batch().unwrap(); // retires trip-g1
        session.exit_cleanup_mode();

        let (_, batch, _) = review(
            session
                .enter_collection("trip", photos_for("trip", 10))
                .await
                .unwrap(),
        );
        assert_eq!(batch.group_ids, vec!["trip-g2"]);
        assert_eq!(session.remaining_groups("trip"), 2);
        assert_eq!(analyzer.calls_for("trip"), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_resumes_across_session_instances() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("checkpoints");

        {
            let analyzer = Arc::new(ScriptedAnalyzer::new().with_grouping("trip", &[4, 3, 3]));
            let session = CleanupSession::new(analyzer, CheckpointStore::open(&path).unwrap())
                .with_batch_cap(5);
            let (_, batch, _) = review(
                session
                    .enter_collection("trip", photos_for("trip", 10))
                    .await
                    .unwrap(),
            );
            session.save_checkpoint(&batch.group_ids, 2).unwrap();
        }

        // A new process: fresh session, fresh analyzer run with the same
        // deterministic grouping, reopened store.
        let analyzer = Arc::new(ScriptedAnalyzer::new().with_grouping("trip", &[4, 3, 3]));
        let session = CleanupSession::new(analyzer.clone(), CheckpointStore::open(&path).unwrap())
            .with_batch_cap(5);
        let (_, batch, resume_index) = review(
            session
                .enter_collection("trip", photos_for("trip", 10))
                .await
                .unwrap(),
        );
        assert_eq!(batch.group_ids, vec!["trip-g1"]);
        assert_eq!(resume_index, 2);
        assert_eq!(analyzer.calls_for("trip"), 1);
    }

    #[tokio::test]
    async fn test_reset_restores_counters_and_forces_reanalysis() {
        let analyzer = Arc::new(ScriptedAnalyzer::new().with_grouping("trip", &[4, 3, 3]));
        let session = CleanupSession::new(analyzer.clone(), CheckpointStore::temporary().unwrap())
            .with_batch_cap(5);

        session
            .enter_collection("trip", photos_for("trip", 10))
            .await
            .unwrap();
        let (_, batch, _) = review(session.advance_batch().unwrap()); // trip-g2 active
        session.save_checkpoint(&batch.group_ids, 1).unwrap();
        assert_eq!(session.remaining_groups("trip"), 2);

        session.reset_collection_state("trip").unwrap();
        assert_eq!(session.remaining_groups("trip"), session.total_groups("trip"));
        assert_eq!(session.remaining_groups("trip"), 3);
        assert_eq!(session.phase("trip"), CollectionPhase::Idle);
        assert!(session
            .get_checkpoint_batch("trip", &photos_for("trip", 10))
            .unwrap()
            .is_none());

        session
            .enter_collection("trip", photos_for("trip", 10))
            .await
            .unwrap();
        assert_eq!(analyzer.calls_for("trip"), 2);
    }

    #[tokio::test]
    async fn test_round_robin_picks_analyzed_unexhausted_collection() {
        let analyzer = Arc::new(
            ScriptedAnalyzer::new()
                .with_grouping("a", &[2])
                .with_grouping("b", &[2, 2])
                .with_grouping("c", &[3]),
        );
        let session = CleanupSession::new(analyzer.clone(), CheckpointStore::temporary().unwrap())
            .with_batch_cap(2);
        session.set_round_robin_pool(vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
        ]);

        // b gets analyzed, then review moves back to a; c is never entered.
        session.enter_collection("b", photos_for("b", 4)).await.unwrap();
        session.enter_collection("a", photos_for("a", 2)).await.unwrap();

        // a's only group retires: the pick must be b, since c was never
        // analyzed and a itself is exhausted.
        let (collection_id, batch, _) = review(session.advance_batch().unwrap());
        assert_eq!(collection_id, "b");
        assert_eq!(batch.group_ids, vec!["b-g1"]);
        assert_eq!(session.phase("a"), CollectionPhase::Exhausted);
        assert_eq!(analyzer.calls_for("c"), 0);

        let (collection_id, batch, _) = review(session.advance_batch().unwrap());
        assert_eq!(collection_id, "b");
        assert_eq!(batch.group_ids, vec!["b-g2"]);

        assert_eq!(session.advance_batch().unwrap(), NextReview::Exhausted);
        assert_eq!(session.phase("b"), CollectionPhase::Exhausted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_save_checkpoint_triggers_prefetch_and_advance_consumes_it() {
        let analyzer = Arc::new(ScriptedAnalyzer::new().with_grouping("trip", &[2, 2, 2]));
        let session = CleanupSession::new(analyzer, CheckpointStore::temporary().unwrap())
            .with_batch_cap(2)
            .with_prefetch_threshold(1);

        let (_, batch, _) = review(
            session
                .enter_collection("trip", photos_for("trip", 6))
                .await
                .unwrap(),
        );
        assert_eq!(batch.group_ids, vec!["trip-g1"]);

        // Position on the last photo: one remaining, at the threshold.
        session.save_checkpoint(&batch.group_ids, 1).unwrap();
        let started = Instant::now();
        while session.prefetched_batch().is_none() && started.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let prefetched = session.prefetched_batch().expect("prefetch did not land");
        assert_eq!(prefetched.group_ids, vec!["trip-g2"]);

        let (_, batch, _) = review(session.advance_batch().unwrap());
        assert_eq!(batch.group_ids, vec!["trip-g2"]);
        assert!(session.prefetched_batch().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prefetch_discarded_after_exit() {
        let analyzer = Arc::new(ScriptedAnalyzer::new().with_grouping("trip", &[2, 2]));
        let session = CleanupSession::new(analyzer, CheckpointStore::temporary().unwrap())
            .with_batch_cap(2);

        session
            .enter_collection("trip", photos_for("trip", 4))
            .await
            .unwrap();
        session.prefetch();
        session.exit_cleanup_mode();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.prefetched_batch().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_prefetch_discarded_after_collection_switch() {
        let analyzer = Arc::new(
            ScriptedAnalyzer::new()
                .with_grouping("a", &[2, 2])
                .with_grouping("b", &[1]),
        );
        let session = CleanupSession::new(analyzer, CheckpointStore::temporary().unwrap())
            .with_batch_cap(2);

        session.enter_collection("a", photos_for("a", 4)).await.unwrap();
        session.prefetch();
        session.enter_collection("b", photos_for("b", 1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Whatever survived must not be a's leftover batch.
        assert!(session.prefetched_batch().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reenter_cancels_inflight_analysis() {
        let analyzer = Arc::new(
            ScriptedAnalyzer::new()
                .with_grouping("trip", &[1])
                .with_delay(Duration::from_millis(300)),
        );
        let session = Arc::new(
            CleanupSession::new(analyzer.clone(), CheckpointStore::temporary().unwrap())
                .with_batch_cap(5),
        );

        let first_session = session.clone();
        let first = tokio::spawn(async move {
            first_session
                .enter_collection("trip", photos_for("trip", 1))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The second enter supersedes the stale run and completes normally.
        let second = session
            .enter_collection("trip", photos_for("trip", 1))
            .await
            .unwrap();
        let (_, batch, _) = review(second);
        assert_eq!(batch.group_ids, vec!["trip-g1"]);

        let first = first.await.unwrap();
        assert!(matches!(
            first,
            Err(SessionError::Analyze(AnalyzeError::Cancelled))
        ));
        assert_eq!(analyzer.calls_for("trip"), 2);
    }

    #[tokio::test]
    async fn test_analyzer_failure_leaves_no_catalog_and_retry_works() {
        let analyzer = Arc::new(
            ScriptedAnalyzer::new()
                .with_grouping("trip", &[2])
                .fail_next(),
        );
        let session = CleanupSession::new(analyzer.clone(), CheckpointStore::temporary().unwrap());

        let result = session
            .enter_collection("trip", photos_for("trip", 2))
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Analyze(AnalyzeError::Failed(_)))
        ));
        assert_eq!(session.total_groups("trip"), 0);
        assert_eq!(session.phase("trip"), CollectionPhase::Idle);

        // Caller-initiated retry succeeds.
        let (_, batch, _) = review(
            session
                .enter_collection("trip", photos_for("trip", 2))
                .await
                .unwrap(),
        );
        assert_eq!(batch.group_ids, vec!["trip-g1"]);
        assert_eq!(analyzer.calls_for("trip"), 2);
    }

    #[tokio::test]
    async fn test_mark_processed_invalidates_checkpoint_and_is_idempotent() {
        let analyzer = Arc::new(ScriptedAnalyzer::new().with_grouping("trip", &[2, 2]));
        let session = CleanupSession::new(analyzer, CheckpointStore::temporary().unwrap())
            .with_batch_cap(2);

        let (_, batch, _) = review(
            session
                .enter_collection("trip", photos_for("trip", 4))
                .await
                .unwrap(),
        );
        session.save_checkpoint(&batch.group_ids, 1).unwrap();

        session.mark_groups_processed(&batch.group_ids).unwrap();
        assert_eq!(session.remaining_groups("trip"), 1);
        assert!(session
            .get_checkpoint_batch("trip", &photos_for("trip", 4))
            .unwrap()
            .is_none());

        session.mark_groups_processed(&batch.group_ids).unwrap();
        assert_eq!(session.remaining_groups("trip"), 1);
    }

    #[tokio::test]
    async fn test_misuse_is_a_noop() {
        let analyzer = Arc::new(ScriptedAnalyzer::new());
        let session = CleanupSession::new(analyzer, CheckpointStore::temporary().unwrap());

        assert_eq!(session.total_groups("unknown"), 0);
        assert_eq!(session.remaining_images("unknown"), 0);
        assert!(session.next_batch("unknown", &[], &[]).is_none());
        session
            .mark_groups_processed(&["ghost".to_string()])
            .unwrap();
        session.save_checkpoint(&["ghost".to_string()], 3).unwrap();
        assert!(session
            .get_checkpoint_batch("unknown", &[])
            .unwrap()
            .is_none());
        assert_eq!(session.advance_batch().unwrap(), NextReview::Exhausted);
        assert_eq!(session.phase("unknown"), CollectionPhase::Idle);
    }

    /// Out-of-order analyzer fractions are forwarded clamped and
    /// non-decreasing.
    #[tokio::test]
    async fn test_progress_forwarding_is_monotonic() {
        struct NoisyProgressAnalyzer;

        impl CollectionAnalyzer for NoisyProgressAnalyzer {
            fn analyze(
                &self,
                collection_id: &str,
                _photos: &[PhotoRecord],
                progress: mpsc::UnboundedSender<f64>,
                _cancel: Arc<AtomicBool>,
            ) -> Result<Vec<SimilarityGroup>, AnalyzeError> {
                for fraction in [0.2, 0.6, 0.4, 1.0] {
                    let _ = progress.send(fraction);
                }
                Ok(groups_for(collection_id, &[1]))
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = CleanupSession::new(
            Arc::new(NoisyProgressAnalyzer),
            CheckpointStore::temporary().unwrap(),
        )
        .with_progress_sender(tx);

        session
            .enter_collection("trip", photos_for("trip", 1))
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let update = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("progress update timed out")
                .expect("progress channel closed early");
            assert_eq!(update.collection_id, "trip");
            seen.push(update.fraction);
        }
        assert_eq!(seen, vec![0.2, 0.6, 0.6, 1.0]);
    }
}
