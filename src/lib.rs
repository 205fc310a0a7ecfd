//! Duplicate-group cleanup session engine.
//!
//! Serves a photo collection's near-duplicate clusters as bounded review
//! batches, persists mid-batch position so review survives interruption,
//! and round-robins across collections once one is exhausted. Similarity
//! detection itself is an external concern plugged in via
//! [`CollectionAnalyzer`].

pub mod core;
pub mod services;
pub mod store;

pub use crate::core::catalog::GroupCatalog;
pub use crate::core::cursor::{BatchCursor, DEFAULT_BATCH_IMAGE_CAP};
pub use crate::core::group::{CleanupBatch, SimilarityGroup};
pub use crate::core::photo::PhotoRecord;
pub use crate::services::analyzer::{AnalyzeError, AnalyzeProgress, CollectionAnalyzer};
pub use crate::services::session::{CleanupSession, CollectionPhase, NextReview, SessionError};
pub use crate::store::checkpoint::{CheckpointRecord, CheckpointStore, StoreError};
