use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::group::SimilarityGroup;
use crate::core::photo::PhotoRecord;

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("Analysis cancelled")]
    Cancelled,

    #[error("Analysis failed: {0}")]
    Failed(String),
}

/// Analysis progress forwarded to the session's consumer.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeProgress {
    pub collection_id: String,
    /// Fraction in [0, 1], non-decreasing within one analysis run.
    pub fraction: f64,
}

/// The pluggable similarity-grouping strategy. Which photos belong together
/// is this trait's whole concern; the session only consumes the resulting
/// groups.
///
/// Contract for implementations:
/// - emit progress fractions in [0, 1], non-decreasing, ending at 1.0 when
///   the grouping is complete (send failures may be ignored; the receiver
///   is allowed to hang up);
/// - check `cancel` cooperatively and return [`AnalyzeError::Cancelled`]
///   promptly, producing no partial output;
/// - be restartable: every call starts from scratch.
///
/// The session runs `analyze` on the blocking thread pool, so CPU-bound
/// implementations need no async plumbing of their own. Implementations that
/// want checkpoint resume to survive a process restart should derive stable
/// group ids for unchanged inputs rather than minting random ones.
pub trait CollectionAnalyzer: Send + Sync {
    fn analyze(
        &self,
        collection_id: &str,
        photos: &[PhotoRecord],
        progress: mpsc::UnboundedSender<f64>,
        cancel: Arc<AtomicBool>,
    ) -> Result<Vec<SimilarityGroup>, AnalyzeError>;
}
