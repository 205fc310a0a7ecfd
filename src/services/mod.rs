pub mod analyzer;
pub mod session;

pub use analyzer::{AnalyzeError, AnalyzeProgress, CollectionAnalyzer};
pub use session::{CleanupSession, CollectionPhase, NextReview, SessionError};
