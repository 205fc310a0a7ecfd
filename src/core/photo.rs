use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single photo as known to the engine. Immutable once fetched; the
/// caller's photo index owns the actual image data, the engine only keeps
/// ids inside groups and re-resolves them against a live photo list when a
/// batch is materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub id: String,
    /// Opaque reference into the caller's photo storage (URI, path, asset key).
    pub source: String,
    pub captured_at: Option<DateTime<Utc>>,
    pub collection_id: String,
    pub width: u32,
    pub height: u32,
}
