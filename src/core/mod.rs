pub mod catalog;
pub mod cursor;
pub mod group;
pub mod photo;

pub use catalog::GroupCatalog;
pub use cursor::BatchCursor;
pub use group::{CleanupBatch, SimilarityGroup};
pub use photo::PhotoRecord;
