pub mod checkpoint;

pub use checkpoint::{CheckpointRecord, CheckpointStore, StoreError};
