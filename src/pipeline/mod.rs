pub mod batch_processor;
pub mod ingest;
pub mod snapshot_broadcaster;

pub use batch_processor::BatchProcessor;
pub use snapshot_broadcaster::SnapshotBroadcaster;
