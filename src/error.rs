// =============================================================================
// Pipeline Errors — failure taxonomy for the trade-to-candle pipeline
// =============================================================================
//
// Every failure is scoped to the smallest unit that produced it (one message,
// one batch, one topic).  Only `ConnectionFailure` at startup is allowed to
// stop a component, and only after the retry policy is exhausted.
// =============================================================================

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// A queue entry or bus payload could not be parsed into its schema.
    #[error("malformed message: {message}")]
    MalformedMessage { message: String },

    /// The durable store rejected (or never acknowledged) a batch write.
    #[error("store write failed for {rows} rows: {message}")]
    StoreWriteFailure { rows: usize, message: String },

    /// Publishing to a bus channel failed.
    #[error("publish to {channel} failed: {message}")]
    PublishFailure { channel: String, message: String },

    /// An upstream (store, feed) could not be reached.
    #[error("connection to {target} failed: {message}")]
    ConnectionFailure { target: String, message: String },

    /// The ingestion buffer is at capacity and refuses new entries.
    #[error("ingestion buffer full: {len}/{capacity}")]
    BufferFull { len: usize, capacity: usize },

    #[error("{operation} timed out after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },
}

impl PipelineError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = PipelineError::StoreWriteFailure {
            rows: 12,
            message: "connection reset".into(),
        };
        assert_eq!(
            err.to_string(),
            "store write failed for 12 rows: connection reset"
        );

        let err = PipelineError::BufferFull {
            len: 10,
            capacity: 10,
        };
        assert_eq!(err.to_string(), "ingestion buffer full: 10/10");
    }
}
