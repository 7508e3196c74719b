// =============================================================================
// Dead-Letter Queue — batches that exhausted their write retries
// =============================================================================
//
// Bounded ring: the oldest entry is evicted once `capacity` is reached.
// Entries keep the serialized trades so they can be replayed by hand.
// =============================================================================

use std::collections::VecDeque;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Serialized trades of the failed batch.
    pub data: Vec<String>,
    /// When the batch was given up on, epoch millis.
    pub timestamp: i64,
    pub retry_count: u32,
    pub error_message: String,
}

pub struct DeadLetterQueue {
    entries: RwLock<VecDeque<DeadLetterEntry>>,
    capacity: usize,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Record a failed batch.  Returns `true` when the oldest entry had to
    /// be evicted to make room.
    pub fn push(&self, data: Vec<String>, retry_count: u32, error_message: String) -> bool {
        error!(
            rows = data.len(),
            retry_count,
            error = %error_message,
            "batch moved to dead-letter queue"
        );
        let mut entries = self.entries.write();
        let mut evicted = false;
        if entries.len() >= self.capacity {
            if let Some(oldest) = entries.pop_front() {
                evicted = true;
                warn!(
                    rows = oldest.data.len(),
                    capacity = self.capacity,
                    "dead-letter queue full, oldest batch evicted"
                );
            }
        }
        entries.push_back(DeadLetterEntry {
            data,
            timestamp: Utc::now().timestamp_millis(),
            retry_count,
            error_message,
        });
        evicted
    }

    /// Most recent entries, newest last.
    pub fn recent(&self) -> Vec<DeadLetterEntry> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}
