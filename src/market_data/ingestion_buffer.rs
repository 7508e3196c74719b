// =============================================================================
// Ingestion Buffer — bounded, ordered `trade_queue`
// =============================================================================
//
// Producers append serialized trades; the batch processor drains them in
// chunks.  Reading the head of the queue and trimming it happen under one
// lock acquisition, so an entry appended mid-drain is never lost and no two
// drains ever see the same entry.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{PipelineError, PipelineResult};
use crate::metrics::PipelineMetrics;
use crate::runtime_config::OverflowPolicy;

/// Name of the queue, used in logs.
pub const TRADE_QUEUE: &str = "trade_queue";

pub struct IngestionBuffer {
    entries: Mutex<VecDeque<String>>,
    capacity: usize,
    policy: OverflowPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl IngestionBuffer {
    pub fn new(capacity: usize, policy: OverflowPolicy, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            policy,
            metrics,
        }
    }

    /// Append one serialized trade at the tail.
    ///
    /// At capacity, `Reject` refuses the entry with `BufferFull`;
    /// `DropOldest` evicts the head and accepts it.
    pub fn enqueue(&self, raw: String) -> PipelineResult<()> {
        let mut entries = self.entries.lock();

        if entries.len() >= self.capacity {
            PipelineMetrics::incr(&self.metrics.queue_overflow);
            match self.policy {
                OverflowPolicy::Reject => {
                    return Err(PipelineError::BufferFull {
                        len: entries.len(),
                        capacity: self.capacity,
                    });
                }
                OverflowPolicy::DropOldest => {
                    entries.pop_front();
                    warn!(queue = TRADE_QUEUE, capacity = self.capacity, "buffer full, dropped oldest entry");
                }
            }
        }

        entries.push_back(raw);
        Ok(())
    }

    /// Remove and return up to `max` of the oldest entries, in order.
    pub fn drain_batch(&self, max: usize) -> Vec<String> {
        let mut entries = self.entries.lock();
        let n = max.min(entries.len());
        entries.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn buffer(capacity: usize, policy: OverflowPolicy) -> IngestionBuffer {
        IngestionBuffer::new(capacity, policy, Arc::new(PipelineMetrics::new()))
    }

    #[test]
    fn drain_returns_oldest_first() {
        let buf = buffer(100, OverflowPolicy::Reject);
        for i in 0..5 {
            buf.enqueue(i.to_string()).unwrap();
        }
        assert_eq!(buf.drain_batch(3), vec!["0", "1", "2"]);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.drain_batch(3), vec!["3", "4"]);
        assert!(buf.is_empty());
        assert!(buf.drain_batch(3).is_empty());
    }

    #[test]
    fn reject_policy_refuses_when_full() {
        let buf = buffer(2, OverflowPolicy::Reject);
        buf.enqueue("a".into()).unwrap();
        buf.enqueue("b".into()).unwrap();
        assert_eq!(
            buf.enqueue("c".into()),
            Err(PipelineError::BufferFull { len: 2, capacity: 2 })
        );
        assert_eq!(buf.drain_batch(10), vec!["a", "b"]);
    }

    #[test]
    fn drop_oldest_policy_keeps_newest() {
        let metrics = Arc::new(PipelineMetrics::new());
        let buf = IngestionBuffer::new(2, OverflowPolicy::DropOldest, metrics.clone());
        for s in ["a", "b", "c"] {
            buf.enqueue(s.into()).unwrap();
        }
        assert_eq!(buf.drain_batch(10), vec!["b", "c"]);
        assert_eq!(metrics.snapshot().queue_overflow, 1);
    }

    #[test]
    fn concurrent_drains_never_overlap_or_lose() {
        let buf = Arc::new(buffer(1_000_000, OverflowPolicy::Reject));
        let producers = 4;
        let per_producer = 5_000;

        let producer_handles: Vec<_> = (0..producers)
            .map(|p| {
                let buf = buf.clone();
                std::thread::spawn(move || {
                    for i in 0..per_producer {
                        buf.enqueue(format!("{p}-{i}")).unwrap();
                    }
                })
            })
            .collect();

        let consumer_handles: Vec<_> = (0..3)
            .map(|_| {
                let buf = buf.clone();
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..2_000 {
                        seen.extend(buf.drain_batch(17));
                    }
                    seen
                })
            })
            .collect();

        for h in producer_handles {
            h.join().unwrap();
        }
        let mut all: Vec<String> = consumer_handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.extend(buf.drain_batch(usize::MAX));

        let unique: HashSet<&String> = all.iter().collect();
        assert_eq!(all.len(), producers * per_producer);
        assert_eq!(unique.len(), all.len());
    }

    #[test]
    fn per_producer_order_is_preserved() {
        let buf = buffer(1000, OverflowPolicy::Reject);
        for i in 0..100 {
            buf.enqueue(i.to_string()).unwrap();
        }
        let mut drained = Vec::new();
        while !buf.is_empty() {
            drained.extend(buf.drain_batch(7));
        }
        let as_numbers: Vec<u32> = drained.iter().map(|s| s.parse().unwrap()).collect();
        assert_eq!(as_numbers, (0..100).collect::<Vec<_>>());
    }
}
