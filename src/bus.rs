// =============================================================================
// Message Bus — in-process publish/subscribe keyed by channel name
// =============================================================================
//
// Channels are created lazily on first subscribe or publish.  Each channel is
// a `tokio::sync::broadcast`, so a slow subscriber lags (and is told how many
// messages it missed) instead of blocking publishers.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::error::PipelineResult;

const CHANNEL_CAPACITY: usize = 4096;

/// Anything that can publish a payload to a named channel.
///
/// Returns the number of subscribers that received the message.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> PipelineResult<usize>;
}

/// Central broadcast hub.  Clone-able via internal Arc.
#[derive(Clone)]
pub struct MessageBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<String>>>>,
    capacity: usize,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to a channel, creating it if it doesn't exist.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        {
            let channels = self.channels.read();
            if let Some(tx) = channels.get(channel) {
                return tx.subscribe();
            }
        }

        let mut channels = self.channels.write();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish without going through the async trait.  A channel with no
    /// subscribers is not an error; the message is simply not delivered.
    pub fn send(&self, channel: &str, payload: String) -> usize {
        let channels = self.channels.read();
        match channels.get(channel) {
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => 0,
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for MessageBus {
    async fn publish(&self, channel: &str, payload: String) -> PipelineResult<usize> {
        Ok(self.send(channel, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_every_subscriber_of_channel() {
        let bus = MessageBus::new();
        let mut a = bus.subscribe("trades");
        let mut b = bus.subscribe("trades");
        let mut other = bus.subscribe("candle-snapshots");

        let delivered = bus.publish("trades", "hello".into()).await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(a.recv().await.unwrap(), "hello");
        assert_eq!(b.recv().await.unwrap(), "hello");
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = MessageBus::new();
        assert_eq!(bus.send("nobody", "x".into()), 0);
    }

    #[test]
    fn slow_subscriber_lags_instead_of_blocking() {
        let bus = MessageBus::with_capacity(2);
        let mut rx = bus.subscribe("trades");
        for i in 0..5 {
            bus.send("trades", i.to_string());
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(3))
        ));
        assert_eq!(rx.try_recv().unwrap(), "3");
    }
}
