// =============================================================================
// Subscription Topics — many-to-many index between sessions and topics
// =============================================================================

use std::collections::HashSet;

use dashmap::DashMap;
use uuid::Uuid;

use crate::types::Timeframe;

pub type SessionId = Uuid;

/// Dynamic topic for live candles: `candles:{symbol}:{timeframe}`.
pub fn candle_topic(symbol: &str, timeframe: Timeframe) -> String {
    format!("candles:{symbol}:{}", timeframe.label())
}

/// Dynamic topic for raw trades: `trades:{symbol}`.
pub fn trade_topic(symbol: &str) -> String {
    format!("trades:{symbol}")
}

/// Exact-match topic index.  Both directions are kept so that a session
/// close can drop every membership without scanning all topics.
#[derive(Debug, Default)]
pub struct TopicIndex {
    topic_to_sessions: DashMap<String, HashSet<SessionId>>,
    session_to_topics: DashMap<SessionId, HashSet<String>>,
}

impl TopicIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the session already held the topic.
    pub fn subscribe(&self, session: SessionId, topic: &str) -> bool {
        let added = self
            .session_to_topics
            .entry(session)
            .or_default()
            .insert(topic.to_string());
        if added {
            self.topic_to_sessions
                .entry(topic.to_string())
                .or_default()
                .insert(session);
        }
        added
    }

    /// Returns `false` when the session did not hold the topic.
    pub fn unsubscribe(&self, session: SessionId, topic: &str) -> bool {
        let removed = match self.session_to_topics.get_mut(&session) {
            Some(mut topics) => topics.remove(topic),
            None => false,
        };
        self.session_to_topics
            .remove_if(&session, |_, topics| topics.is_empty());

        if removed {
            if let Some(mut sessions) = self.topic_to_sessions.get_mut(topic) {
                sessions.remove(&session);
            }
            self.topic_to_sessions
                .remove_if(topic, |_, sessions| sessions.is_empty());
        }
        removed
    }

    /// Drop every membership of `session`.  Returns how many were removed.
    pub fn remove_session(&self, session: SessionId) -> usize {
        let Some((_, topics)) = self.session_to_topics.remove(&session) else {
            return 0;
        };
        for topic in &topics {
            if let Some(mut sessions) = self.topic_to_sessions.get_mut(topic) {
                sessions.remove(&session);
            }
            self.topic_to_sessions
                .remove_if(topic, |_, sessions| sessions.is_empty());
        }
        topics.len()
    }

    pub fn sessions_for(&self, topic: &str) -> Vec<SessionId> {
        self.topic_to_sessions
            .get(topic)
            .map(|sessions| sessions.iter().copied().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn topics_of(&self, session: SessionId) -> Vec<String> {
        let mut topics: Vec<String> = self
            .session_to_topics
            .get(&session)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// (topics with at least one subscriber, sessions with at least one topic)
    pub fn stats(&self) -> (usize, usize) {
        (self.topic_to_sessions.len(), self.session_to_topics.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_strings() {
        assert_eq!(candle_topic("BTCUSDT", Timeframe::M5), "candles:BTCUSDT:5m");
        assert_eq!(trade_topic("ETHUSDT"), "trades:ETHUSDT");
    }

    #[test]
    fn subscribe_is_idempotent() {
        let index = TopicIndex::new();
        let s = Uuid::new_v4();
        assert!(index.subscribe(s, "trades:BTCUSDT"));
        assert!(!index.subscribe(s, "trades:BTCUSDT"));
        assert_eq!(index.sessions_for("trades:BTCUSDT"), vec![s]);
        assert_eq!(index.stats(), (1, 1));
    }

    #[test]
    fn unsubscribe_unknown_topic_is_a_no_op() {
        let index = TopicIndex::new();
        let s = Uuid::new_v4();
        let other = Uuid::new_v4();
        index.subscribe(other, "trades:BTCUSDT");

        assert!(!index.unsubscribe(s, "trades:BTCUSDT"));
        assert!(!index.unsubscribe(other, "candles:BTCUSDT:1m"));
        assert_eq!(index.sessions_for("trades:BTCUSDT"), vec![other]);
    }

    #[test]
    fn unsubscribe_stops_routing() {
        let index = TopicIndex::new();
        let s = Uuid::new_v4();
        index.subscribe(s, "candles:BTCUSDT:1m");
        assert!(index.unsubscribe(s, "candles:BTCUSDT:1m"));
        assert!(index.sessions_for("candles:BTCUSDT:1m").is_empty());
        assert_eq!(index.stats(), (0, 0));
    }

    #[test]
    fn remove_session_drops_all_memberships() {
        let index = TopicIndex::new();
        let s = Uuid::new_v4();
        let keep = Uuid::new_v4();
        index.subscribe(s, "trades:BTCUSDT");
        index.subscribe(s, "candles:BTCUSDT:30s");
        index.subscribe(keep, "trades:BTCUSDT");

        assert_eq!(index.remove_session(s), 2);
        assert!(index.topics_of(s).is_empty());
        assert_eq!(index.sessions_for("trades:BTCUSDT"), vec![keep]);
        assert!(index.sessions_for("candles:BTCUSDT:30s").is_empty());
        assert_eq!(index.remove_session(s), 0);
    }

    #[test]
    fn no_wildcard_matching() {
        let index = TopicIndex::new();
        let s = Uuid::new_v4();
        index.subscribe(s, "candles:BTCUSDT:1m");
        assert!(index.sessions_for("candles:BTCUSDT:5m").is_empty());
        assert!(index.sessions_for("trades:BTCUSDT").is_empty());
    }
}
