// =============================================================================
// Shared types and wire schemas used across the candle pooler
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::price::integer_to_price;

/// Bus channel carrying raw trades from the feed.
pub const TRADES_CHANNEL: &str = "trades";
/// Bus channel carrying periodic candle snapshots.
pub const SNAPSHOT_CHANNEL: &str = "candle-snapshots";

// ---------------------------------------------------------------------------
// Trade
// ---------------------------------------------------------------------------

/// A single trade as published by the market feed.  `price` is fixed-point
/// (see [`crate::price`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub price: i64,
    pub quantity: f64,
    pub timestamp: i64,
}

impl Trade {
    /// Parse a serialized trade, rejecting anything that does not match the
    /// schema or carries an empty symbol.
    pub fn parse(raw: &str) -> PipelineResult<Self> {
        let trade: Trade = serde_json::from_str(raw)
            .map_err(|e| PipelineError::malformed(format!("trade: {e}")))?;
        if trade.symbol.trim().is_empty() {
            return Err(PipelineError::malformed("trade: empty symbol"));
        }
        if !trade.quantity.is_finite() {
            return Err(PipelineError::malformed("trade: non-finite quantity"));
        }
        if DateTime::<Utc>::from_timestamp_millis(trade.timestamp).is_none() {
            return Err(PipelineError::malformed(format!(
                "trade: timestamp {} out of range",
                trade.timestamp
            )));
        }
        Ok(trade)
    }
}

/// A trade as delivered to clients: identical to [`Trade`] except that the
/// price is the decoded decimal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveTrade {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub quantity: f64,
    pub timestamp: i64,
}

impl From<&Trade> for LiveTrade {
    fn from(trade: &Trade) -> Self {
        Self {
            symbol: trade.symbol.clone(),
            price: integer_to_price(trade.price),
            quantity: trade.quantity,
            timestamp: trade.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

/// The canonical candle timeframes.  Custom timeframes are not supported.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub enum Timeframe {
    S30,
    M1,
    M5,
    H1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [Self::S30, Self::M1, Self::M5, Self::H1];

    pub fn seconds(self) -> i64 {
        match self {
            Self::S30 => 30,
            Self::M1 => 60,
            Self::M5 => 300,
            Self::H1 => 3600,
        }
    }

    pub fn millis(self) -> i64 {
        self.seconds() * 1000
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::S30 => "30s",
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::H1 => "1h",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tf| tf.label() == label)
    }

    /// Start of the window containing `timestamp` (floor division, so
    /// pre-epoch timestamps align downwards too).  `None` when the aligned
    /// start falls outside `i64`.
    pub fn bucket_start(self, timestamp: i64) -> Option<i64> {
        timestamp.div_euclid(self.millis()).checked_mul(self.millis())
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for Timeframe {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Self::from_label(&label)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown timeframe {label:?}")))
    }
}

// ---------------------------------------------------------------------------
// Candle snapshot
// ---------------------------------------------------------------------------

/// Periodic view of a live candle, published on [`SNAPSHOT_CHANNEL`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleSnapshot {
    /// Bucket start, epoch millis.
    pub time: i64,
    pub symbol: String,
    pub timeframe: Timeframe,
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
    pub source: String,
    /// Wall-clock time the snapshot was taken, epoch millis.
    pub timestamp: i64,
}

impl CandleSnapshot {
    pub fn parse(raw: &str) -> PipelineResult<Self> {
        serde_json::from_str(raw).map_err(|e| PipelineError::malformed(format!("snapshot: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Client session protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleSubscription {
    pub symbol: String,
    pub timeframe: Timeframe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSubscription {
    pub symbol: String,
}

/// Frames a client may send: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    SubscribeCandles(CandleSubscription),
    UnsubscribeCandles(CandleSubscription),
    SubscribeTrades(TradeSubscription),
    UnsubscribeTrades(TradeSubscription),
    Ping,
}

impl ClientEvent {
    pub fn parse(raw: &str) -> PipelineResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| PipelineError::malformed(format!("client event: {e}")))
    }
}

/// Frames pushed to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    CandleSnapshot(CandleSnapshot),
    LiveTrade(LiveTrade),
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn timeframe_durations_and_labels() {
        let secs: Vec<i64> = Timeframe::ALL.iter().map(|t| t.seconds()).collect();
        assert_eq!(secs, vec![30, 60, 300, 3600]);
        assert_eq!(Timeframe::M5.millis(), 300_000);
        for tf in Timeframe::ALL {
            assert_eq!(Timeframe::from_label(tf.label()), Some(tf));
        }
        assert_eq!(Timeframe::from_label("15m"), None);
    }

    #[test]
    fn bucket_start_aligns_to_interval() {
        assert_eq!(Timeframe::S30.bucket_start(0), Some(0));
        assert_eq!(Timeframe::S30.bucket_start(29_999), Some(0));
        assert_eq!(Timeframe::S30.bucket_start(30_000), Some(30_000));
        assert_eq!(Timeframe::H1.bucket_start(7_199_999), Some(3_600_000));
        assert_eq!(Timeframe::M1.bucket_start(-1), Some(-60_000));
        assert_eq!(Timeframe::S30.bucket_start(i64::MIN), None);
        assert!(Timeframe::H1.bucket_start(i64::MAX).is_some());
    }

    #[test]
    fn parse_trade_ok() {
        let trade =
            Trade::parse(r#"{"symbol":"BTCUSDT","price":10000000000,"quantity":0.5,"timestamp":1700000000000}"#)
                .unwrap();
        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(trade.price, 10_000_000_000);
        assert_eq!(trade.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn parse_trade_rejects_bad_payloads() {
        for raw in [
            "not json",
            r#"{"symbol":"BTCUSDT","price":"abc","quantity":1,"timestamp":0}"#,
            r#"{"symbol":"BTCUSDT","price":1,"quantity":1}"#,
            r#"{"symbol":"","price":1,"quantity":1,"timestamp":0}"#,
        ] {
            assert!(
                matches!(Trade::parse(raw), Err(PipelineError::MalformedMessage { .. })),
                "accepted {raw}"
            );
        }
    }

    #[test]
    fn parse_trade_rejects_unrepresentable_timestamps() {
        for ts in [i64::MIN, i64::MAX, -9_000_000_000_000_000] {
            let raw = format!(r#"{{"symbol":"BTCUSDT","price":100,"quantity":1,"timestamp":{ts}}}"#);
            assert!(
                matches!(Trade::parse(&raw), Err(PipelineError::MalformedMessage { .. })),
                "accepted timestamp {ts}"
            );
        }
        let ok = r#"{"symbol":"BTCUSDT","price":100,"quantity":1,"timestamp":-1000}"#;
        assert_eq!(Trade::parse(ok).unwrap().timestamp, -1000);
    }

    #[test]
    fn live_trade_decodes_price() {
        let trade = Trade {
            symbol: "ETHUSDT".into(),
            price: 312_345_000_000,
            quantity: 2.0,
            timestamp: 5,
        };
        let live = LiveTrade::from(&trade);
        assert_eq!(live.price, Decimal::from_str("3123.45").unwrap());

        let json: serde_json::Value = serde_json::to_value(&live).unwrap();
        assert_eq!(json["price"], serde_json::json!(3123.45));
    }

    #[test]
    fn client_events_parse() {
        let ev = ClientEvent::parse(
            r#"{"event":"subscribe-candles","data":{"symbol":"BTCUSDT","timeframe":"1m"}}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            ClientEvent::SubscribeCandles(CandleSubscription {
                symbol: "BTCUSDT".into(),
                timeframe: Timeframe::M1,
            })
        );

        let ev = ClientEvent::parse(r#"{"event":"unsubscribe-trades","data":{"symbol":"SOLUSDT"}}"#)
            .unwrap();
        assert_eq!(
            ev,
            ClientEvent::UnsubscribeTrades(TradeSubscription {
                symbol: "SOLUSDT".into()
            })
        );

        assert_eq!(ClientEvent::parse(r#"{"event":"ping"}"#).unwrap(), ClientEvent::Ping);
        assert!(ClientEvent::parse(
            r#"{"event":"subscribe-candles","data":{"symbol":"BTCUSDT","timeframe":"2m"}}"#
        )
        .is_err());
    }

    #[test]
    fn server_event_shape() {
        let json = serde_json::to_value(ServerEvent::Pong).unwrap();
        assert_eq!(json, serde_json::json!({"event": "pong"}));
    }
}
