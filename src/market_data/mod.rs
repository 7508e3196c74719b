pub mod candle_aggregator;
pub mod ingestion_buffer;
pub mod trade_feed;

pub use candle_aggregator::{CandleAggregator, CandleBucket, CandleKey};
pub use ingestion_buffer::IngestionBuffer;
