//! Domain layer - feed identity and canonical market data shapes.
//!
//! No I/O here (hexagonal architecture inner ring). Everything is
//! plain data that the use cases pass between ports.

pub mod feed;
pub mod market;

pub use feed::{Channel, FeedKey, Interval};
pub use market::{now_ms, Kline, Level, MarketEvent, OrderBook, TakerSide, Ticker, Trade};
