//! Canonical market data payloads.
//!
//! Providers translate their wire formats into these shapes at the
//! stream/REST boundary; nothing above the adapters layer ever sees a
//! provider-specific field name.

use serde::Serialize;

/// 24h rolling ticker for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ticker {
    pub symbol: String,
    /// Last traded price.
    pub price: f64,
    /// 24h change in percent.
    pub change_pct: f64,
    /// 24h base-asset volume.
    pub volume: f64,
    pub high: f64,
    pub low: f64,
    /// Event time (Unix ms).
    pub timestamp_ms: u64,
}

/// Which side crossed the spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TakerSide {
    Buy,
    Sell,
}

/// A single public trade print.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    pub symbol: String,
    pub price: f64,
    pub quantity: f64,
    /// Trade time (Unix ms).
    pub timestamp_ms: u64,
    pub taker_side: TakerSide,
}

/// One price level of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Level {
    pub price: f64,
    pub quantity: f64,
}

/// Order book view. Bids descending, asks ascending.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub timestamp_ms: u64,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<Level> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<Level> {
        self.asks.first().copied()
    }

    /// Mid price, if both sides are present.
    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
            _ => None,
        }
    }

    /// Sort both sides into canonical order and keep at most `depth` levels.
    pub(crate) fn normalize(&mut self, depth: usize) {
        self.bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        self.asks.sort_by(|a, b| a.price.total_cmp(&b.price));
        self.bids.truncate(depth);
        self.asks.truncate(depth);
    }
}

/// OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Kline {
    pub symbol: String,
    /// Exchange spelling of the interval (`"1m"`).
    pub interval: String,
    /// Candle open time (Unix ms).
    pub open_time_ms: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Whether the candle is final.
    pub closed: bool,
}

/// Normalized value delivered to feed subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketEvent {
    Ticker(Ticker),
    Trade(Trade),
    OrderBook(OrderBook),
    Kline(Kline),
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Ticker(t) => &t.symbol,
            Self::Trade(t) => &t.symbol,
            Self::OrderBook(b) => &b.symbol,
            Self::Kline(k) => &k.symbol,
        }
    }
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
