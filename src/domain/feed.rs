//! Feed identity types.
//!
//! A feed is one logical real-time channel: a channel type plus an
//! instrument symbol. `FeedKey` is the registry map key, so it must be
//! stable and hashable regardless of which provider ends up serving it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Candle interval, named the way exchanges spell it (`1m`, `4h`, `1d`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "2h")]
    TwoHours,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1w")]
    OneWeek,
}

impl Interval {
    /// Every supported interval, shortest first.
    pub const ALL: [Self; 12] = [
        Self::OneMinute,
        Self::ThreeMinutes,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::ThirtyMinutes,
        Self::OneHour,
        Self::TwoHours,
        Self::FourHours,
        Self::SixHours,
        Self::TwelveHours,
        Self::OneDay,
        Self::OneWeek,
    ];

    /// Exchange spelling (`"1m"`, `"1h"`, ...).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::ThreeMinutes => "3m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::TwoHours => "2h",
            Self::FourHours => "4h",
            Self::SixHours => "6h",
            Self::TwelveHours => "12h",
            Self::OneDay => "1d",
            Self::OneWeek => "1w",
        }
    }

    /// Interval length in minutes.
    pub const fn minutes(self) -> u32 {
        match self {
            Self::OneMinute => 1,
            Self::ThreeMinutes => 3,
            Self::FiveMinutes => 5,
            Self::FifteenMinutes => 15,
            Self::ThirtyMinutes => 30,
            Self::OneHour => 60,
            Self::TwoHours => 120,
            Self::FourHours => 240,
            Self::SixHours => 360,
            Self::TwelveHours => 720,
            Self::OneDay => 1440,
            Self::OneWeek => 10_080,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| format!("unknown kline interval `{s}`"))
    }
}

/// Provider-agnostic channel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "interval")]
pub enum Channel {
    Ticker,
    Trade,
    OrderBook,
    Kline(Interval),
}

impl Channel {
    /// Short label used for metrics and logs.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Trade => "trade",
            Self::OrderBook => "orderbook",
            Self::Kline(_) => "kline",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kline(interval) => write!(f, "kline_{interval}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Identifies one logical subscription: (channel, symbol).
///
/// Symbols are normalized to upper case on construction so `btcusdt`
/// and `BTCUSDT` map to the same upstream connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedKey {
    pub channel: Channel,
    pub symbol: String,
}

impl FeedKey {
    pub fn new(channel: Channel, symbol: &str) -> Self {
        Self {
            channel,
            symbol: symbol.trim().to_ascii_uppercase(),
        }
    }

    pub fn ticker(symbol: &str) -> Self {
        Self::new(Channel::Ticker, symbol)
    }

    pub fn trades(symbol: &str) -> Self {
        Self::new(Channel::Trade, symbol)
    }

    pub fn order_book(symbol: &str) -> Self {
        Self::new(Channel::OrderBook, symbol)
    }

    pub fn klines(symbol: &str, interval: Interval) -> Self {
        Self::new(Channel::Kline(interval), symbol)
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.channel)
    }
}
