//! Market Provider Port - Upstream Capability Interface
//!
//! One implementation per upstream data source. The fallback switch
//! selects between two of these; call sites never branch on provider
//! name. A provider knows how to name a stream for a feed, how to turn
//! its own frames into canonical events, and how to answer REST lookups.

use async_trait::async_trait;

use crate::domain::{FeedKey, Interval, Kline, MarketEvent, OrderBook, Ticker, Trade};
use crate::error::ProviderError;

/// Where and how to open the upstream stream for one feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
  /// WebSocket URL.
  pub url: String,
  /// Text frame sent right after connecting (subscription request),
  /// for providers that multiplex channels over one URL.
  pub subscribe: Option<String>,
}

/// Capability interface implemented by every upstream provider.
#[async_trait]
pub trait MarketProvider: Send + Sync + 'static {
  /// Stable short name used in logs and metric labels.
  fn name(&self) -> &'static str;

  /// Resolve the stream endpoint serving `feed`.
  ///
  /// Returns `ProviderError::Unsupported` when the provider has no
  /// equivalent stream (e.g. an interval it does not publish).
  fn stream_endpoint(&self, feed: &FeedKey) -> Result<StreamEndpoint, ProviderError>;

  /// Translate one upstream text frame into canonical events.
  ///
  /// Control frames (acks, heartbeats, status) yield an empty vector.
  /// A frame that cannot be decoded yields `ProviderError::Malformed`.
  /// `ProviderError::Unsupported` means upstream refused the feed and
  /// the session should stop.
  fn normalize(&self, feed: &FeedKey, frame: &str) -> Result<Vec<MarketEvent>, ProviderError>;

  /// A stream session for `feed` is open and about to be read.
  fn stream_opened(&self, _feed: &FeedKey) {}

  /// A stream session for `feed` has ended. Providers that keep
  /// per-feed state across frames release it here.
  fn stream_closed(&self, _feed: &FeedKey) {}

  /// 24h ticker snapshot.
  async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ProviderError>;

  /// Order book snapshot with at most `depth` levels per side.
  async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, ProviderError>;

  /// Most recent `limit` candles, oldest first.
  async fn fetch_klines(
    &self,
    symbol: &str,
    interval: Interval,
    limit: usize,
  ) -> Result<Vec<Kline>, ProviderError>;

  /// Most recent `limit` public trades, oldest first.
  async fn fetch_recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>, ProviderError>;

  /// Cheap reachability check used by the recovery probe.
  async fn ping(&self) -> Result<(), ProviderError>;
}
