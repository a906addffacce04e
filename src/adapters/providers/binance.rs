//! Binance Provider - Primary Market Data Source
//!
//! Streams use the raw `/ws/<stream>` endpoints, one socket per feed:
//! `<sym>@ticker`, `<sym>@trade`, `<sym>@depth<N>@100ms` and
//! `<sym>@kline_<interval>`. REST goes to the public `/api/v3` API.
//!
//! Binance encodes prices and quantities as decimal strings.

use async_trait::async_trait;
use serde::Deserialize;

use super::{flexible_f64, parse_num};
use crate::adapters::http::HttpClient;
use crate::domain::{
    now_ms, Channel, FeedKey, Interval, Kline, Level, MarketEvent, OrderBook, TakerSide, Ticker,
    Trade,
};
use crate::error::ProviderError;
use crate::ports::{MarketProvider, StreamEndpoint};

/// Partial book depths the stream API publishes.
const STREAM_DEPTHS: [usize; 3] = [5, 10, 20];
/// `limit` values accepted by `/api/v3/depth`.
const REST_DEPTHS: [usize; 8] = [5, 10, 20, 50, 100, 500, 1000, 5000];

/// 24hr ticker stream payload.
#[derive(Debug, Deserialize)]
struct TickerMsg {
    #[serde(rename = "c", deserialize_with = "flexible_f64")]
    last: f64,
    #[serde(rename = "P", deserialize_with = "flexible_f64")]
    change_pct: f64,
    #[serde(rename = "v", deserialize_with = "flexible_f64")]
    volume: f64,
    #[serde(rename = "h", deserialize_with = "flexible_f64")]
    high: f64,
    #[serde(rename = "l", deserialize_with = "flexible_f64")]
    low: f64,
    /// Event time (Unix ms).
    #[serde(rename = "E")]
    event_time: Option<u64>,
}

/// Trade stream payload.
#[derive(Debug, Deserialize)]
struct TradeMsg {
    #[serde(rename = "p", deserialize_with = "flexible_f64")]
    price: f64,
    #[serde(rename = "q", deserialize_with = "flexible_f64")]
    quantity: f64,
    #[serde(rename = "T")]
    trade_time: u64,
    /// Buyer is the maker, i.e. the taker sold.
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

/// Partial book depth payload (stream and REST share the shape).
#[derive(Debug, Deserialize)]
struct DepthMsg {
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct KlineMsg {
    k: KlineBody,
}

#[derive(Debug, Deserialize)]
struct KlineBody {
    #[serde(rename = "t")]
    open_time: u64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o", deserialize_with = "flexible_f64")]
    open: f64,
    #[serde(rename = "h", deserialize_with = "flexible_f64")]
    high: f64,
    #[serde(rename = "l", deserialize_with = "flexible_f64")]
    low: f64,
    #[serde(rename = "c", deserialize_with = "flexible_f64")]
    close: f64,
    #[serde(rename = "v", deserialize_with = "flexible_f64")]
    volume: f64,
    #[serde(rename = "x")]
    closed: bool,
}

/// `/api/v3/ticker/24hr` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestTicker {
    symbol: String,
    #[serde(deserialize_with = "flexible_f64")]
    last_price: f64,
    #[serde(deserialize_with = "flexible_f64")]
    price_change_percent: f64,
    #[serde(deserialize_with = "flexible_f64")]
    volume: f64,
    #[serde(deserialize_with = "flexible_f64")]
    high_price: f64,
    #[serde(deserialize_with = "flexible_f64")]
    low_price: f64,
    close_time: u64,
}

/// `/api/v3/trades` element.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestTrade {
    #[serde(deserialize_with = "flexible_f64")]
    price: f64,
    #[serde(deserialize_with = "flexible_f64")]
    qty: f64,
    time: u64,
    is_buyer_maker: bool,
}

/// Binance spot market data.
pub struct BinanceProvider {
    http: HttpClient,
    ws_url: String,
    stream_depth: usize,
}

impl BinanceProvider {
    /// `ws_url` is the raw stream base, e.g. `wss://stream.binance.com:9443/ws`.
    pub fn new(http: HttpClient, ws_url: &str, stream_depth: usize) -> Self {
        Self {
            http,
            ws_url: ws_url.trim_end_matches('/').to_string(),
            stream_depth,
        }
    }

    /// Stream name for `feed`, e.g. `btcusdt@kline_1m`.
    pub fn stream_name(&self, feed: &FeedKey) -> String {
        let symbol = feed.symbol.to_ascii_lowercase();
        match feed.channel {
            Channel::Ticker => format!("{symbol}@ticker"),
            Channel::Trade => format!("{symbol}@trade"),
            Channel::OrderBook => {
                format!("{symbol}@depth{}@100ms", pick_depth(&STREAM_DEPTHS, self.stream_depth))
            }
            Channel::Kline(interval) => format!("{symbol}@kline_{interval}"),
        }
    }

    fn taker(buyer_is_maker: bool) -> TakerSide {
        if buyer_is_maker {
            TakerSide::Sell
        } else {
            TakerSide::Buy
        }
    }
}

/// Smallest supported depth that covers `wanted`, or the largest one.
fn pick_depth(supported: &[usize], wanted: usize) -> usize {
    supported
        .iter()
        .copied()
        .find(|&d| d >= wanted)
        .or_else(|| supported.last().copied())
        .unwrap_or(wanted)
}

fn levels(raw: &[(String, String)], side: &str) -> Result<Vec<Level>, ProviderError> {
    raw.iter()
        .map(|(p, q)| {
            Ok(Level {
                price: parse_num(p, side)?,
                quantity: parse_num(q, side)?,
            })
        })
        .collect()
}

fn book(symbol: &str, depth: DepthMsg, timestamp_ms: u64) -> Result<OrderBook, ProviderError> {
    Ok(OrderBook {
        symbol: symbol.to_string(),
        bids: levels(&depth.bids, "bid")?,
        asks: levels(&depth.asks, "ask")?,
        timestamp_ms,
    })
}

/// One `/api/v3/klines` row: `[openTime, o, h, l, c, v, closeTime, ...]`.
fn kline_row(symbol: &str, interval: Interval, row: &[serde_json::Value], now: u64) -> Result<Kline, ProviderError> {
    let field = |idx: usize, name: &str| -> Result<f64, ProviderError> {
        match row.get(idx) {
            Some(serde_json::Value::String(s)) => parse_num(s, name),
            Some(serde_json::Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| ProviderError::Malformed(format!("kline {name}"))),
            _ => Err(ProviderError::Malformed(format!("kline row missing {name}"))),
        }
    };
    let time = |idx: usize, name: &str| -> Result<u64, ProviderError> {
        row.get(idx)
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| ProviderError::Malformed(format!("kline row missing {name}")))
    };

    Ok(Kline {
        symbol: symbol.to_string(),
        interval: interval.as_str().to_string(),
        open_time_ms: time(0, "open time")?,
        open: field(1, "open")?,
        high: field(2, "high")?,
        low: field(3, "low")?,
        close: field(4, "close")?,
        volume: field(5, "volume")?,
        closed: time(6, "close time")? < now,
    })
}

#[async_trait]
impl MarketProvider for BinanceProvider {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn stream_endpoint(&self, feed: &FeedKey) -> Result<StreamEndpoint, ProviderError> {
        Ok(StreamEndpoint {
            url: format!("{}/{}", self.ws_url, self.stream_name(feed)),
            subscribe: None,
        })
    }

    fn normalize(&self, feed: &FeedKey, frame: &str) -> Result<Vec<MarketEvent>, ProviderError> {
        let event = match feed.channel {
            Channel::Ticker => {
                let msg: TickerMsg = serde_json::from_str(frame)?;
                MarketEvent::Ticker(Ticker {
                    symbol: feed.symbol.clone(),
                    price: msg.last,
                    change_pct: msg.change_pct,
                    volume: msg.volume,
                    high: msg.high,
                    low: msg.low,
                    timestamp_ms: msg.event_time.unwrap_or_else(now_ms),
                })
            }
            Channel::Trade => {
                let msg: TradeMsg = serde_json::from_str(frame)?;
                MarketEvent::Trade(Trade {
                    symbol: feed.symbol.clone(),
                    price: msg.price,
                    quantity: msg.quantity,
                    timestamp_ms: msg.trade_time,
                    taker_side: Self::taker(msg.buyer_is_maker),
                })
            }
            Channel::OrderBook => {
                let msg: DepthMsg = serde_json::from_str(frame)?;
                let mut book = book(&feed.symbol, msg, now_ms())?;
                book.normalize(self.stream_depth.max(1));
                MarketEvent::OrderBook(book)
            }
            Channel::Kline(_) => {
                let KlineMsg { k } = serde_json::from_str(frame)?;
                MarketEvent::Kline(Kline {
                    symbol: feed.symbol.clone(),
                    interval: k.interval,
                    open_time_ms: k.open_time,
                    open: k.open,
                    high: k.high,
                    low: k.low,
                    close: k.close,
                    volume: k.volume,
                    closed: k.closed,
                })
            }
        };
        Ok(vec![event])
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ProviderError> {
        let t: RestTicker = self
            .http
            .get_json("/api/v3/ticker/24hr", &[("symbol", symbol.to_string())])
            .await?;
        Ok(Ticker {
            symbol: t.symbol,
            price: t.last_price,
            change_pct: t.price_change_percent,
            volume: t.volume,
            high: t.high_price,
            low: t.low_price,
            timestamp_ms: t.close_time,
        })
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, ProviderError> {
        let limit = pick_depth(&REST_DEPTHS, depth);
        let msg: DepthMsg = self
            .http
            .get_json(
                "/api/v3/depth",
                &[("symbol", symbol.to_string()), ("limit", limit.to_string())],
            )
            .await?;
        let mut book = book(symbol, msg, now_ms())?;
        book.normalize(depth);
        Ok(book)
    }

    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Kline>, ProviderError> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .http
            .get_json(
                "/api/v3/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.as_str().to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        let now = now_ms();
        rows.iter()
            .map(|row| kline_row(symbol, interval, row, now))
            .collect()
    }

    async fn fetch_recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>, ProviderError> {
        let trades: Vec<RestTrade> = self
            .http
            .get_json(
                "/api/v3/trades",
                &[("symbol", symbol.to_string()), ("limit", limit.to_string())],
            )
            .await?;
        Ok(trades
            .into_iter()
            .map(|t| Trade {
                symbol: symbol.to_string(),
                price: t.price,
                quantity: t.qty,
                timestamp_ms: t.time,
                taker_side: Self::taker(t.is_buyer_maker),
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        let _: serde_json::Value = self.http.get_json("/api/v3/ping", &[]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::adapters::http::HttpClientConfig;

    fn provider() -> BinanceProvider {
        let http = HttpClient::new(HttpClientConfig {
            base_url: "https://api.binance.com".into(),
            timeout: Duration::from_secs(5),
            max_concurrent: 1,
        })
        .unwrap();
        BinanceProvider::new(http, "wss://stream.binance.com:9443/ws/", 20)
    }

    #[test]
    fn test_stream_names() {
        let p = provider();
        assert_eq!(p.stream_name(&FeedKey::ticker("BTCUSDT")), "btcusdt@ticker");
        assert_eq!(p.stream_name(&FeedKey::order_book("ETHUSDT")), "ethusdt@depth20@100ms");
        assert_eq!(
            p.stream_name(&FeedKey::klines("SOLUSDT", Interval::FourHours)),
            "solusdt@kline_4h"
        );
        assert_eq!(
            p.stream_endpoint(&FeedKey::trades("BTCUSDT")).unwrap().url,
            "wss://stream.binance.com:9443/ws/btcusdt@trade"
        );
    }

    #[test]
    fn test_ticker_frame_without_symbol_or_time() {
        let p = provider();
        let frame = r#"{"c":"50000.5","P":"2.3","v":"1200","h":"51000","l":"49500"}"#;
        let events = p.normalize(&FeedKey::ticker("BTCUSDT"), frame).unwrap();
        let MarketEvent::Ticker(t) = &events[0] else {
            panic!("expected ticker");
        };
        assert_eq!(t.symbol, "BTCUSDT");
        assert!((t.price - 50_000.5).abs() < 1e-9);
        assert!((t.change_pct - 2.3).abs() < 1e-9);
        assert!((t.volume - 1200.0).abs() < 1e-9);
        assert!((t.high - 51_000.0).abs() < 1e-9);
        assert!((t.low - 49_500.0).abs() < 1e-9);
        assert!(t.timestamp_ms > 0);
    }

    #[test]
    fn test_trade_maker_flag_maps_to_taker_side() {
        let p = provider();
        let frame = r#"{"e":"trade","E":1,"s":"BTCUSDT","t":7,"p":"64000.1","q":"0.5","T":1700000000000,"m":true}"#;
        let events = p.normalize(&FeedKey::trades("BTCUSDT"), frame).unwrap();
        let MarketEvent::Trade(t) = &events[0] else {
            panic!("expected trade");
        };
        assert_eq!(t.taker_side, TakerSide::Sell);
        assert_eq!(t.timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn test_depth_frame_is_sorted_and_truncated() {
        let p = BinanceProvider { stream_depth: 2, ..provider() };
        let frame = r#"{"lastUpdateId":1,"bids":[["99","1"],["100","2"],["98","1"]],"asks":[["102","1"],["101","3"],["103","1"]]}"#;
        let events = p.normalize(&FeedKey::order_book("BTCUSDT"), frame).unwrap();
        let MarketEvent::OrderBook(book) = &events[0] else {
            panic!("expected book");
        };
        assert_eq!(book.bids.len(), 2);
        assert!((book.best_bid().unwrap().price - 100.0).abs() < 1e-9);
        assert!((book.best_ask().unwrap().price - 101.0).abs() < 1e-9);
    }

    #[test]
    fn test_kline_frame() {
        let p = provider();
        let frame = r#"{"e":"kline","E":1,"s":"BTCUSDT","k":{"t":1700000000000,"T":1700000059999,"s":"BTCUSDT","i":"1m","o":"1","c":"2","h":"3","l":"0.5","v":"10","x":true}}"#;
        let events = p
            .normalize(&FeedKey::klines("BTCUSDT", Interval::OneMinute), frame)
            .unwrap();
        let MarketEvent::Kline(k) = &events[0] else {
            panic!("expected kline");
        };
        assert!(k.closed);
        assert_eq!(k.interval, "1m");
        assert!((k.close - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_garbage_frame_is_malformed() {
        let p = provider();
        let err = p.normalize(&FeedKey::ticker("BTCUSDT"), "{\"c\":\"x\"}").unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[test]
    fn test_kline_rest_row() {
        let row: Vec<serde_json::Value> = serde_json::from_str(
            r#"[1700000000000,"1.0","3.0","0.5","2.0","10.0",1700000059999,"20.0",5,"1","1","0"]"#,
        )
        .unwrap();
        let k = kline_row("BTCUSDT", Interval::OneMinute, &row, 1_800_000_000_000).unwrap();
        assert!(k.closed);
        assert!((k.high - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_pick_depth() {
        assert_eq!(pick_depth(&REST_DEPTHS, 30), 50);
        assert_eq!(pick_depth(&STREAM_DEPTHS, 50), 20);
        assert_eq!(pick_depth(&STREAM_DEPTHS, 1), 5);
    }
}
