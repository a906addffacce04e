//! Kraken Provider - Fallback Market Data Source
//!
//! Streams use the v2 WebSocket API: one socket per feed, opened with a
//! `subscribe` request naming the channel and the `BASE/QUOTE` pair.
//! Book frames are incremental, so the provider keeps a local book per
//! symbol and emits the merged view after every snapshot or update.
//!
//! REST goes to `/0/public/*`, which wraps every response in an
//! `{"error": [...], "result": {...}}` envelope.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{flexible_f64, parse_num};
use crate::adapters::http::HttpClient;
use crate::domain::{
    now_ms, Channel, FeedKey, Interval, Kline, Level, MarketEvent, OrderBook, TakerSide, Ticker,
    Trade,
};
use crate::error::ProviderError;
use crate::ports::{MarketProvider, StreamEndpoint};

/// Quote currencies recognised when splitting a concatenated symbol.
const QUOTES: [&str; 7] = ["USDT", "USDC", "USD", "EUR", "GBP", "BTC", "ETH"];
/// Book depths the v2 `book` channel accepts.
const BOOK_DEPTHS: [usize; 5] = [10, 25, 100, 500, 1000];
/// Candle lengths (minutes) served by both the `ohlc` channel and `/OHLC`.
const OHLC_MINUTES: [u32; 8] = [1, 5, 15, 30, 60, 240, 1440, 10_080];

/// Split `BTCUSDT` into `("BTC", "USDT")`.
fn split_symbol(symbol: &str) -> Result<(&str, &str), ProviderError> {
    QUOTES
        .iter()
        .find_map(|quote| {
            symbol
                .strip_suffix(quote)
                .filter(|base| !base.is_empty())
                .map(|base| (base, *quote))
        })
        .ok_or_else(|| ProviderError::Unsupported(format!("symbol {symbol}")))
}

/// v2 stream pair, e.g. `BTC/USDT`.
pub fn ws_pair(symbol: &str) -> Result<String, ProviderError> {
    let (base, quote) = split_symbol(symbol)?;
    Ok(format!("{base}/{quote}"))
}

/// REST pair, e.g. `XBTUSDT`. Kraken still names bitcoin `XBT` there.
pub fn rest_pair(symbol: &str) -> Result<String, ProviderError> {
    let (base, quote) = split_symbol(symbol)?;
    let rename = |asset: &str| if asset == "BTC" { "XBT".to_string() } else { asset.to_string() };
    Ok(format!("{}{}", rename(base), rename(quote)))
}

fn ohlc_minutes(interval: Interval) -> Result<u32, ProviderError> {
    let minutes = interval.minutes();
    if OHLC_MINUTES.contains(&minutes) {
        Ok(minutes)
    } else {
        Err(ProviderError::Unsupported(format!("{interval} candles")))
    }
}

fn rfc3339_ms(raw: &str) -> Result<u64, ProviderError> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .and_then(|t| u64::try_from(t.timestamp_millis()).ok())
        .ok_or_else(|| ProviderError::Malformed(format!("timestamp `{raw}`")))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn seconds_to_ms(seconds: f64) -> u64 {
    (seconds * 1000.0).round().max(0.0) as u64
}

// ---------------------------------------------------------------------------
// Stream frames
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WsFrame {
    channel: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Vec<Value>,
    method: Option<String>,
    success: Option<bool>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsTicker {
    #[serde(deserialize_with = "flexible_f64")]
    last: f64,
    #[serde(deserialize_with = "flexible_f64")]
    volume: f64,
    #[serde(deserialize_with = "flexible_f64")]
    high: f64,
    #[serde(deserialize_with = "flexible_f64")]
    low: f64,
    #[serde(deserialize_with = "flexible_f64")]
    change_pct: f64,
}

#[derive(Debug, Deserialize)]
struct WsTrade {
    side: String,
    #[serde(deserialize_with = "flexible_f64")]
    price: f64,
    #[serde(deserialize_with = "flexible_f64")]
    qty: f64,
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct WsLevel {
    #[serde(deserialize_with = "flexible_f64")]
    price: f64,
    #[serde(deserialize_with = "flexible_f64")]
    qty: f64,
}

#[derive(Debug, Deserialize)]
struct WsBook {
    #[serde(default)]
    bids: Vec<WsLevel>,
    #[serde(default)]
    asks: Vec<WsLevel>,
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsCandle {
    #[serde(deserialize_with = "flexible_f64")]
    open: f64,
    #[serde(deserialize_with = "flexible_f64")]
    high: f64,
    #[serde(deserialize_with = "flexible_f64")]
    low: f64,
    #[serde(deserialize_with = "flexible_f64")]
    close: f64,
    #[serde(deserialize_with = "flexible_f64")]
    volume: f64,
    interval_begin: String,
}

/// Locally maintained book for one symbol, keyed by price bits.
#[derive(Debug, Default)]
struct LocalBook {
    bids: HashMap<u64, Level>,
    asks: HashMap<u64, Level>,
    /// Open stream sessions reading this book.
    sessions: usize,
}

impl LocalBook {
    fn apply(side: &mut HashMap<u64, Level>, levels: &[WsLevel]) {
        for l in levels {
            if l.qty <= 0.0 {
                side.remove(&l.price.to_bits());
            } else {
                side.insert(
                    l.price.to_bits(),
                    Level {
                        price: l.price,
                        quantity: l.qty,
                    },
                );
            }
        }
    }

    /// Trim to the `keep` levels Kraken maintains for the subscription,
    /// then return the top `emit` of them.
    fn view(&mut self, symbol: &str, keep: usize, emit: usize, timestamp_ms: u64) -> OrderBook {
        let mut book = OrderBook {
            symbol: symbol.to_string(),
            bids: self.bids.values().copied().collect(),
            asks: self.asks.values().copied().collect(),
            timestamp_ms,
        };
        book.normalize(keep);
        // Levels outside the subscribed depth are no longer maintained upstream.
        if self.bids.len() > book.bids.len() {
            self.bids = book.bids.iter().map(|l| (l.price.to_bits(), *l)).collect();
        }
        if self.asks.len() > book.asks.len() {
            self.asks = book.asks.iter().map(|l| (l.price.to_bits(), *l)).collect();
        }
        book.bids.truncate(emit);
        book.asks.truncate(emit);
        book
    }
}

// ---------------------------------------------------------------------------
// REST payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    error: Vec<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct RestTicker {
    /// Last trade `[price, lot volume]`.
    c: Vec<String>,
    /// Volume `[today, last 24h]`.
    v: Vec<String>,
    h: Vec<String>,
    l: Vec<String>,
    /// Today's opening price.
    o: String,
}

#[derive(Debug, Deserialize)]
struct RestDepth {
    bids: Vec<Vec<Value>>,
    asks: Vec<Vec<Value>>,
}

fn value_f64(value: Option<&Value>, field: &str) -> Result<f64, ProviderError> {
    match value {
        Some(Value::String(s)) => parse_num(s, field),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| ProviderError::Malformed(format!("{field} out of range"))),
        _ => Err(ProviderError::Malformed(format!("missing {field}"))),
    }
}

fn nth(values: &[String], idx: usize, field: &str) -> Result<f64, ProviderError> {
    values
        .get(idx)
        .ok_or_else(|| ProviderError::Malformed(format!("missing {field}")))
        .and_then(|raw| parse_num(raw, field))
}

fn rest_levels(rows: &[Vec<Value>], side: &str) -> Result<Vec<Level>, ProviderError> {
    rows.iter()
        .map(|row| {
            Ok(Level {
                price: value_f64(row.first(), side)?,
                quantity: value_f64(row.get(1), side)?,
            })
        })
        .collect()
}

/// Map Kraken's error strings onto the shared taxonomy.
fn envelope_error(errors: &[String]) -> ProviderError {
    let joined = errors.join("; ");
    if errors
        .iter()
        .any(|e| e.starts_with("EService") || e.starts_with("EAPI:Rate"))
    {
        ProviderError::Unavailable(joined)
    } else {
        ProviderError::Upstream(joined)
    }
}

/// Take the single per-pair entry out of a `result` object.
fn pair_entry<T: DeserializeOwned>(result: HashMap<String, Value>) -> Result<T, ProviderError> {
    let value = result
        .into_iter()
        .find(|(k, _)| k != "last")
        .map(|(_, v)| v)
        .ok_or_else(|| ProviderError::Malformed("empty result".into()))?;
    Ok(serde_json::from_value(value)?)
}

/// Kraken spot market data.
pub struct KrakenProvider {
    http: HttpClient,
    ws_url: String,
    stream_depth: usize,
    books: Mutex<HashMap<String, LocalBook>>,
}

impl KrakenProvider {
    /// `ws_url` is the v2 endpoint, e.g. `wss://ws.kraken.com/v2`.
    pub fn new(http: HttpClient, ws_url: &str, stream_depth: usize) -> Self {
        Self {
            http,
            ws_url: ws_url.trim_end_matches('/').to_string(),
            stream_depth,
            books: Mutex::new(HashMap::new()),
        }
    }

    fn book_depth(&self) -> usize {
        BOOK_DEPTHS
            .iter()
            .copied()
            .find(|&d| d >= self.stream_depth)
            .unwrap_or(1000)
    }

    fn books(&self) -> MutexGuard<'_, HashMap<String, LocalBook>> {
        self.books.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe request for `feed`.
    pub fn subscribe_frame(&self, feed: &FeedKey) -> Result<String, ProviderError> {
        let symbol = [ws_pair(&feed.symbol)?];
        let params = match feed.channel {
            Channel::Ticker => json!({ "channel": "ticker", "symbol": symbol }),
            Channel::Trade => json!({ "channel": "trade", "symbol": symbol }),
            Channel::OrderBook => {
                json!({ "channel": "book", "symbol": symbol, "depth": self.book_depth() })
            }
            Channel::Kline(interval) => {
                json!({ "channel": "ohlc", "symbol": symbol, "interval": ohlc_minutes(interval)? })
            }
        };
        Ok(json!({ "method": "subscribe", "params": params }).to_string())
    }

    async fn public<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let envelope: Envelope<T> = self.http.get_json(path, query).await?;
        if !envelope.error.is_empty() {
            return Err(envelope_error(&envelope.error));
        }
        envelope
            .result
            .ok_or_else(|| ProviderError::Malformed(format!("{path}: missing result")))
    }

    fn decode<T: DeserializeOwned>(data: Vec<Value>) -> Result<Vec<T>, ProviderError> {
        data.into_iter()
            .map(|v| serde_json::from_value(v).map_err(ProviderError::from))
            .collect()
    }

    fn book_events(
        &self,
        feed: &FeedKey,
        snapshot: bool,
        data: Vec<Value>,
    ) -> Result<Vec<MarketEvent>, ProviderError> {
        let frames: Vec<WsBook> = Self::decode(data)?;
        let keep = self.book_depth();
        let emit = self.stream_depth.max(1);
        let mut books = self.books();
        let local = books.entry(feed.symbol.clone()).or_default();
        if snapshot {
            local.bids.clear();
            local.asks.clear();
        }

        frames
            .into_iter()
            .map(|frame| {
                LocalBook::apply(&mut local.bids, &frame.bids);
                LocalBook::apply(&mut local.asks, &frame.asks);
                let ts = match frame.timestamp.as_deref() {
                    Some(raw) => rfc3339_ms(raw)?,
                    None => now_ms(),
                };
                Ok(MarketEvent::OrderBook(local.view(&feed.symbol, keep, emit, ts)))
            })
            .collect()
    }
}

#[async_trait]
impl MarketProvider for KrakenProvider {
    fn name(&self) -> &'static str {
        "kraken"
    }

    fn stream_endpoint(&self, feed: &FeedKey) -> Result<StreamEndpoint, ProviderError> {
        Ok(StreamEndpoint {
            url: self.ws_url.clone(),
            subscribe: Some(self.subscribe_frame(feed)?),
        })
    }

    fn stream_opened(&self, feed: &FeedKey) {
        if feed.channel == Channel::OrderBook {
            self.books().entry(feed.symbol.clone()).or_default().sessions += 1;
        }
    }

    fn stream_closed(&self, feed: &FeedKey) {
        if feed.channel != Channel::OrderBook {
            return;
        }
        let mut books = self.books();
        if let Some(local) = books.get_mut(&feed.symbol) {
            local.sessions = local.sessions.saturating_sub(1);
            if local.sessions == 0 {
                books.remove(&feed.symbol);
            }
        }
    }

    fn normalize(&self, feed: &FeedKey, frame: &str) -> Result<Vec<MarketEvent>, ProviderError> {
        let frame: WsFrame = serde_json::from_str(frame)?;

        if frame.method.is_some() {
            if frame.success == Some(false) {
                // Kraken will not serve this feed.
                return Err(ProviderError::Unsupported(
                    frame.error.unwrap_or_else(|| "subscription refused".into()),
                ));
            }
            debug!(feed = %feed, method = ?frame.method, "Kraken ack");
            return Ok(Vec::new());
        }

        let channel = frame.channel.as_deref().unwrap_or_default();
        let symbol = &feed.symbol;
        match (channel, feed.channel) {
            ("ticker", Channel::Ticker) => Ok(Self::decode::<WsTicker>(frame.data)?
                .into_iter()
                .map(|t| {
                    MarketEvent::Ticker(Ticker {
                        symbol: symbol.clone(),
                        price: t.last,
                        change_pct: t.change_pct,
                        volume: t.volume,
                        high: t.high,
                        low: t.low,
                        timestamp_ms: now_ms(),
                    })
                })
                .collect()),
            ("trade", Channel::Trade) => Self::decode::<WsTrade>(frame.data)?
                .into_iter()
                .map(|t| {
                    Ok(MarketEvent::Trade(Trade {
                        symbol: symbol.clone(),
                        price: t.price,
                        quantity: t.qty,
                        timestamp_ms: rfc3339_ms(&t.timestamp)?,
                        taker_side: if t.side == "sell" { TakerSide::Sell } else { TakerSide::Buy },
                    }))
                })
                .collect(),
            ("book", Channel::OrderBook) => {
                self.book_events(feed, frame.kind.as_deref() == Some("snapshot"), frame.data)
            }
            ("ohlc", Channel::Kline(interval)) => Self::decode::<WsCandle>(frame.data)?
                .into_iter()
                .map(|c| {
                    Ok(MarketEvent::Kline(Kline {
                        symbol: symbol.clone(),
                        interval: interval.as_str().to_string(),
                        open_time_ms: rfc3339_ms(&c.interval_begin)?,
                        open: c.open,
                        high: c.high,
                        low: c.low,
                        close: c.close,
                        volume: c.volume,
                        closed: false,
                    }))
                })
                .collect(),
            // heartbeat, status and anything not addressed to this feed
            _ => Ok(Vec::new()),
        }
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ProviderError> {
        let result: HashMap<String, Value> = self
            .public("/0/public/Ticker", &[("pair", rest_pair(symbol)?)])
            .await?;
        let t: RestTicker = pair_entry(result)?;

        let price = nth(&t.c, 0, "last")?;
        let open = parse_num(&t.o, "open")?;
        let change_pct = if open > 0.0 { (price - open) / open * 100.0 } else { 0.0 };

        Ok(Ticker {
            symbol: symbol.to_string(),
            price,
            change_pct,
            volume: nth(&t.v, 1, "volume")?,
            high: nth(&t.h, 1, "high")?,
            low: nth(&t.l, 1, "low")?,
            timestamp_ms: now_ms(),
        })
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, ProviderError> {
        let result: HashMap<String, Value> = self
            .public(
                "/0/public/Depth",
                &[("pair", rest_pair(symbol)?), ("count", depth.max(1).to_string())],
            )
            .await?;
        let raw: RestDepth = pair_entry(result)?;

        let mut book = OrderBook {
            symbol: symbol.to_string(),
            bids: rest_levels(&raw.bids, "bid")?,
            asks: rest_levels(&raw.asks, "ask")?,
            timestamp_ms: now_ms(),
        };
        book.normalize(depth);
        Ok(book)
    }

    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Kline>, ProviderError> {
        let minutes = ohlc_minutes(interval)?;
        let result: HashMap<String, Value> = self
            .public(
                "/0/public/OHLC",
                &[("pair", rest_pair(symbol)?), ("interval", minutes.to_string())],
            )
            .await?;
        let rows: Vec<Vec<Value>> = pair_entry(result)?;

        let skip = rows.len().saturating_sub(limit);
        let last = rows.len().saturating_sub(1);
        rows.iter()
            .enumerate()
            .skip(skip)
            .map(|(idx, row)| {
                let open_secs = row
                    .first()
                    .and_then(Value::as_u64)
                    .ok_or_else(|| ProviderError::Malformed("ohlc time".into()))?;
                Ok(Kline {
                    symbol: symbol.to_string(),
                    interval: interval.as_str().to_string(),
                    open_time_ms: open_secs * 1000,
                    open: value_f64(row.get(1), "open")?,
                    high: value_f64(row.get(2), "high")?,
                    low: value_f64(row.get(3), "low")?,
                    close: value_f64(row.get(4), "close")?,
                    volume: value_f64(row.get(6), "volume")?,
                    // The newest candle is still forming.
                    closed: idx != last,
                })
            })
            .collect()
    }

    async fn fetch_recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>, ProviderError> {
        let result: HashMap<String, Value> = self
            .public(
                "/0/public/Trades",
                &[("pair", rest_pair(symbol)?), ("count", limit.max(1).to_string())],
            )
            .await?;
        let rows: Vec<Vec<Value>> = pair_entry(result)?;

        let skip = rows.len().saturating_sub(limit);
        rows.iter()
            .skip(skip)
            .map(|row| {
                Ok(Trade {
                    symbol: symbol.to_string(),
                    price: value_f64(row.first(), "price")?,
                    quantity: value_f64(row.get(1), "volume")?,
                    timestamp_ms: seconds_to_ms(value_f64(row.get(2), "time")?),
                    taker_side: match row.get(3).and_then(Value::as_str) {
                        Some("s") => TakerSide::Sell,
                        _ => TakerSide::Buy,
                    },
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        let _: Value = self.public("/0/public/Time", &[]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::adapters::http::HttpClientConfig;

    fn provider(depth: usize) -> KrakenProvider {
        let http = HttpClient::new(HttpClientConfig {
            base_url: "https://api.kraken.com".into(),
            timeout: Duration::from_secs(5),
            max_concurrent: 1,
        })
        .unwrap();
        KrakenProvider::new(http, "wss://ws.kraken.com/v2", depth)
    }

    #[test]
    fn test_pair_mapping() {
        assert_eq!(ws_pair("BTCUSDT").unwrap(), "BTC/USDT");
        assert_eq!(ws_pair("ETHUSD").unwrap(), "ETH/USD");
        assert_eq!(rest_pair("BTCUSDT").unwrap(), "XBTUSDT");
        assert_eq!(rest_pair("ETHBTC").unwrap(), "ETHXBT");
        assert!(matches!(ws_pair("USDT"), Err(ProviderError::Unsupported(_))));
    }

    #[test]
    fn test_subscribe_frames() {
        let p = provider(20);
        let frame: Value =
            serde_json::from_str(&p.subscribe_frame(&FeedKey::order_book("BTCUSDT")).unwrap()).unwrap();
        assert_eq!(frame["method"], "subscribe");
        assert_eq!(frame["params"]["channel"], "book");
        assert_eq!(frame["params"]["symbol"][0], "BTC/USDT");
        assert_eq!(frame["params"]["depth"], 25);

        let kline = FeedKey::klines("BTCUSDT", Interval::FourHours);
        let frame: Value = serde_json::from_str(&p.subscribe_frame(&kline).unwrap()).unwrap();
        assert_eq!(frame["params"]["interval"], 240);

        let unsupported = FeedKey::klines("BTCUSDT", Interval::ThreeMinutes);
        assert!(matches!(
            p.stream_endpoint(&unsupported),
            Err(ProviderError::Unsupported(_))
        ));
    }

    #[test]
    fn test_control_frames_yield_nothing() {
        let p = provider(10);
        let feed = FeedKey::ticker("BTCUSDT");
        assert!(p.normalize(&feed, r#"{"channel":"heartbeat"}"#).unwrap().is_empty());
        assert!(p
            .normalize(&feed, r#"{"method":"subscribe","success":true,"result":{"channel":"ticker"}}"#)
            .unwrap()
            .is_empty());
        let err = p
            .normalize(&feed, r#"{"method":"subscribe","success":false,"error":"Currency pair not supported"}"#)
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(ref why) if why == "Currency pair not supported"));
    }

    #[test]
    fn test_ticker_frame() {
        let p = provider(10);
        let frame = r#"{"channel":"ticker","type":"update","data":[{"symbol":"BTC/USDT","bid":49999.0,"ask":50001.0,"last":50000.5,"volume":321.5,"vwap":49800.0,"low":49500.0,"high":51000.0,"change":1125.0,"change_pct":2.3}]}"#;
        let events = p.normalize(&FeedKey::ticker("BTCUSDT"), frame).unwrap();
        let MarketEvent::Ticker(t) = &events[0] else {
            panic!("expected ticker");
        };
        assert_eq!(t.symbol, "BTCUSDT");
        assert!((t.price - 50_000.5).abs() < 1e-9);
        assert!((t.change_pct - 2.3).abs() < 1e-9);
    }

    #[test]
    fn test_trade_frame_carries_multiple_prints() {
        let p = provider(10);
        let frame = r#"{"channel":"trade","type":"update","data":[
            {"symbol":"BTC/USDT","side":"buy","price":50000.0,"qty":0.1,"ord_type":"market","trade_id":1,"timestamp":"2024-01-01T00:00:00.000Z"},
            {"symbol":"BTC/USDT","side":"sell","price":49999.0,"qty":0.2,"ord_type":"limit","trade_id":2,"timestamp":"2024-01-01T00:00:01.500Z"}
        ]}"#;
        let events = p.normalize(&FeedKey::trades("BTCUSDT"), frame).unwrap();
        assert_eq!(events.len(), 2);
        let MarketEvent::Trade(second) = &events[1] else {
            panic!("expected trade");
        };
        assert_eq!(second.taker_side, TakerSide::Sell);
        assert_eq!(second.timestamp_ms, 1_704_067_201_500);
    }

    #[test]
    fn test_book_snapshot_then_updates() {
        let p = provider(2);
        let feed = FeedKey::order_book("BTCUSDT");
        let snapshot = r#"{"channel":"book","type":"snapshot","data":[{"symbol":"BTC/USDT",
            "bids":[{"price":100.0,"qty":1.0},{"price":99.0,"qty":2.0}],
            "asks":[{"price":101.0,"qty":1.0},{"price":102.0,"qty":3.0}],"checksum":1}]}"#;
        p.normalize(&feed, snapshot).unwrap();

        let update = r#"{"channel":"book","type":"update","data":[{"symbol":"BTC/USDT",
            "bids":[{"price":100.0,"qty":0.0},{"price":99.5,"qty":4.0}],
            "asks":[],"checksum":2,"timestamp":"2024-01-01T00:00:00.000Z"}]}"#;
        let events = p.normalize(&feed, update).unwrap();
        let MarketEvent::OrderBook(book) = &events[0] else {
            panic!("expected book");
        };
        assert_eq!(book.bids.len(), 2);
        assert!((book.best_bid().unwrap().price - 99.5).abs() < 1e-9);
        assert!((book.best_ask().unwrap().price - 101.0).abs() < 1e-9);
        assert_eq!(book.timestamp_ms, 1_704_067_200_000);
    }

    #[test]
    fn test_book_keeps_levels_beyond_emitted_depth() {
        // Subscribed at depth 10, emitting 2: the third level must survive a removal above it.
        let p = provider(2);
        let feed = FeedKey::order_book("BTCUSDT");
        let snapshot = r#"{"channel":"book","type":"snapshot","data":[{"symbol":"BTC/USDT",
            "bids":[{"price":100.0,"qty":1.0},{"price":99.0,"qty":2.0},{"price":98.0,"qty":3.0}],
            "asks":[{"price":101.0,"qty":1.0}],"checksum":1}]}"#;
        let events = p.normalize(&feed, snapshot).unwrap();
        let MarketEvent::OrderBook(book) = &events[0] else {
            panic!("expected book");
        };
        assert_eq!(book.bids.len(), 2);

        let update = r#"{"channel":"book","type":"update","data":[{"symbol":"BTC/USDT",
            "bids":[{"price":100.0,"qty":0.0}],"asks":[],"checksum":2}]}"#;
        let events = p.normalize(&feed, update).unwrap();
        let MarketEvent::OrderBook(book) = &events[0] else {
            panic!("expected book");
        };
        let prices: Vec<f64> = book.bids.iter().map(|l| l.price).collect();
        assert_eq!(prices, vec![99.0, 98.0]);
    }

    #[test]
    fn test_local_book_trimmed_to_subscribed_depth() {
        let p = provider(2);
        let feed = FeedKey::order_book("BTCUSDT");
        let bids: Vec<String> = (0..15)
            .map(|i| format!(r#"{{"price":{}.0,"qty":1.0}}"#, 200 - i))
            .collect();
        let snapshot = format!(
            r#"{{"channel":"book","type":"snapshot","data":[{{"symbol":"BTC/USDT","bids":[{}],"asks":[],"checksum":1}}]}}"#,
            bids.join(",")
        );
        p.normalize(&feed, &snapshot).unwrap();
        assert_eq!(p.books()["BTCUSDT"].bids.len(), 10);
    }

    #[test]
    fn test_book_released_when_last_session_closes() {
        let p = provider(10);
        let feed = FeedKey::order_book("BTCUSDT");
        let snapshot = r#"{"channel":"book","type":"snapshot","data":[{"symbol":"BTC/USDT",
            "bids":[{"price":100.0,"qty":1.0}],"asks":[{"price":101.0,"qty":1.0}],"checksum":1}]}"#;

        // Old session still closing while the new one has started.
        p.stream_opened(&feed);
        p.stream_opened(&feed);
        p.normalize(&feed, snapshot).unwrap();
        p.stream_closed(&feed);
        assert_eq!(p.books()["BTCUSDT"].bids.len(), 1);

        p.stream_closed(&feed);
        assert!(p.books().is_empty());

        // Other channels never touch the book map.
        p.stream_closed(&FeedKey::ticker("BTCUSDT"));
        assert!(p.books().is_empty());
    }

    #[test]
    fn test_snapshot_replaces_previous_levels() {
        let p = provider(10);
        let feed = FeedKey::order_book("BTCUSDT");
        let first = r#"{"channel":"book","type":"snapshot","data":[{"symbol":"BTC/USDT",
            "bids":[{"price":100.0,"qty":1.0}],"asks":[],"checksum":1}]}"#;
        let second = r#"{"channel":"book","type":"snapshot","data":[{"symbol":"BTC/USDT",
            "bids":[{"price":90.0,"qty":1.0}],"asks":[],"checksum":2}]}"#;
        p.stream_opened(&feed);
        p.normalize(&feed, first).unwrap();
        let events = p.normalize(&feed, second).unwrap();
        let MarketEvent::OrderBook(book) = &events[0] else {
            panic!("expected book");
        };
        assert_eq!(book.bids.len(), 1);
        assert!((book.bids[0].price - 90.0).abs() < 1e-9);
        assert_eq!(p.books()["BTCUSDT"].sessions, 1);
    }

    #[test]
    fn test_frames_for_other_channels_are_ignored() {
        let p = provider(10);
        let frame = r#"{"channel":"trade","type":"update","data":[]}"#;
        assert!(p.normalize(&FeedKey::ticker("BTCUSDT"), frame).unwrap().is_empty());
    }

    #[test]
    fn test_envelope_error_mapping() {
        assert!(matches!(
            envelope_error(&["EService:Unavailable".into()]),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            envelope_error(&["EAPI:Rate limit exceeded".into()]),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            envelope_error(&["EQuery:Unknown asset pair".into()]),
            ProviderError::Upstream(_)
        ));
    }

    #[test]
    fn test_pair_entry_skips_last_cursor() {
        let result: HashMap<String, Value> =
            serde_json::from_str(r#"{"XXBTZUSD":[[1700000000,"1","2","0.5","1.5","1.2","10",5]],"last":1700000000}"#)
                .unwrap();
        let rows: Vec<Vec<Value>> = pair_entry(result).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
