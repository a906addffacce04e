//! In-memory stream source and provider for use case tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::domain::{FeedKey, Interval, Kline, MarketEvent, OrderBook, Ticker, Trade};
use crate::error::ProviderError;
use crate::ports::{MarketProvider, StreamEndpoint, StreamSession, StreamSource};

struct SessionState {
    endpoint: StreamEndpoint,
    frames_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    sent: AtomicUsize,
    consumed: AtomicUsize,
    closed: AtomicBool,
}

/// Test-side handle to one scripted upstream session.
#[derive(Clone)]
pub(crate) struct SessionHandle(Arc<SessionState>);

impl SessionHandle {
    pub(crate) fn endpoint(&self) -> StreamEndpoint {
        self.0.endpoint.clone()
    }

    /// Queue a text frame from "upstream".
    pub(crate) fn send(&self, frame: &str) {
        if let Some(tx) = self.0.frames_tx.lock().unwrap().as_ref() {
            if tx.send(frame.to_string()).is_ok() {
                self.0.sent.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Simulate the upstream dropping the connection.
    pub(crate) fn drop_stream(&self) {
        self.0.frames_tx.lock().unwrap().take();
    }

    /// Wait until every queued frame has been read and dispatched.
    pub(crate) async fn flush(&self) {
        for _ in 0..1000 {
            if self.0.consumed.load(Ordering::SeqCst) >= self.0.sent.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }
}

struct ScriptedSession {
    state: Arc<SessionState>,
    frames_rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl StreamSession for ScriptedSession {
    async fn next_text(&mut self) -> Option<anyhow::Result<String>> {
        let frame = self.frames_rx.recv().await?;
        self.state.consumed.fetch_add(1, Ordering::SeqCst);
        Some(Ok(frame))
    }

    async fn close(&mut self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// `StreamSource` whose sessions are driven by the test.
pub(crate) struct ScriptedSource {
    connects: AtomicUsize,
    fail: AtomicBool,
    sessions: Mutex<Vec<SessionHandle>>,
    opened: watch::Sender<usize>,
}

impl ScriptedSource {
    pub(crate) fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            sessions: Mutex::new(Vec::new()),
            opened: watch::channel(0).0,
        }
    }

    /// Connect attempts, successful or not.
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_connects(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn sessions(&self) -> Vec<SessionHandle> {
        self.sessions.lock().unwrap().clone()
    }

    /// Wait for the `index`-th successful connect.
    pub(crate) async fn wait_for_session(&self, index: usize) -> SessionHandle {
        let mut rx = self.opened.subscribe();
        rx.wait_for(|n| *n > index).await.unwrap();
        self.sessions.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl StreamSource for ScriptedSource {
    async fn connect(&self, endpoint: &StreamEndpoint) -> anyhow::Result<Box<dyn StreamSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(SessionState {
            endpoint: endpoint.clone(),
            frames_tx: Mutex::new(Some(tx)),
            sent: AtomicUsize::new(0),
            consumed: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        let count = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.push(SessionHandle(Arc::clone(&state)));
            sessions.len()
        };
        self.opened.send_replace(count);

        Ok(Box::new(ScriptedSession {
            state,
            frames_rx: rx,
        }))
    }
}

/// Frame carrying a bare price.
pub(crate) fn echo_price(price: f64) -> String {
    price.to_string()
}

/// Price carried by a ticker event.
pub(crate) fn price_of(event: &MarketEvent) -> f64 {
    match event {
        MarketEvent::Ticker(t) => t.price,
        _ => f64::NAN,
    }
}

/// Frame an `EchoProvider` treats as upstream refusing the feed.
pub(crate) const REFUSED: &str = "refused";

/// Provider whose frames are bare prices; `"bad"` is malformed.
pub(crate) struct EchoProvider {
    name: &'static str,
    open_streams: AtomicUsize,
}

impl EchoProvider {
    pub(crate) const fn new(name: &'static str) -> Self {
        Self {
            name,
            open_streams: AtomicUsize::new(0),
        }
    }

    /// Sessions between `stream_opened` and `stream_closed`.
    pub(crate) fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketProvider for EchoProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn stream_endpoint(&self, feed: &FeedKey) -> Result<StreamEndpoint, ProviderError> {
        Ok(StreamEndpoint {
            url: format!("{}://{feed}", self.name),
            subscribe: None,
        })
    }

    fn stream_opened(&self, _feed: &FeedKey) {
        self.open_streams.fetch_add(1, Ordering::SeqCst);
    }

    fn stream_closed(&self, _feed: &FeedKey) {
        self.open_streams.fetch_sub(1, Ordering::SeqCst);
    }

    fn normalize(&self, feed: &FeedKey, frame: &str) -> Result<Vec<MarketEvent>, ProviderError> {
        if frame == REFUSED {
            return Err(ProviderError::Unsupported(format!("{feed} refused")));
        }
        let price: f64 = frame
            .parse()
            .map_err(|_| ProviderError::Malformed(frame.to_string()))?;
        Ok(vec![MarketEvent::Ticker(Ticker {
            symbol: feed.symbol.clone(),
            price,
            change_pct: 0.0,
            volume: 0.0,
            high: price,
            low: price,
            timestamp_ms: 0,
        })])
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ProviderError> {
        Err(ProviderError::Unsupported(format!("ticker {symbol}")))
    }

    async fn fetch_order_book(&self, symbol: &str, _depth: usize) -> Result<OrderBook, ProviderError> {
        Err(ProviderError::Unsupported(format!("order book {symbol}")))
    }

    async fn fetch_klines(
        &self,
        symbol: &str,
        _interval: Interval,
        _limit: usize,
    ) -> Result<Vec<Kline>, ProviderError> {
        Err(ProviderError::Unsupported(format!("klines {symbol}")))
    }

    async fn fetch_recent_trades(&self, symbol: &str, _limit: usize) -> Result<Vec<Trade>, ProviderError> {
        Err(ProviderError::Unsupported(format!("trades {symbol}")))
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
