//! Shared fixtures for integration tests.
//!
//! `ScriptedSource` stands in for the WebSocket transport: every
//! connect produces a session whose frames the test pushes by hand.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use market_data_hub::config::loader::parse_config;
use market_data_hub::config::AppConfig;
use market_data_hub::domain::Ticker;
use market_data_hub::ports::{StreamEndpoint, StreamSession, StreamSource};

pub const CONFIG: &str = r#"
    [providers.primary]
    kind = "binance"
    rest_url = "http://127.0.0.1:9"
    ws_url = "ws://127.0.0.1:9/ws"
    rate_limit = { limit = 20, window_ms = 1000 }

    [providers.fallback]
    kind = "kraken"
    rest_url = "http://127.0.0.1:9"
    ws_url = "ws://127.0.0.1:9/v2"
    rate_limit = { limit = 20, window_ms = 1000 }

    [fallback]
    failure_threshold = 3
    cooldown_ms = 1000

    [cache]
    price_ttl_ms = 30000
    sweep_interval_ms = 0
"#;

pub fn config() -> AppConfig {
    parse_config(CONFIG).unwrap()
}

pub fn ticker(symbol: &str, price: f64) -> Ticker {
    Ticker {
        symbol: symbol.to_string(),
        price,
        change_pct: 0.0,
        volume: 0.0,
        high: price,
        low: price,
        timestamp_ms: 0,
    }
}

struct SessionState {
    endpoint: StreamEndpoint,
    frames_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    sent: AtomicUsize,
    consumed: AtomicUsize,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct SessionHandle(Arc<SessionState>);

impl SessionHandle {
    pub fn endpoint(&self) -> StreamEndpoint {
        self.0.endpoint.clone()
    }

    pub fn send(&self, frame: &str) {
        if let Some(tx) = self.0.frames_tx.lock().unwrap().as_ref() {
            if tx.send(frame.to_string()).is_ok() {
                self.0.sent.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Yield until every queued frame has been dispatched.
    pub async fn flush(&self) {
        for _ in 0..1000 {
            if self.0.consumed.load(Ordering::SeqCst) >= self.0.sent.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
    }

    /// Yield until the connection task has closed this session.
    pub async fn wait_closed(&self) -> bool {
        for _ in 0..1000 {
            if self.0.closed.load(Ordering::SeqCst) {
                return true;
            }
            tokio::task::yield_now().await;
        }
        false
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

pub struct ScriptedSource {
    connects: AtomicUsize,
    sessions: Mutex<Vec<SessionHandle>>,
    opened: watch::Sender<usize>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
            opened: watch::channel(0).0,
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub async fn wait_for_session(&self, index: usize) -> SessionHandle {
        let mut rx = self.opened.subscribe();
        rx.wait_for(|n| *n > index).await.unwrap();
        self.sessions.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl StreamSource for ScriptedSource {
    async fn connect(&self, endpoint: &StreamEndpoint) -> anyhow::Result<Box<dyn StreamSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
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
