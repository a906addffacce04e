//! Data Service - Consumer-Facing Facade
//!
//! The only entry point the rest of the application uses. Streams go
//! through the connection registry; REST lookups go cache -> rate
//! limiter -> fallback-selected provider -> cache.
//!
//! Each provider has its own rate limiter, so traffic diverted to the
//! fallback never spends the primary's budget.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::backoff::ReconnectPolicy;
use super::connection_registry::{ConnectionRegistry, Subscription};
use super::fallback_switch::{
    FallbackPolicy, FallbackSwitch, HealthSnapshot, ProviderMode, ProviderRole, Route,
};
use super::rate_limiter::RateLimiter;
use super::response_cache::ResponseCache;
use super::stream_connection::{Callback, ConnectionStatus, FeedInfo, StreamContext};
use crate::adapters::metrics::MetricsRegistry;
use crate::adapters::providers;
use crate::adapters::websocket::WsStreamSource;
use crate::config::{AppConfig, CacheConfig};
use crate::domain::{FeedKey, Interval, Kline, MarketEvent, OrderBook, Ticker, Trade};
use crate::error::{DataError, ProviderError};
use crate::ports::{MarketProvider, StreamSource};

/// Largest kline / trade page a caller may request.
const MAX_PAGE: usize = 1000;

/// Freshness windows per response kind.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    pub price: Duration,
    pub order_book: Duration,
    pub klines: Duration,
    pub trades: Duration,
    /// Background purge period; zero disables it.
    pub sweep_interval: Duration,
}

impl From<&CacheConfig> for CacheTtls {
    fn from(c: &CacheConfig) -> Self {
        Self {
            price: Duration::from_millis(c.price_ttl_ms),
            order_book: Duration::from_millis(c.order_book_ttl_ms),
            klines: Duration::from_millis(c.kline_ttl_ms),
            trades: Duration::from_millis(c.trades_ttl_ms),
            sweep_interval: Duration::from_millis(c.sweep_interval_ms),
        }
    }
}

struct ProviderSlot {
    provider: Arc<dyn MarketProvider>,
    limiter: RateLimiter,
}

/// Process-wide market data facade.
pub struct DataService {
    primary: ProviderSlot,
    fallback: ProviderSlot,
    switch: Arc<FallbackSwitch>,
    registry: Arc<ConnectionRegistry>,
    tickers: Arc<ResponseCache<String, Ticker>>,
    books: ResponseCache<String, OrderBook>,
    klines: ResponseCache<String, Vec<Kline>>,
    trades: ResponseCache<String, Vec<Trade>>,
    ttl: CacheTtls,
    metrics: Arc<MetricsRegistry>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl DataService {
    /// Build the service with the configured upstream adapters.
    ///
    /// Must be called inside a tokio runtime.
    pub fn init(config: &AppConfig, metrics: Arc<MetricsRegistry>) -> anyhow::Result<Arc<Self>> {
        let primary = providers::build(&config.providers.primary)?;
        let fallback = providers::build(&config.providers.fallback)?;
        info!(
            primary = primary.name(),
            fallback = fallback.name(),
            "Market data providers configured"
        );
        Ok(Self::with_components(
            config,
            primary,
            fallback,
            Arc::new(WsStreamSource::new()),
            metrics,
        ))
    }

    /// Build the service around explicit providers and transport.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_components(
        config: &AppConfig,
        primary: Arc<dyn MarketProvider>,
        fallback: Arc<dyn MarketProvider>,
        source: Arc<dyn StreamSource>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        let switch = Arc::new(FallbackSwitch::new(
            FallbackPolicy::from(&config.fallback),
            Arc::clone(&metrics),
        ));
        let ctx = Arc::new(StreamContext {
            source,
            primary: Arc::clone(&primary),
            fallback: Arc::clone(&fallback),
            switch: Arc::clone(&switch),
            policy: ReconnectPolicy::from(&config.stream),
            metrics: Arc::clone(&metrics),
        });
        let primary_rate = config.providers.primary.rate_limit;
        let fallback_rate = config.providers.fallback.rate_limit;

        let service = Arc::new(Self {
            primary: ProviderSlot {
                limiter: RateLimiter::new(primary.name(), primary_rate.limit, primary_rate.window()),
                provider: primary,
            },
            fallback: ProviderSlot {
                limiter: RateLimiter::new(fallback.name(), fallback_rate.limit, fallback_rate.window()),
                provider: fallback,
            },
            switch,
            registry: ConnectionRegistry::new(ctx),
            tickers: Arc::new(ResponseCache::new()),
            books: ResponseCache::new(),
            klines: ResponseCache::new(),
            trades: ResponseCache::new(),
            ttl: CacheTtls::from(&config.cache),
            metrics,
            background: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        });
        service.spawn_background();
        service
    }

    fn spawn_background(self: &Arc<Self>) {
        let mut tasks = Vec::with_capacity(2);

        let probe_every = (self.switch.policy().cooldown / 4).max(Duration::from_millis(250));
        tasks.push(tokio::spawn(recovery_loop(Arc::downgrade(self), probe_every)));

        if !self.ttl.sweep_interval.is_zero() {
            tasks.push(tokio::spawn(sweep_loop(
                Arc::downgrade(self),
                self.ttl.sweep_interval,
            )));
        }

        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
    }

    // ── Streams ────────────────────────────────────────────

    /// Subscribe a raw event callback to any feed.
    pub fn subscribe(&self, key: FeedKey, callback: Callback) -> Result<Subscription, DataError> {
        self.ensure_running()?;
        if key.symbol.is_empty() {
            return Err(DataError::InvalidRequest("empty symbol".into()));
        }
        self.registry.subscribe(key, callback)
    }

    /// Live ticker updates. Every update also refreshes the price cache.
    pub fn subscribe_price<F>(&self, symbol: &str, callback: F) -> Result<Subscription, DataError>
    where
        F: Fn(&Ticker) + Send + Sync + 'static,
    {
        let cache = Arc::clone(&self.tickers);
        let ttl = self.ttl.price;
        self.subscribe(
            FeedKey::ticker(symbol),
            Arc::new(move |event: &MarketEvent| {
                if let MarketEvent::Ticker(ticker) = event {
                    cache.set(ticker.symbol.clone(), ticker.clone(), ttl);
                    callback(ticker);
                }
            }),
        )
    }

    pub fn subscribe_trades<F>(&self, symbol: &str, callback: F) -> Result<Subscription, DataError>
    where
        F: Fn(&Trade) + Send + Sync + 'static,
    {
        self.subscribe(
            FeedKey::trades(symbol),
            Arc::new(move |event: &MarketEvent| {
                if let MarketEvent::Trade(trade) = event {
                    callback(trade);
                }
            }),
        )
    }

    pub fn subscribe_order_book<F>(&self, symbol: &str, callback: F) -> Result<Subscription, DataError>
    where
        F: Fn(&OrderBook) + Send + Sync + 'static,
    {
        self.subscribe(
            FeedKey::order_book(symbol),
            Arc::new(move |event: &MarketEvent| {
                if let MarketEvent::OrderBook(book) = event {
                    callback(book);
                }
            }),
        )
    }

    pub fn subscribe_klines<F>(
        &self,
        symbol: &str,
        interval: Interval,
        callback: F,
    ) -> Result<Subscription, DataError>
    where
        F: Fn(&Kline) + Send + Sync + 'static,
    {
        self.subscribe(
            FeedKey::klines(symbol, interval),
            Arc::new(move |event: &MarketEvent| {
                if let MarketEvent::Kline(kline) = event {
                    callback(kline);
                }
            }),
        )
    }

    // ── REST lookups ───────────────────────────────────────

    /// Last price, served from cache when fresh.
    pub async fn get_price(&self, symbol: &str) -> Result<f64, DataError> {
        Ok(self.get_ticker(symbol).await?.price)
    }

    /// Prices for several symbols, resolved concurrently, in input order.
    pub async fn get_prices(&self, symbols: &[&str]) -> Vec<Result<f64, DataError>> {
        join_all(symbols.iter().map(|s| self.get_price(s))).await
    }

    /// 24h ticker, served from cache when fresh.
    #[instrument(skip(self))]
    pub async fn get_ticker(&self, symbol: &str) -> Result<Ticker, DataError> {
        let symbol = canonical_symbol(symbol)?;
        if let Some(ticker) = self.cached("price", &self.tickers, &symbol) {
            return Ok(ticker);
        }

        let sym = symbol.as_str();
        let ticker = self
            .fetch("ticker", |p| async move { p.fetch_ticker(sym).await })
            .await?;
        self.tickers.set(symbol, ticker.clone(), self.ttl.price);
        Ok(ticker)
    }

    /// Order book snapshot with at most `depth` levels per side.
    #[instrument(skip(self))]
    pub async fn get_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, DataError> {
        let symbol = canonical_symbol(symbol)?;
        if depth == 0 || depth > MAX_PAGE {
            return Err(DataError::InvalidRequest(format!("depth {depth} out of range 1..={MAX_PAGE}")));
        }
        let key = format!("{symbol}:{depth}");
        if let Some(book) = self.cached("order_book", &self.books, &key) {
            return Ok(book);
        }

        let sym = symbol.as_str();
        let mut book = self
            .fetch("order_book", |p| async move { p.fetch_order_book(sym, depth).await })
            .await?;
        book.normalize(depth);
        self.books.set(key, book.clone(), self.ttl.order_book);
        Ok(book)
    }

    /// Most recent `limit` candles, oldest first.
    #[instrument(skip(self))]
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Kline>, DataError> {
        let symbol = canonical_symbol(symbol)?;
        check_page(limit)?;
        let key = format!("{symbol}:{interval}:{limit}");
        if let Some(klines) = self.cached("klines", &self.klines, &key) {
            return Ok(klines);
        }

        let sym = symbol.as_str();
        let klines = self
            .fetch("klines", |p| async move { p.fetch_klines(sym, interval, limit).await })
            .await?;
        self.klines.set(key, klines.clone(), self.ttl.klines);
        Ok(klines)
    }

    /// Most recent `limit` public trades, oldest first.
    #[instrument(skip(self))]
    pub async fn get_recent_trades(&self, symbol: &str, limit: usize) -> Result<Vec<Trade>, DataError> {
        let symbol = canonical_symbol(symbol)?;
        check_page(limit)?;
        let key = format!("{symbol}:{limit}");
        if let Some(trades) = self.cached("trades", &self.trades, &key) {
            return Ok(trades);
        }

        let sym = symbol.as_str();
        let trades = self
            .fetch("trades", |p| async move { p.fetch_recent_trades(sym, limit).await })
            .await?;
        self.trades.set(key, trades.clone(), self.ttl.trades);
        Ok(trades)
    }

    // ── Introspection ──────────────────────────────────────

    /// Last known price without any network call.
    pub fn cached_price(&self, symbol: &str) -> Option<f64> {
        let symbol = canonical_symbol(symbol).ok()?;
        self.tickers.get(&symbol).map(|t| t.price)
    }

    pub fn feed_status(&self, key: &FeedKey) -> Option<ConnectionStatus> {
        self.registry.status(key)
    }

    pub fn active_feeds(&self) -> Vec<FeedInfo> {
        self.registry.active_feeds()
    }

    pub fn provider_health(&self) -> HealthSnapshot {
        self.switch.snapshot()
    }

    pub fn provider_mode(&self) -> ProviderMode {
        self.switch.mode()
    }

    /// Shared switch, for readiness reporting.
    pub fn switch(&self) -> Arc<FallbackSwitch> {
        Arc::clone(&self.switch)
    }

    // ── Lifecycle ──────────────────────────────────────────

    /// Close every upstream stream and stop background work.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks = std::mem::take(
            &mut *self
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
        self.registry.shutdown().await;
        info!("Data service shut down");
    }

    fn ensure_running(&self) -> Result<(), DataError> {
        if self.shut_down.load(Ordering::SeqCst) {
            Err(DataError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn cached<V: Clone>(
        &self,
        cache: &'static str,
        store: &ResponseCache<String, V>,
        key: &str,
    ) -> Option<V> {
        let hit = store.get(key);
        let result = if hit.is_some() { "hit" } else { "miss" };
        self.metrics
            .cache_requests_total
            .with_label_values(&[cache, result])
            .inc();
        debug!(cache, key = %key, result, "Cache lookup");
        hit
    }

    const fn slot(&self, role: ProviderRole) -> &ProviderSlot {
        match role {
            ProviderRole::Primary => &self.primary,
            ProviderRole::Fallback => &self.fallback,
        }
    }

    /// Run `op` against the provider the switch selects.
    ///
    /// An outage on the primary counts against its health and the call
    /// is retried once on the fallback. Request-level errors are returned
    /// as `Rejected` without touching provider health.
    async fn fetch<T, F, Fut>(&self, endpoint: &'static str, op: F) -> Result<T, DataError>
    where
        F: Fn(Arc<dyn MarketProvider>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.ensure_running()?;

        let route = self.switch.route();
        if route != Route::Fallback {
            match self.call(ProviderRole::Primary, endpoint, &op).await {
                Ok(value) => {
                    self.switch.record_success(ProviderRole::Primary);
                    return Ok(value);
                }
                Err(e) if e.is_outage() => {
                    warn!(
                        endpoint,
                        provider = self.primary.provider.name(),
                        probe = route == Route::Probe,
                        error = %e,
                        "Primary provider failed, using fallback"
                    );
                    self.switch.record_failure(ProviderRole::Primary);
                }
                Err(e) => {
                    return Err(DataError::Rejected {
                        provider: self.primary.provider.name(),
                        source: e,
                    });
                }
            }
        }

        match self.call(ProviderRole::Fallback, endpoint, &op).await {
            Ok(value) => {
                self.switch.record_success(ProviderRole::Fallback);
                Ok(value)
            }
            Err(e) if e.is_outage() => {
                self.switch.record_failure(ProviderRole::Fallback);
                Err(DataError::Unavailable(format!(
                    "{endpoint}: no provider available, last error from {}: {e}",
                    self.fallback.provider.name()
                )))
            }
            Err(e) => Err(DataError::Rejected {
                provider: self.fallback.provider.name(),
                source: e,
            }),
        }
    }

    async fn call<T, F, Fut>(
        &self,
        role: ProviderRole,
        endpoint: &'static str,
        op: &F,
    ) -> Result<T, ProviderError>
    where
        F: Fn(Arc<dyn MarketProvider>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let slot = self.slot(role);
        let name = slot.provider.name();

        let waited = slot.limiter.acquire().await;
        self.metrics
            .rate_limit_wait
            .with_label_values(&[name])
            .observe(waited.as_secs_f64());

        let result = op(Arc::clone(&slot.provider)).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_outage() => "outage",
            Err(_) => "rejected",
        };
        self.metrics
            .rest_requests_total
            .with_label_values(&[name, endpoint, outcome])
            .inc();
        result
    }

    /// Ping the primary if a recovery probe is due.
    async fn probe_primary(&self) {
        if !self.switch.try_begin_probe() {
            return;
        }
        let ping = |p: Arc<dyn MarketProvider>| async move { p.ping().await };
        match self.call(ProviderRole::Primary, "ping", &ping).await {
            Ok(()) => self.switch.record_success(ProviderRole::Primary),
            Err(e) => {
                debug!(error = %e, "Primary recovery probe failed");
                self.switch.record_failure(ProviderRole::Primary);
            }
        }
    }

    fn sweep_caches(&self) -> usize {
        self.tickers.purge_expired()
            + self.books.purge_expired()
            + self.klines.purge_expired()
            + self.trades.purge_expired()
    }
}

async fn recovery_loop(service: Weak<DataService>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(service) = service.upgrade() else {
            break;
        };
        if service.switch.mode() == ProviderMode::Fallback {
            service.probe_primary().await;
        }
    }
}

async fn sweep_loop(service: Weak<DataService>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(service) = service.upgrade() else {
            break;
        };
        let purged = service.sweep_caches();
        if purged > 0 {
            debug!(purged, "Swept expired cache entries");
        }
    }
}

fn canonical_symbol(symbol: &str) -> Result<String, DataError> {
    let symbol = symbol.trim().to_ascii_uppercase();
    if symbol.is_empty() {
        return Err(DataError::InvalidRequest("empty symbol".into()));
    }
    Ok(symbol)
}

fn check_page(limit: usize) -> Result<(), DataError> {
    if limit == 0 || limit > MAX_PAGE {
        return Err(DataError::InvalidRequest(format!("limit {limit} out of range 1..={MAX_PAGE}")));
    }
    Ok(())
}
