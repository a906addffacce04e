//! Market Data Hub — Entry Point
//!
//! Runs the data service as a standalone process: subscribes to the
//! feeds listed under `[watch]`, logs every event, and exposes metrics
//! and health probes. Runs until SIGINT.
//!
//! Wiring sequence:
//! 1. Load config (path from `MARKET_DATA_CONFIG`, default `config.toml`)
//! 2. Init tracing (JSON or pretty, `RUST_LOG` overrides the level)
//! 3. Build metrics registry + DataService (providers, limiters, registry)
//! 4. Subscribe the watched feeds
//! 5. Spawn metrics server and health server
//! 6. Wait for SIGINT → readiness 503 → drop subscriptions → shutdown

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use market_data_hub::adapters::metrics::{HealthServer, HealthState, MetricsRegistry};
use market_data_hub::config::{self, ServiceConfig};
use market_data_hub::domain::MarketEvent;
use market_data_hub::DataService;

const CONFIG_ENV: &str = "MARKET_DATA_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load configuration ───────────────────────────────
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "config.toml".to_string());
    let config = config::loader::load_config(&path).context("Failed to load configuration")?;

    // ── 2. Initialize structured logging ────────────────────
    init_tracing(&config.service);

    info!(
        name = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        config = %path,
        "Starting market data hub"
    );

    // ── 3. Metrics + data service ───────────────────────────
    let metrics = Arc::new(MetricsRegistry::new().context("Failed to create metrics registry")?);
    let service = DataService::init(&config, Arc::clone(&metrics))
        .context("Failed to initialize data service")?;

    let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(1);

    // ── 4. Subscribe watched feeds ──────────────────────────
    let mut subscriptions = Vec::new();
    for key in config.watch.feeds()? {
        let feed = key.to_string();
        let callback = Arc::new(move |event: &MarketEvent| log_event(&feed, event));
        match service.subscribe(key.clone(), callback) {
            Ok(sub) => subscriptions.push(sub),
            Err(e) => warn!(feed = %key, error = %e, "Failed to subscribe"),
        }
    }
    info!(feeds = subscriptions.len(), "Watched feeds subscribed");

    // ── 5. Metrics and health servers ───────────────────────
    let metrics_handle = config.metrics.enabled.then(|| {
        let rx = shutdown_tx.subscribe();
        let bind = config.metrics.bind_address.clone();
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            if let Err(e) = metrics.serve(bind, rx).await {
                error!(error = %e, "Metrics server failed");
            }
        })
    });

    let health = Arc::new(HealthState::new(service.switch()));
    let health_server = HealthServer::new(Arc::clone(&health), config.metrics.health_port);
    let health_rx = shutdown_tx.subscribe();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health_server.run(health_rx).await {
            error!(error = %e, "Health server failed");
        }
    });

    info!("Market data hub is running");

    // ── 6. Wait for SIGINT ──────────────────────────────────
    signal::ctrl_c().await.context("Failed to listen for SIGINT")?;
    info!("SIGINT received, initiating graceful shutdown");

    health.stop_accepting();
    drop(subscriptions);
    service.shutdown().await;

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), health_handle).await;
    if let Some(handle) = metrics_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(service: &ServiceConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&service.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if service.log_format == "pretty" {
        builder.pretty().init();
    } else {
        builder.json().init();
    }
}

fn log_event(feed: &str, event: &MarketEvent) {
    match event {
        MarketEvent::Ticker(t) => {
            info!(feed, price = t.price, change_pct = t.change_pct, "ticker");
        }
        MarketEvent::Trade(t) => {
            info!(feed, price = t.price, quantity = t.quantity, side = ?t.taker_side, "trade");
        }
        MarketEvent::OrderBook(b) => {
            info!(feed, bid = ?b.best_bid().map(|l| l.price), ask = ?b.best_ask().map(|l| l.price), "book");
        }
        MarketEvent::Kline(k) => {
            info!(feed, close = k.close, closed = k.closed, "kline");
        }
    }
}
