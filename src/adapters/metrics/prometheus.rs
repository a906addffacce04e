//! Prometheus Metrics Registry - Distribution Layer Observability
//!
//! Registers and exposes Prometheus metrics on :9090. Covers stream
//! connection health, message throughput, reconnects, REST budget
//! pressure, cache effectiveness and the active provider.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tokio::sync::broadcast;
use tracing::{error, info, instrument};

/// Centralized Prometheus metrics for the market data service.
///
/// All metrics follow the naming convention `market_data_*`.
pub struct MetricsRegistry {
    registry: Registry,
    /// Stream connections currently open, by provider.
    pub connections_open: IntGaugeVec,
    /// Feeds with at least one subscriber.
    pub active_feeds: IntGauge,
    /// Normalized events dispatched, by provider and channel.
    pub messages_total: IntCounterVec,
    /// Frames that failed normalization, by provider.
    pub malformed_total: IntCounterVec,
    /// Reconnect attempts scheduled, by provider.
    pub reconnects_total: IntCounterVec,
    /// REST calls issued, by provider, endpoint and outcome.
    pub rest_requests_total: IntCounterVec,
    /// Cache lookups, by cache and result (hit/miss).
    pub cache_requests_total: IntCounterVec,
    /// Time spent waiting on the REST rate limiter (seconds).
    pub rate_limit_wait: HistogramVec,
    /// Active provider (0 = primary, 1 = fallback).
    pub provider_mode: IntGauge,
}

impl MetricsRegistry {
    /// Create and register all Prometheus metrics.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let connections_open = IntGaugeVec::new(
            Opts::new(
                "market_data_connections_open",
                "Upstream stream connections currently open",
            ),
            &["provider"],
        )?;

        let active_feeds = IntGauge::new(
            "market_data_active_feeds",
            "Feeds with at least one subscriber",
        )?;

        let messages_total = IntCounterVec::new(
            Opts::new(
                "market_data_messages_total",
                "Normalized stream events dispatched to subscribers",
            ),
            &["provider", "channel"],
        )?;

        let malformed_total = IntCounterVec::new(
            Opts::new(
                "market_data_malformed_total",
                "Stream frames dropped because they failed to normalize",
            ),
            &["provider"],
        )?;

        let reconnects_total = IntCounterVec::new(
            Opts::new("market_data_reconnects_total", "Stream reconnect attempts"),
            &["provider"],
        )?;

        let rest_requests_total = IntCounterVec::new(
            Opts::new("market_data_rest_requests_total", "Upstream REST calls"),
            &["provider", "endpoint", "outcome"],
        )?;

        let cache_requests_total = IntCounterVec::new(
            Opts::new("market_data_cache_requests_total", "Response cache lookups"),
            &["cache", "result"],
        )?;

        let rate_limit_wait = HistogramVec::new(
            HistogramOpts::new(
                "market_data_rate_limit_wait_seconds",
                "Time REST calls spent waiting for rate budget",
            )
            .buckets(vec![0.0, 0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
            &["provider"],
        )?;

        let provider_mode = IntGauge::new(
            "market_data_provider_mode",
            "Active provider (0=primary, 1=fallback)",
        )?;

        registry.register(Box::new(connections_open.clone()))?;
        registry.register(Box::new(active_feeds.clone()))?;
        registry.register(Box::new(messages_total.clone()))?;
        registry.register(Box::new(malformed_total.clone()))?;
        registry.register(Box::new(reconnects_total.clone()))?;
        registry.register(Box::new(rest_requests_total.clone()))?;
        registry.register(Box::new(cache_requests_total.clone()))?;
        registry.register(Box::new(rate_limit_wait.clone()))?;
        registry.register(Box::new(provider_mode.clone()))?;

        Ok(Self {
            registry,
            connections_open,
            active_feeds,
            messages_total,
            malformed_total,
            reconnects_total,
            rest_requests_total,
            cache_requests_total,
            rate_limit_wait,
            provider_mode,
        })
    }

    /// Render every registered metric in the text exposition format.
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Serve Prometheus metrics on the configured bind address.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn serve(
        self: Arc<Self>,
        bind_address: String,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let metrics_self = Arc::clone(&self);

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics_self);
                async move {
                    match metrics.render() {
                        Ok(body) => (StatusCode::OK, body),
                        Err(e) => {
                            error!(error = %e, "Failed to encode metrics");
                            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
                        }
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind(&bind_address).await?;
        info!(address = %bind_address, "Prometheus metrics server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }
}
