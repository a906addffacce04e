//! Configuration Module - TOML-based Service Configuration
//!
//! Loads and validates configuration from `config.toml`. Provider
//! endpoints, rate budgets, reconnect policy, fallback thresholds and
//! cache TTLs are all externalized here; the use cases only ever see
//! the typed policies derived from these sections.

pub mod loader;

use std::time::Duration;

use serde::Deserialize;

use crate::domain::{Channel, FeedKey, Interval};

/// Top-level service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  /// Service identity and logging.
  #[serde(default)]
  pub service: ServiceConfig,
  /// Primary and secondary upstream providers.
  pub providers: ProvidersConfig,
  /// Reconnect / liveness policy shared by every feed.
  #[serde(default)]
  pub stream: StreamConfig,
  /// Provider failover policy.
  #[serde(default)]
  pub fallback: FallbackConfig,
  /// Response cache TTLs.
  #[serde(default)]
  pub cache: CacheConfig,
  /// Metrics and health endpoints.
  #[serde(default)]
  pub metrics: MetricsConfig,
  /// Feeds the runner binary subscribes to at startup.
  #[serde(default)]
  pub watch: WatchConfig,
}

/// Service identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
  /// Human-readable service name.
  #[serde(default = "default_service_name")]
  pub name: String,
  /// Log level (trace, debug, info, warn, error).
  #[serde(default = "default_log_level")]
  pub log_level: String,
  /// `json` (default) or `pretty`.
  #[serde(default = "default_log_format")]
  pub log_format: String,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      name: default_service_name(),
      log_level: default_log_level(),
      log_format: default_log_format(),
    }
  }
}

/// Upstream provider pair.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
  pub primary: ProviderConfig,
  pub fallback: ProviderConfig,
}

/// Supported upstream implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
  Binance,
  Kraken,
}

/// One upstream provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
  pub kind: ProviderKind,
  /// REST API base URL.
  pub rest_url: String,
  /// WebSocket base URL.
  pub ws_url: String,
  /// REST request timeout (milliseconds).
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
  /// Maximum in-flight REST requests.
  #[serde(default = "default_max_concurrent")]
  pub max_concurrent: usize,
  /// Levels per side requested on order book streams.
  #[serde(default = "default_stream_depth")]
  pub stream_depth: usize,
  /// REST admission budget for this provider.
  pub rate_limit: RateLimitConfig,
}

/// Sliding-window REST budget: `limit` requests per `window_ms`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
  pub limit: usize,
  pub window_ms: u64,
}

impl RateLimitConfig {
  pub const fn window(&self) -> Duration {
    Duration::from_millis(self.window_ms)
  }
}

/// Reconnect and liveness policy.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
  /// Delay before the first reconnect (milliseconds).
  #[serde(default = "default_base_delay")]
  pub base_delay_ms: u64,
  /// Cap on the reconnect delay (milliseconds).
  #[serde(default = "default_max_delay")]
  pub max_delay_ms: u64,
  /// Reconnect attempts before the failure is reported as terminal.
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  /// Fraction of each delay that may be shaved off at random.
  #[serde(default = "default_jitter_ratio")]
  pub jitter_ratio: f64,
  /// Silence on an open stream longer than this counts as a stall.
  #[serde(default = "default_heartbeat_timeout")]
  pub heartbeat_timeout_ms: u64,
  /// How often the stall check runs.
  #[serde(default = "default_heartbeat_check")]
  pub heartbeat_check_ms: u64,
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self {
      base_delay_ms: default_base_delay(),
      max_delay_ms: default_max_delay(),
      max_attempts: default_max_attempts(),
      jitter_ratio: default_jitter_ratio(),
      heartbeat_timeout_ms: default_heartbeat_timeout(),
      heartbeat_check_ms: default_heartbeat_check(),
    }
  }
}

/// Failover policy.
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
  /// Consecutive primary failures before switching to the fallback.
  #[serde(default = "default_failure_threshold")]
  pub failure_threshold: u32,
  /// Minimum spacing between primary recovery probes (milliseconds).
  #[serde(default = "default_cooldown")]
  pub cooldown_ms: u64,
}

impl Default for FallbackConfig {
  fn default() -> Self {
    Self {
      failure_threshold: default_failure_threshold(),
      cooldown_ms: default_cooldown(),
    }
  }
}

/// Per-kind response TTLs.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_price_ttl")]
  pub price_ttl_ms: u64,
  #[serde(default = "default_order_book_ttl")]
  pub order_book_ttl_ms: u64,
  #[serde(default = "default_kline_ttl")]
  pub kline_ttl_ms: u64,
  #[serde(default = "default_trades_ttl")]
  pub trades_ttl_ms: u64,
  /// Background sweep of expired entries (0 disables it).
  #[serde(default = "default_sweep_interval")]
  pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      price_ttl_ms: default_price_ttl(),
      order_book_ttl_ms: default_order_book_ttl(),
      kline_ttl_ms: default_kline_ttl(),
      trades_ttl_ms: default_trades_ttl(),
      sweep_interval_ms: default_sweep_interval(),
    }
  }
}

/// Metrics and monitoring configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
  /// Enable Prometheus metrics export.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Metrics server bind address.
  #[serde(default = "default_metrics_addr")]
  pub bind_address: String,
  /// Health check endpoint port.
  #[serde(default = "default_health_port")]
  pub health_port: u16,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      bind_address: default_metrics_addr(),
      health_port: default_health_port(),
    }
  }
}

/// Feeds subscribed by the runner binary.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchConfig {
  #[serde(default)]
  pub symbols: Vec<String>,
  /// Channel names: `ticker`, `trade`, `orderbook`, `kline_<interval>`.
  #[serde(default)]
  pub channels: Vec<String>,
}

impl WatchConfig {
  /// Expand symbols x channels into feed keys.
  pub fn feeds(&self) -> anyhow::Result<Vec<FeedKey>> {
    let channels = self
      .channels
      .iter()
      .map(|c| parse_channel(c))
      .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(
      self
        .symbols
        .iter()
        .flat_map(|s| channels.iter().map(move |c| FeedKey::new(*c, s)))
        .collect(),
    )
  }
}

/// Parse a channel name as written in config.
pub fn parse_channel(name: &str) -> anyhow::Result<Channel> {
  match name {
    "ticker" => Ok(Channel::Ticker),
    "trade" | "trades" => Ok(Channel::Trade),
    "orderbook" | "depth" => Ok(Channel::OrderBook),
    other => {
      let interval = other
        .strip_prefix("kline_")
        .ok_or_else(|| anyhow::anyhow!("unknown channel `{other}`"))?
        .parse::<Interval>()
        .map_err(|e| anyhow::anyhow!(e))?;
      Ok(Channel::Kline(interval))
    }
  }
}

// Default value functions for serde

fn default_service_name() -> String {
  "market-data-hub".to_string()
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_log_format() -> String {
  "json".to_string()
}

const fn default_true() -> bool {
  true
}

const fn default_timeout_ms() -> u64 {
  10_000
}

const fn default_max_concurrent() -> usize {
  10
}

const fn default_stream_depth() -> usize {
  20
}

const fn default_base_delay() -> u64 {
  1_000
}

const fn default_max_delay() -> u64 {
  30_000
}

const fn default_max_attempts() -> u32 {
  5
}

const fn default_jitter_ratio() -> f64 {
  0.2
}

const fn default_heartbeat_timeout() -> u64 {
  30_000
}

const fn default_heartbeat_check() -> u64 {
  5_000
}

const fn default_failure_threshold() -> u32 {
  3
}

const fn default_cooldown() -> u64 {
  60_000
}

const fn default_price_ttl() -> u64 {
  30_000
}

const fn default_order_book_ttl() -> u64 {
  5_000
}

const fn default_kline_ttl() -> u64 {
  60_000
}

const fn default_trades_ttl() -> u64 {
  10_000
}

const fn default_sweep_interval() -> u64 {
  60_000
}

fn default_metrics_addr() -> String {
  "0.0.0.0:9090".to_string()
}

const fn default_health_port() -> u16 {
  8080
}
