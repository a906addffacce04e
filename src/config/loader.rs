//! Configuration Loader - File Loading and Validation
//!
//! Handles loading `config.toml`, validating all parameters,
//! and providing clear error messages for misconfiguration.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use super::{AppConfig, ProviderConfig};

/// Load and validate configuration from a TOML file.
///
/// # Errors
/// Returns detailed error if:
/// - File doesn't exist or can't be read
/// - TOML parsing fails
/// - Validation rules are violated
pub fn load_config(path: &str) -> Result<AppConfig> {
  let path = Path::new(path);

  let content = std::fs::read_to_string(path)
    .with_context(|| format!("Failed to read config file: {}", path.display()))?;

  let config = parse_config(&content)?;

  info!(
    primary = ?config.providers.primary.kind,
    fallback = ?config.providers.fallback.kind,
    threshold = config.fallback.failure_threshold,
    watched = config.watch.symbols.len(),
    "Configuration loaded successfully"
  );

  Ok(config)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<AppConfig> {
  let config: AppConfig =
    toml::from_str(content).with_context(|| "Failed to parse config.toml")?;

  validate_config(&config)?;
  Ok(config)
}

/// Validate all configuration parameters.
fn validate_config(config: &AppConfig) -> Result<()> {
  validate_provider("primary", &config.providers.primary)?;
  validate_provider("fallback", &config.providers.fallback)?;

  // Stream policy
  let stream = &config.stream;
  anyhow::ensure!(stream.base_delay_ms > 0, "stream.base_delay_ms must be positive");
  anyhow::ensure!(
    stream.max_delay_ms >= stream.base_delay_ms,
    "stream.max_delay_ms ({}) must be >= base_delay_ms ({})",
    stream.max_delay_ms,
    stream.base_delay_ms
  );
  anyhow::ensure!(
    (0.0..1.0).contains(&stream.jitter_ratio),
    "stream.jitter_ratio must be in [0, 1), got {}",
    stream.jitter_ratio
  );
  anyhow::ensure!(
    stream.heartbeat_check_ms > 0 && stream.heartbeat_check_ms <= stream.heartbeat_timeout_ms,
    "stream.heartbeat_check_ms must be in (0, heartbeat_timeout_ms]"
  );

  // Fallback policy
  anyhow::ensure!(
    config.fallback.failure_threshold > 0,
    "fallback.failure_threshold must be positive"
  );

  // Cache
  anyhow::ensure!(config.cache.price_ttl_ms > 0, "cache.price_ttl_ms must be positive");

  // Watch list
  config
    .watch
    .feeds()
    .context("Invalid [watch] channel list")?;

  Ok(())
}

fn validate_provider(role: &str, provider: &ProviderConfig) -> Result<()> {
  anyhow::ensure!(!provider.rest_url.is_empty(), "{role} rest_url must not be empty");
  anyhow::ensure!(
    provider.ws_url.starts_with("ws://") || provider.ws_url.starts_with("wss://"),
    "{role} ws_url must be a ws:// or wss:// URL, got {}",
    provider.ws_url
  );
  anyhow::ensure!(provider.timeout_ms > 0, "{role} timeout_ms must be positive");
  anyhow::ensure!(provider.max_concurrent > 0, "{role} max_concurrent must be positive");
  anyhow::ensure!(
    provider.rate_limit.limit > 0 && provider.rate_limit.window_ms > 0,
    "{role} rate_limit must have positive limit and window_ms"
  );
  Ok(())
}
