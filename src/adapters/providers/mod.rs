//! Upstream Provider Adapters
//!
//! One `MarketProvider` per exchange. Binance is the primary source;
//! Kraken serves the same feeds when the primary is failing.

pub mod binance;
pub mod kraken;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

pub use binance::BinanceProvider;
pub use kraken::KrakenProvider;

use super::http::{HttpClient, HttpClientConfig};
use crate::config::{ProviderConfig, ProviderKind};
use crate::error::ProviderError;
use crate::ports::MarketProvider;

/// Build the adapter described by `config`.
pub fn build(config: &ProviderConfig) -> anyhow::Result<Arc<dyn MarketProvider>> {
    let http = HttpClient::new(HttpClientConfig {
        base_url: config.rest_url.clone(),
        timeout: Duration::from_millis(config.timeout_ms),
        max_concurrent: config.max_concurrent,
    })?;

    Ok(match config.kind {
        ProviderKind::Binance => Arc::new(BinanceProvider::new(http, &config.ws_url, config.stream_depth)),
        ProviderKind::Kraken => Arc::new(KrakenProvider::new(http, &config.ws_url, config.stream_depth)),
    })
}

/// Parse a decimal string field.
pub(crate) fn parse_num(raw: &str, field: &str) -> Result<f64, ProviderError> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ProviderError::Malformed(format!("{field}: `{raw}` is not a number")))
}

/// Accept a number encoded either as a JSON number or a decimal string.
pub(crate) fn flexible_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}
