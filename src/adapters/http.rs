//! Provider HTTP Client - Bounded REST Transport
//!
//! Wraps reqwest with a request timeout and a concurrency cap for one
//! upstream's public REST API. Rate budgeting and retries live above
//! this layer (`RateLimiter`, `FallbackSwitch`), so every call here is
//! exactly one upstream request.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::ProviderError;

/// Upstream usage headers worth surfacing in debug logs.
const USAGE_HEADERS: [&str; 2] = ["x-mbx-used-weight-1m", "retry-after"];

/// Configuration for one provider's HTTP client.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
  /// Base URL, without trailing slash.
  pub base_url: String,
  /// Per-request timeout.
  pub timeout: Duration,
  /// Maximum in-flight requests.
  pub max_concurrent: usize,
}

/// Concurrency-bounded JSON GET client.
pub struct HttpClient {
  http: Client,
  config: HttpClientConfig,
  semaphore: Arc<Semaphore>,
}

impl HttpClient {
  pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
    let http = Client::builder()
      .timeout(config.timeout)
      .pool_max_idle_per_host(5)
      .user_agent(concat!("market-data-hub/", env!("CARGO_PKG_VERSION")))
      .build()?;

    let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

    Ok(Self {
      http,
      config: HttpClientConfig {
        base_url: config.base_url.trim_end_matches('/').to_string(),
        ..config
      },
      semaphore,
    })
  }

  pub fn base_url(&self) -> &str {
    &self.config.base_url
  }

  /// GET `path` with `query` and decode the JSON body.
  ///
  /// Non-2xx statuses become `ProviderError::Status` with the body text.
  pub async fn get_json<T: DeserializeOwned>(
    &self,
    path: &str,
    query: &[(&str, String)],
  ) -> Result<T, ProviderError> {
    let _permit = self
      .semaphore
      .acquire()
      .await
      .map_err(|_| ProviderError::Unavailable("http client closed".into()))?;

    let url = format!("{}{}", self.config.base_url, path);
    let response = self.http.get(&url).query(query).send().await?;
    Self::log_usage(path, &response);

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      warn!(path, status = status.as_u16(), "Upstream returned error status");
      return Err(ProviderError::Status {
        status: status.as_u16(),
        body,
      });
    }

    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
  }

  fn log_usage(path: &str, response: &Response) {
    for header in USAGE_HEADERS {
      if let Some(value) = response.headers().get(header).and_then(|v| v.to_str().ok()) {
        debug!(path, header, value, "Upstream usage");
      }
    }
  }
}
