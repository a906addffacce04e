//! Error taxonomy.
//!
//! `ProviderError` is what an upstream adapter reports; `is_outage`
//! decides whether it counts against the provider's health. `DataError`
//! is the only error type the consumer-facing facade returns.

use thiserror::Error;

/// Failure reported by a market data provider adapter.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Connection refused, reset, DNS failure and similar.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    /// Non-success HTTP status.
    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Provider reported itself as unavailable or overloaded.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Provider understood the request and refused it.
    #[error("upstream rejected request: {0}")]
    Upstream(String),

    /// Payload could not be decoded into the canonical shape.
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("{0} is not supported by this provider")]
    Unsupported(String),
}

impl ProviderError {
    /// Whether this failure is attributable to provider health rather
    /// than to the individual request.
    pub const fn is_outage(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::Unavailable(_) | Self::Malformed(_) => {
                true
            }
            Self::Status { status, .. } => *status >= 500 || *status == 429 || *status == 418,
            Self::Upstream(_) | Self::Unsupported(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

/// Error surfaced by `DataService` to consumers.
#[derive(Debug, Error)]
pub enum DataError {
    /// Both providers are failing (or the one in use is and the other
    /// is already marked down).
    #[error("market data unavailable: {0}")]
    Unavailable(String),

    /// The request itself was refused (unknown symbol, unsupported interval).
    #[error("{provider} rejected the request: {source}")]
    Rejected {
        provider: &'static str,
        #[source]
        source: ProviderError,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("data service has been shut down")]
    ShutDown,
}
