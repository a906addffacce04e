//! Use Cases Layer - Distribution Logic
//!
//! Composes the provider and transport ports into the process-wide
//! market data service.
//!
//! Use cases:
//! - `RateLimiter`: sliding-window REST admission, FIFO, never rejects
//! - `ResponseCache`: keyed TTL cache, lazily evicted
//! - `Backoff`: capped exponential reconnect delays with jitter
//! - `FallbackSwitch`: primary/secondary provider selection
//! - `StreamConnection`: one upstream stream per feed, with fan-out
//! - `ConnectionRegistry`: at most one connection per feed
//! - `DataService`: the consumer-facing facade

pub mod backoff;
pub mod connection_registry;
pub mod data_service;
pub mod fallback_switch;
pub mod rate_limiter;
pub mod response_cache;
pub mod stream_connection;

#[cfg(test)]
pub(crate) mod test_support;

pub use backoff::{Backoff, ReconnectPolicy};
pub use connection_registry::{ConnectionRegistry, Subscription};
pub use data_service::{CacheTtls, DataService};
pub use fallback_switch::{
    FallbackPolicy, FallbackSwitch, HealthSnapshot, ProviderMode, ProviderRole, Route,
};
pub use rate_limiter::RateLimiter;
pub use response_cache::ResponseCache;
pub use stream_connection::{
    Callback, ConnectionStatus, FeedInfo, StreamConnection, StreamContext,
};
