//! Adapters Layer - Hexagonal Architecture Outer Ring
//!
//! Implements the port traits defined in `crate::ports` with concrete
//! external dependencies (HTTP, WebSockets, Prometheus, axum).
//!
//! Adapter categories:
//! - `http`: bounded reqwest client shared by the REST providers
//! - `websocket`: tokio-tungstenite `StreamSource`
//! - `providers`: Binance (primary) and Kraken (fallback) market data
//! - `metrics`: Prometheus metrics export and health checks

pub mod http;
pub mod metrics;
pub mod providers;
pub mod websocket;
