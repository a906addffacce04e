//! Market Data Hub — Library Root
//!
//! Process-wide real-time market data distribution: shared upstream
//! streams, cached and rate-limited REST lookups, and automatic
//! failover between two providers. `usecases::DataService` is the
//! entry point; everything else is re-exported for integration tests
//! and benchmarks.

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;
pub mod usecases;

pub use error::{DataError, ProviderError};
pub use usecases::DataService;
