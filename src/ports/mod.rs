//! Ports Layer - Hexagonal Architecture Boundaries
//!
//! Defines the interfaces (traits) the use cases require from the
//! outside world. Adapters implement these traits.
//!
//! Port categories:
//! - `MarketProvider`: stream naming, frame normalization, REST lookups
//! - `StreamSource`: persistent upstream text streams

pub mod market_provider;
pub mod stream_source;

pub use market_provider::{MarketProvider, StreamEndpoint};
pub use stream_source::{StreamSession, StreamSource};
