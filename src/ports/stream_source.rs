//! Stream Source Port - Upstream Socket Transport
//!
//! Opens one persistent text-framed upstream stream. The production
//! adapter is a WebSocket; tests plug in a scripted in-memory source.

use async_trait::async_trait;

use super::market_provider::StreamEndpoint;

/// Factory for upstream stream sessions.
#[async_trait]
pub trait StreamSource: Send + Sync + 'static {
  /// Open a session and send the endpoint's subscribe frame, if any.
  async fn connect(&self, endpoint: &StreamEndpoint) -> anyhow::Result<Box<dyn StreamSession>>;
}

/// One open upstream stream.
#[async_trait]
pub trait StreamSession: Send {
  /// Next text frame.
  ///
  /// `None` means the upstream closed the stream. Must be cancel-safe:
  /// it is raced against timers and close signals in `select!`.
  async fn next_text(&mut self) -> Option<anyhow::Result<String>>;

  /// Close the stream from our side.
  async fn close(&mut self);
}
