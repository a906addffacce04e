//! WebSocket Stream Source
//!
//! Production `StreamSource`: one tokio-tungstenite connection per
//! session. Ping/pong is answered by tungstenite; binary and control
//! frames are skipped so sessions only ever yield text.

use anyhow::Context;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::ports::{StreamEndpoint, StreamSession, StreamSource};

/// Opens upstream streams over WebSocket.
#[derive(Debug, Default)]
pub struct WsStreamSource;

impl WsStreamSource {
  pub const fn new() -> Self {
    Self
  }
}

#[async_trait]
impl StreamSource for WsStreamSource {
  async fn connect(&self, endpoint: &StreamEndpoint) -> anyhow::Result<Box<dyn StreamSession>> {
    let (mut ws, _) = connect_async(endpoint.url.as_str())
      .await
      .with_context(|| format!("WebSocket connection to {} failed", endpoint.url))?;

    if let Some(frame) = &endpoint.subscribe {
      ws.send(Message::Text(frame.clone()))
        .await
        .context("Failed to send subscribe frame")?;
    }

    info!(url = %endpoint.url, "WebSocket connected");
    Ok(Box::new(WsSession { ws }))
  }
}

struct WsSession {
  ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamSession for WsSession {
  async fn next_text(&mut self) -> Option<anyhow::Result<String>> {
    loop {
      match self.ws.next().await? {
        Ok(Message::Text(text)) => return Some(Ok(text)),
        Ok(Message::Close(frame)) => {
          debug!(?frame, "Upstream sent close frame");
          return None;
        }
        Ok(Message::Ping(data)) => debug!(len = data.len(), "Ping received"),
        Ok(_) => {}
        Err(e) => return Some(Err(anyhow::anyhow!("WebSocket error: {e}"))),
      }
    }
  }

  async fn close(&mut self) {
    if let Err(e) = self.ws.close(None).await {
      debug!(error = %e, "WebSocket close handshake failed");
    }
  }
}
