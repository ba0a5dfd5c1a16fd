//! WebSocket Connection Helper
//!
//! Thin typed wrapper over a tokio-tungstenite stream: outgoing frames
//! are `ClientEvent`s, incoming text frames decode to `ServerEvent`s.
//! Undecodable frames are logged and skipped, never surfaced.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite};
use tracing::warn;

use shoal_protocol::{ClientEvent, ServerEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A connected live-event channel.
pub struct EventStream {
    write: SplitSink<WsStream, tungstenite::Message>,
    read: SplitStream<WsStream>,
}

impl EventStream {
    /// Connect to `ws://host:port/ws?user_id=...`.
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .context("WebSocket connect failed")?;
        let (write, read) = stream.split();
        Ok(Self { write, read })
    }

    pub async fn send(&mut self, event: &ClientEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        self.write
            .send(tungstenite::Message::Text(json.into()))
            .await
            .context("WebSocket send failed")?;
        Ok(())
    }

    /// Next decoded server event, or None once the server closes the
    /// connection.
    pub async fn next_event(&mut self) -> Result<Option<ServerEvent>> {
        while let Some(frame) = self.read.next().await {
            match frame.context("WebSocket receive failed")? {
                tungstenite::Message::Text(text) => {
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => return Ok(Some(event)),
                        Err(e) => warn!("skipping undecodable frame: {}", e),
                    }
                }
                tungstenite::Message::Close(_) => return Ok(None),
                _ => {} // binary/ping/pong: nothing to decode
            }
        }
        Ok(None)
    }

    pub async fn close(mut self) -> Result<()> {
        self.write.close().await.ok();
        Ok(())
    }
}
