//! WebSocket transport
//!
//! The connection worker talks to the appliance through the [`Connector`] and
//! [`Transport`] traits so the lifecycle logic does not depend on a live socket.
//! [`WsConnector`] is the production implementation on top of `tokio-tungstenite`.

use crate::config::TrueNasConfig;
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens new transports to the appliance
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

/// One open, bidirectional text-frame channel
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// Next text frame. `None` once the peer closed the connection.
    ///
    /// Must be cancel-safe: the worker polls it inside `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn close(&mut self);
}

/// Connects to the TrueNAS websocket endpoint
pub struct WsConnector {
    url: String,
    use_tls: bool,
    verify_ssl: bool,
}

impl WsConnector {
    pub fn new(config: &TrueNasConfig) -> Self {
        Self {
            url: config.websocket_url(),
            use_tls: config.use_tls,
            verify_ssl: config.verify_ssl,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        debug!("Connecting to {}", self.url);

        let (stream, _) = if self.use_tls && !self.verify_ssl {
            // Custom TLS connector for self-signed certs
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| SessionError::Config(e.to_string()))?;

            let connector = tokio_tungstenite::Connector::NativeTls(connector);
            tokio_tungstenite::connect_async_tls_with_config(&self.url, None, false, Some(connector))
                .await?
        } else {
            connect_async(&self.url).await?
        };

        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WsStream,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => {
                    return Some(String::from_utf8(bytes.to_vec()).map_err(|e| {
                        SessionError::Protocol(format!("binary frame is not UTF-8: {}", e))
                    }))
                }
                Ok(Message::Close(frame)) => {
                    debug!("Server sent close frame: {:?}", frame);
                    return None;
                }
                // Ping replies are queued by tungstenite and flushed on the next read or write.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(SessionError::WebSocket(e))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
