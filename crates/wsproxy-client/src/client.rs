//! Tunnel client: WebSocket connect plus the one-message handshake.

use crate::stream::TunnelStream;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, info};
use wsproxy_core::{HandshakeStatus, PortSpec, ProxyError, ProxyResult};

/// Default bound on connecting plus the handshake reply.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens tunnels to one wsproxy endpoint.
#[derive(Debug, Clone)]
pub struct TunnelClient {
    url: String,
    timeout: Duration,
}

impl TunnelClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Set the bound on connecting plus waiting for the status reply.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect to `url` and open a tunnel to `spec`.
    pub async fn connect(url: &str, spec: PortSpec) -> ProxyResult<TunnelStream> {
        Self::new(url).open(spec).await
    }

    /// Open a new tunnel to `spec`. Each call uses its own WebSocket.
    pub async fn open(&self, spec: PortSpec) -> ProxyResult<TunnelStream> {
        install_crypto_provider();

        tokio::time::timeout(self.timeout, self.handshake(spec))
            .await
            .map_err(|_| ProxyError::Timeout)?
    }

    async fn handshake(&self, spec: PortSpec) -> ProxyResult<TunnelStream> {
        let (ws, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ProxyError::Transport(format!("WebSocket connect error: {e}")))?;
        debug!(url = %self.url, "WebSocket connected");

        let (mut sink, mut source) = ws.split();
        sink.send(Message::Text(spec.to_string()))
            .await
            .map_err(|e| ProxyError::Transport(format!("WS send failed: {e}")))?;

        let status = loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => break text.parse::<HandshakeStatus>()?,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ProxyError::Handshake(
                        "connection closed before status".into(),
                    ))
                }
                Some(Ok(_)) => {
                    return Err(ProxyError::Handshake("expected text status".into()))
                }
                Some(Err(e)) => {
                    return Err(ProxyError::Handshake(format!("WS recv failed: {e}")))
                }
            }
        };

        match status {
            HandshakeStatus::Success => {
                info!(url = %self.url, target = %spec, "tunnel open");
                Ok(TunnelStream::new(spec, sink, source))
            }
            HandshakeStatus::InvalidPort => Err(ProxyError::NotWhitelisted(spec.to_string())),
            HandshakeStatus::ServiceUnavailable => {
                Err(ProxyError::ServiceUnavailable(spec.to_string()))
            }
        }
    }
}

/// `wss://` needs a process-wide rustls provider; ring is the one we build.
fn install_crypto_provider() {
    // Err means a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
}
