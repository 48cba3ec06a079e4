//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections, optionally terminates TLS, and upgrades each one
//! to a WebSocket on the configured route. Requests for any other path are
//! refused with `404` during the upgrade.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::WebSocketStream;
use tracing::info;
use wsproxy_core::{ProxyError, ProxyResult};

/// Bound TCP listener for the relay endpoint.
pub struct WebSocketListener {
    tcp_listener: TcpListener,
    upgrader: Upgrader,
}

impl WebSocketListener {
    /// Bind the listener. A bind failure is fatal to the caller.
    pub async fn bind(
        bind: &str,
        port: u16,
        tls: Option<Arc<rustls::ServerConfig>>,
        path: &str,
        max_message_size: usize,
        handshake_timeout: Duration,
    ) -> ProxyResult<Self> {
        let tcp_listener = TcpListener::bind((bind, port))
            .await
            .map_err(|e| ProxyError::Transport(format!("WS bind {bind}:{port} failed: {e}")))?;

        let local = tcp_listener.local_addr()?;
        info!(addr = %local, tls = tls.is_some(), path, "WebSocket listener started");

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(max_message_size);
        ws_config.max_frame_size = Some(max_message_size);

        Ok(Self {
            tcp_listener,
            upgrader: Upgrader {
                tls: tls.map(TlsAcceptor::from),
                path: Arc::from(path),
                ws_config,
                timeout: handshake_timeout,
            },
        })
    }

    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.tcp_listener.local_addr()?)
    }

    pub async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.tcp_listener.accept().await
    }

    /// Per-connection upgrade settings, cloned into each connection task.
    pub fn upgrader(&self) -> Upgrader {
        self.upgrader.clone()
    }
}

/// TLS + WebSocket upgrade for one accepted connection.
#[derive(Clone)]
pub struct Upgrader {
    tls: Option<TlsAcceptor>,
    path: Arc<str>,
    ws_config: WebSocketConfig,
    timeout: Duration,
}

impl Upgrader {
    pub fn tls(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    /// Terminate TLS on an accepted TCP stream.
    pub async fn accept_tls(
        &self,
        acceptor: &TlsAcceptor,
        stream: TcpStream,
    ) -> ProxyResult<tokio_rustls::server::TlsStream<TcpStream>> {
        tokio::time::timeout(self.timeout, acceptor.accept(stream))
            .await
            .map_err(|_| ProxyError::Timeout)?
            .map_err(|e| ProxyError::Transport(format!("TLS handshake failed: {e}")))
    }

    /// Run the HTTP upgrade, refusing any path but the configured route.
    pub async fn upgrade<S>(&self, stream: S) -> ProxyResult<WebSocketStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let route = self.path.clone();
        let check_route = move |request: &Request, response: Response| {
            if request.uri().path() == &*route {
                Ok(response)
            } else {
                let mut refused = ErrorResponse::new(Some("not found".to_string()));
                *refused.status_mut() = StatusCode::NOT_FOUND;
                Err(refused)
            }
        };

        let upgrade = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            check_route,
            Some(self.ws_config),
        );
        tokio::time::timeout(self.timeout, upgrade)
            .await
            .map_err(|_| ProxyError::Timeout)?
            .map_err(|e| ProxyError::Transport(format!("WebSocket handshake failed: {e}")))
    }
}
