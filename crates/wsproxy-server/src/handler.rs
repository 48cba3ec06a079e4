//! Per-connection handler: handshake, relay loop, teardown.
//!
//! ```text
//! client                          server
//!   │── text "TCP:22" ───────────▶│ parse + whitelist check
//!   │                             │ Tunnel::start (connect target)
//!   │◀─ text SUCCESS ─────────────│   or INVALID_PORT / SERVICE_UNAVAILABLE + close
//!   │◀═ binary chunks ═══════════▶│ relay mode
//!   │── binary "" (end) ─────────▶│ shutdown
//! ```
//!
//! The handler owns the WebSocket's write half until `SUCCESS` is on the
//! wire and then hands it to the tunnel, so exactly one task ever writes to
//! the connection at a time.

use crate::registry::{SessionGuard, SessionRegistry};
use crate::tunnel::{CloseReason, Tunnel, TunnelSettings};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use wsproxy_core::{Chunk, HandshakeStatus, PortSpec, ProxyError, ProxyResult, Whitelist};

/// How long to wait for the client's close reply after we close.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink<T> = SplitSink<WebSocketStream<T>, Message>;
type WsSource<T> = SplitStream<WebSocketStream<T>>;

/// Everything a handler needs from the server, shared by all sessions.
pub struct HandlerContext {
    pub whitelist: Whitelist,
    pub tunnel: Arc<TunnelSettings>,
    pub handshake_timeout: Duration,
    pub registry: Arc<SessionRegistry>,
}

/// Why the relay loop ended.
#[derive(Debug, PartialEq, Eq)]
enum RelayExit {
    /// Zero-length binary message.
    ClientEnd,
    /// Close frame, EOF, or a fatal receive error.
    ClientClosed,
    /// A worker shut the tunnel down.
    TunnelClosed,
    /// Text or raw frame during relay mode.
    Violation,
    /// Server shutdown broadcast.
    GoingAway,
}

impl RelayExit {
    fn close_reason(&self) -> CloseReason {
        match self {
            RelayExit::GoingAway => CloseReason::GoingAway,
            RelayExit::Violation => CloseReason::Unsupported,
            _ => CloseReason::Normal,
        }
    }
}

/// Serve one upgraded WebSocket until the session ends.
///
/// The session is registered for its whole lifetime; the tunnel, when one
/// was started, is always shut down before this returns.
pub async fn handle_connection<T>(
    ws: WebSocketStream<T>,
    remote: SocketAddr,
    ctx: Arc<HandlerContext>,
) -> ProxyResult<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let session = ctx.registry.register(remote);
    let (mut sink, mut source) = ws.split();
    debug!(session = session.id(), remote = %remote, "websocket connection established");

    let received = tokio::select! {
        _ = session.going_away() => None,
        received = tokio::time::timeout(ctx.handshake_timeout, read_handshake(&mut source)) => {
            Some(received)
        }
    };

    let request = match received {
        Some(Ok(Ok(Some(request)))) => request,
        Some(Ok(Ok(None))) => {
            debug!(remote = %remote, "closed before handshake");
            return Ok(());
        }
        Some(Ok(Err(e))) => {
            close_inbound(&mut sink, &mut source, CloseReason::Unsupported).await;
            return Err(e);
        }
        Some(Err(_)) => {
            close_inbound(&mut sink, &mut source, CloseReason::Normal).await;
            return Err(ProxyError::Timeout);
        }
        None => {
            close_inbound(&mut sink, &mut source, CloseReason::GoingAway).await;
            return Ok(());
        }
    };

    let spec = match validate_request(&request, &ctx.whitelist) {
        Ok(spec) => spec,
        Err(e) => {
            info!(remote = %remote, error = %e, "rejected forward request");
            reply(&mut sink, HandshakeStatus::InvalidPort).await?;
            close_inbound(&mut sink, &mut source, CloseReason::Normal).await;
            return Ok(());
        }
    };
    debug!(remote = %remote, target = %spec, "received request to forward");

    let mut tunnel: Tunnel<WsSink<T>> = Tunnel::new(spec, ctx.tunnel.clone());
    if let Err(e) = tunnel.start().await {
        match e {
            ProxyError::UnsupportedProtocol(_) => {
                warn!(remote = %remote, target = %spec, error = %e, "unsupported forward protocol")
            }
            _ => warn!(remote = %remote, target = %spec, error = %e, "error starting tunnel"),
        }
        reply(&mut sink, HandshakeStatus::ServiceUnavailable).await?;
        close_inbound(&mut sink, &mut source, CloseReason::Normal).await;
        return Ok(());
    }

    if let Err(e) = reply(&mut sink, HandshakeStatus::Success).await {
        tunnel.shutdown().await;
        return Err(e);
    }

    if let Err(mut sink) = tunnel.attach_inbound(sink) {
        // The target went away between start and now.
        tunnel.shutdown().await;
        close_inbound(&mut sink, &mut source, CloseReason::Normal).await;
        return Ok(());
    }

    info!(remote = %remote, target = %spec, "relaying");
    let exit = relay(&mut source, &tunnel, &session).await;
    debug!(remote = %remote, target = %spec, ?exit, "relay loop ended");

    tunnel.shutdown_with(exit.close_reason()).await;
    if exit != RelayExit::ClientClosed {
        drain_close_reply(&mut source).await;
    }

    debug!(remote = %remote, "websocket connection closed");
    Ok(())
}

/// Wait for the handshake text message.
///
/// `Ok(None)` if the client went away first; a protocol error for any other
/// message type.
async fn read_handshake<T>(source: &mut WsSource<T>) -> ProxyResult<Option<String>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(text)),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(other)) => {
                return Err(ProxyError::Protocol(format!(
                    "expected text handshake, got {}",
                    message_kind(&other)
                )))
            }
            Some(Err(e)) => return Err(ProxyError::Transport(format!("WS recv failed: {e}"))),
        }
    }
}

/// Parse and whitelist-check the handshake message.
fn validate_request(request: &str, whitelist: &Whitelist) -> ProxyResult<PortSpec> {
    let spec: PortSpec = request.parse()?;
    if !whitelist.contains(&spec) {
        return Err(ProxyError::NotWhitelisted(spec.to_string()));
    }
    Ok(spec)
}

async fn reply<T>(sink: &mut WsSink<T>, status: HandshakeStatus) -> ProxyResult<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    sink.send(Message::Text(status.as_str().to_string()))
        .await
        .map_err(|e| ProxyError::Transport(format!("WS send failed: {e}")))
}

/// Relay inbound binary messages into the tunnel until the session ends.
async fn relay<T>(
    source: &mut WsSource<T>,
    tunnel: &Tunnel<WsSink<T>>,
    session: &SessionGuard,
) -> RelayExit
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handle = tunnel.handle();

    loop {
        let next = tokio::select! {
            biased;
            _ = session.going_away() => return RelayExit::GoingAway,
            _ = handle.closing() => return RelayExit::TunnelClosed,
            next = source.next() => next,
        };

        match next {
            Some(Ok(Message::Binary(payload))) => {
                let chunk = Chunk::from_message_payload(payload);
                let end = chunk.is_end();
                let fed = tokio::select! {
                    biased;
                    _ = session.going_away() => return RelayExit::GoingAway,
                    fed = tunnel.feed(chunk) => fed,
                };
                if end {
                    return RelayExit::ClientEnd;
                }
                if let Err(e) = fed {
                    debug!(error = %e, "feed rejected");
                    return RelayExit::TunnelClosed;
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => return RelayExit::ClientClosed,
            Some(Ok(other)) => {
                warn!(kind = message_kind(&other), "unexpected message in relay mode, closing");
                return RelayExit::Violation;
            }
            Some(Err(e)) if is_closed(&e) => {
                debug!(error = %e, "websocket closed");
                return RelayExit::ClientClosed;
            }
            Some(Err(e)) => warn!(error = %e, "websocket connection error"),
        }
    }
}

fn is_closed(e: &WsError) -> bool {
    matches!(
        e,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Io(_)
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
    )
}

fn message_kind(msg: &Message) -> &'static str {
    match msg {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "frame",
    }
}

/// Close a connection the handler still owns the write half of.
async fn close_inbound<T>(sink: &mut WsSink<T>, source: &mut WsSource<T>, reason: CloseReason)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = sink.send(Message::Close(Some(reason.frame()))).await {
        debug!(error = %e, "close frame not sent");
        return;
    }
    drain_close_reply(source).await;
}

/// Give the client a moment to answer our close frame.
async fn drain_close_reply<T>(source: &mut WsSource<T>)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let _ = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, async {
        while let Some(Ok(msg)) = source.next().await {
            if msg.is_close() {
                break;
            }
        }
    })
    .await;
}
