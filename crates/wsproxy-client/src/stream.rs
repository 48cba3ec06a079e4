//! An open tunnel: binary messages in both directions.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;
use wsproxy_core::{PortSpec, ProxyError, ProxyResult};

/// Bytes read from the local side per outbound message.
const BRIDGE_CHUNK_SIZE: usize = 16 * 1024;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Byte counts from [`TunnelStream::bridge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub sent: u64,
    pub received: u64,
}

enum BridgeEvent {
    Read(usize),
    Received(Option<Vec<u8>>),
}

/// A tunnel in relay mode.
///
/// Every binary message carries raw bytes for the target. The zero-length
/// message is reserved: it ends the session, so [`TunnelStream::send`]
/// never emits one.
#[derive(Debug)]
pub struct TunnelStream {
    target: PortSpec,
    sink: WsSink,
    source: WsSource,
    finished: bool,
}

impl TunnelStream {
    pub(crate) fn new(target: PortSpec, sink: WsSink, source: WsSource) -> Self {
        Self {
            target,
            sink,
            source,
            finished: false,
        }
    }

    pub fn target(&self) -> PortSpec {
        self.target
    }

    /// Send bytes to the target. Empty input is a no-op.
    pub async fn send(&mut self, data: &[u8]) -> ProxyResult<()> {
        if self.finished {
            return Err(ProxyError::TunnelClosed);
        }
        send_data(&mut self.sink, data).await
    }

    /// Next chunk from the target, or `None` once the server closed the
    /// session.
    pub async fn recv(&mut self) -> ProxyResult<Option<Vec<u8>>> {
        recv_data(&mut self.source).await
    }

    /// Send the end-of-session message.
    ///
    /// The server ends the session as soon as it sees this message. Bytes
    /// it has accepted but not yet written to the target may be discarded,
    /// so a caller that needs delivery confirmed must get it from the
    /// target's own protocol before finishing.
    pub async fn finish(&mut self) -> ProxyResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.sink
            .send(Message::Binary(Vec::new()))
            .await
            .map_err(|e| ProxyError::Transport(format!("WS send failed: {e}")))
    }

    /// Close the WebSocket without the end-of-session message.
    pub async fn close(mut self) -> ProxyResult<()> {
        self.finished = true;
        self.sink
            .close()
            .await
            .map_err(|e| ProxyError::Transport(format!("WS close failed: {e}")))
    }

    /// Pump `reader` into the tunnel and the tunnel into `writer`.
    ///
    /// EOF on `reader` sends the end-of-session message (see
    /// [`TunnelStream::finish`] for what that means for bytes still queued
    /// on the server). The bridge then keeps copying whatever the server
    /// still sends into `writer` and returns once the server closes.
    pub async fn bridge<R, W>(mut self, mut reader: R, mut writer: W) -> ProxyResult<BridgeStats>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut stats = BridgeStats::default();
        let mut buf = vec![0u8; BRIDGE_CHUNK_SIZE];
        let mut reading = !self.finished;

        loop {
            let event = tokio::select! {
                read = reader.read(&mut buf), if reading => BridgeEvent::Read(read?),
                received = recv_data(&mut self.source) => BridgeEvent::Received(received?),
            };

            match event {
                BridgeEvent::Read(0) => {
                    debug!(target = %self.target, "local side reached EOF");
                    reading = false;
                    self.finish().await?;
                }
                BridgeEvent::Read(n) => {
                    send_data(&mut self.sink, &buf[..n]).await?;
                    stats.sent += n as u64;
                }
                BridgeEvent::Received(Some(data)) => {
                    writer.write_all(&data).await?;
                    writer.flush().await?;
                    stats.received += data.len() as u64;
                }
                BridgeEvent::Received(None) => break,
            }
        }

        writer.flush().await?;
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "local writer shutdown failed");
        }
        debug!(target = %self.target, sent = stats.sent, received = stats.received, "bridge finished");
        Ok(stats)
    }
}

async fn send_data(sink: &mut WsSink, data: &[u8]) -> ProxyResult<()> {
    if data.is_empty() {
        return Ok(());
    }
    sink.send(Message::Binary(data.to_vec()))
        .await
        .map_err(|e| ProxyError::Transport(format!("WS send failed: {e}")))
}

async fn recv_data(source: &mut WsSource) -> ProxyResult<Option<Vec<u8>>> {
    loop {
        match source.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                if let Some(frame) = frame {
                    debug!(code = %frame.code, reason = %frame.reason, "server closed tunnel");
                }
                return Ok(None);
            }
            None => return Ok(None),
            Some(Ok(_)) => {
                return Err(ProxyError::Protocol(
                    "unexpected non-binary message in relay mode".into(),
                ))
            }
            Some(Err(e)) => return Err(ProxyError::Transport(format!("WS recv failed: {e}"))),
        }
    }
}
