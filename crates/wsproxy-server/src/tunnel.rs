//! The relay engine: one outbound TCP connection bridged to one inbound
//! WebSocket.
//!
//! A [`Tunnel`] owns three workers that share two bounded queues:
//!
//! ```text
//!   handler ──feed──▶ [inbound queue] ──inbound-drain──▶ TCP write
//!   TCP read ──tcp-read──▶ [outbound queue] ──outbound-drain──▶ WS send
//! ```
//!
//! Each queue has exactly one producer and one consumer, so chunk order is
//! preserved per direction. A full queue blocks its producer, which stalls the
//! read feeding it; that is the only flow control.
//!
//! Shutdown is a single `Started → ShuttingDown` transition guarded by a
//! mutex. The first caller cancels the workers' shared token; everyone else
//! is a no-op. Workers observe the token at every suspension point and exit
//! with [`WorkerOutcome::Stopped`]. The owning handler then joins the task
//! group and marks the tunnel `Closed`.

use futures_util::{Sink, SinkExt};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wsproxy_core::{Chunk, PortSpec, Protocol, ProxyError, ProxyResult};

/// Per-tunnel tuning, resolved from the `[tunnel]` config section.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Host the whitelisted ports are opened on.
    pub target_host: String,
    /// Bound of each relay queue, in chunks.
    pub queue_capacity: usize,
    /// Bytes requested per read from the target.
    pub read_chunk_size: usize,
    /// Upper bound on the outbound TCP connect.
    pub connect_timeout: Duration,
    /// Upper bound on sending the WebSocket close frame during shutdown.
    pub close_timeout: Duration,
    /// After target EOF, how long the client gets to take the remaining
    /// outbound chunks before the tunnel shuts down regardless.
    pub eof_flush_timeout: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            target_host: "localhost".to_string(),
            queue_capacity: wsproxy_core::DEFAULT_QUEUE_CAPACITY,
            read_chunk_size: wsproxy_core::DEFAULT_READ_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(2),
            eof_flush_timeout: Duration::from_secs(2),
        }
    }
}

/// Lifecycle of a tunnel. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Created,
    Started,
    ShuttingDown,
    Closed,
}

/// Close code sent to the client when the tunnel closes the WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Either side ended the session.
    Normal,
    /// The server is shutting down.
    GoingAway,
    /// The client sent a message type the relay does not accept.
    Unsupported,
}

impl CloseReason {
    pub fn frame(self) -> CloseFrame<'static> {
        let (code, reason) = match self {
            CloseReason::Normal => (CloseCode::Normal, ""),
            CloseReason::GoingAway => (CloseCode::Away, "Server shutdown"),
            CloseReason::Unsupported => (CloseCode::Unsupported, "binary messages only"),
        };
        CloseFrame {
            code,
            reason: reason.into(),
        }
    }
}

/// The three relay workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Worker {
    InboundDrain,
    TcpRead,
    OutboundDrain,
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Worker::InboundDrain => "inbound-drain",
            Worker::TcpRead => "tcp-read",
            Worker::OutboundDrain => "outbound-drain",
        })
    }
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Cancelled, or reached the end of its stream.
    Stopped,
    /// Hit an I/O fault and triggered shutdown.
    Failed(String),
}

struct Lifecycle {
    state: TunnelState,
    close_reason: CloseReason,
}

/// State shared between the owning [`Tunnel`], its workers and any
/// [`TunnelHandle`].
struct Control {
    target: PortSpec,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
}

impl Control {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> TunnelState {
        self.lifecycle().state
    }

    fn close_reason(&self) -> CloseReason {
        self.lifecycle().close_reason
    }

    /// Take the shutdown transition. Returns `true` only for the caller that
    /// performed it.
    fn shutdown(&self, reason: CloseReason) -> bool {
        let mut lifecycle = self.lifecycle();
        match lifecycle.state {
            TunnelState::Started => {
                lifecycle.state = TunnelState::ShuttingDown;
                lifecycle.close_reason = reason;
                drop(lifecycle);
                self.cancel.cancel();
                info!(target = %self.target, ?reason, "tunnel shutting down");
                true
            }
            TunnelState::Created => {
                // Never started: nothing to tear down, but no start may follow.
                lifecycle.state = TunnelState::Closed;
                false
            }
            TunnelState::ShuttingDown | TunnelState::Closed => false,
        }
    }

    fn mark_closed(&self) {
        self.lifecycle().state = TunnelState::Closed;
    }
}

/// Cloneable handle used to observe or trigger shutdown of a tunnel without
/// owning it.
#[derive(Clone)]
pub struct TunnelHandle {
    control: Arc<Control>,
}

impl TunnelHandle {
    /// Trigger shutdown. Idempotent; returns whether this call performed it.
    #[cfg(test)]
    pub fn shutdown(&self, reason: CloseReason) -> bool {
        self.control.shutdown(reason)
    }

    /// Resolves once shutdown has been triggered.
    pub async fn closing(&self) {
        self.control.cancel.cancelled().await
    }
}

/// One established relay between an inbound WebSocket and a local TCP
/// service.
///
/// `S` is the write half of the inbound connection. The handler keeps it
/// until it has sent its handshake reply, then moves it into the
/// outbound-drain worker with [`Tunnel::attach_inbound`]. From then on that
/// worker is the connection's only writer.
pub struct Tunnel<S> {
    control: Arc<Control>,
    settings: Arc<TunnelSettings>,
    inbound_tx: Option<mpsc::Sender<Chunk>>,
    sink_tx: Option<oneshot::Sender<S>>,
    workers: JoinSet<(Worker, WorkerOutcome)>,
}

impl<S> Tunnel<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: fmt::Display + Send,
{
    pub fn new(target: PortSpec, settings: Arc<TunnelSettings>) -> Self {
        Self {
            control: Arc::new(Control {
                target,
                lifecycle: Mutex::new(Lifecycle {
                    state: TunnelState::Created,
                    close_reason: CloseReason::Normal,
                }),
                cancel: CancellationToken::new(),
            }),
            settings,
            inbound_tx: None,
            sink_tx: None,
            workers: JoinSet::new(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> TunnelState {
        self.control.state()
    }

    pub fn handle(&self) -> TunnelHandle {
        TunnelHandle {
            control: self.control.clone(),
        }
    }

    /// Number of workers not yet joined.
    #[cfg(test)]
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Connect to the target and spawn the three workers.
    ///
    /// On failure the tunnel stays `Created` and no worker has been spawned.
    pub async fn start(&mut self) -> ProxyResult<()> {
        match self.control.state() {
            TunnelState::Created => {}
            TunnelState::Started | TunnelState::ShuttingDown => {
                return Err(ProxyError::AlreadyStarted)
            }
            TunnelState::Closed => return Err(ProxyError::TunnelClosed),
        }

        let target = self.control.target;
        if target.protocol() != Protocol::Tcp {
            return Err(ProxyError::UnsupportedProtocol(format!(
                "{target}: only TCP forwarding is implemented"
            )));
        }

        let stream = self.connect().await?;
        let (reader, writer) = stream.into_split();

        let capacity = self.settings.queue_capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Chunk>(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Chunk>(capacity);
        let (sink_tx, sink_rx) = oneshot::channel::<S>();

        // Spawning and the Started transition happen under the lifecycle
        // lock, so a worker that fails immediately still sees `Started`.
        let mut lifecycle = self.control.lifecycle();
        if lifecycle.state != TunnelState::Created {
            return Err(ProxyError::TunnelClosed);
        }

        self.workers.spawn(inbound_drain(
            self.control.clone(),
            inbound_rx,
            writer,
        ));
        self.workers.spawn(tcp_read(
            self.control.clone(),
            reader,
            outbound_tx,
            self.settings.read_chunk_size.max(1),
            self.settings.eof_flush_timeout,
        ));
        self.workers.spawn(outbound_drain(
            self.control.clone(),
            outbound_rx,
            sink_rx,
            self.settings.close_timeout,
        ));

        lifecycle.state = TunnelState::Started;
        drop(lifecycle);

        self.inbound_tx = Some(inbound_tx);
        self.sink_tx = Some(sink_tx);

        info!(target = %target, "tunnel established");
        Ok(())
    }

    async fn connect(&self) -> ProxyResult<TcpStream> {
        let host = self.settings.target_host.as_str();
        let port = self.control.target.port();
        let target = format!("{host}:{port}");
        let timeout = self.settings.connect_timeout;

        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ProxyError::Connect { target, source }),
            Err(_) => {
                return Err(ProxyError::ConnectTimeout {
                    target,
                    secs: timeout.as_secs(),
                })
            }
        };

        abort_on_close(&stream)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not set TCP_NODELAY");
        }

        debug!(target = %target, "connected to target");
        Ok(stream)
    }

    /// Hand the inbound connection's write half to the outbound-drain worker.
    ///
    /// Gives the sink back if the tunnel is not running (never started, or
    /// already shutting down) so the caller can still close it.
    pub fn attach_inbound(&mut self, sink: S) -> Result<(), S> {
        match self.sink_tx.take() {
            Some(tx) => tx.send(sink),
            None => Err(sink),
        }
    }

    /// Enqueue a chunk for the target, waiting while the inbound queue is
    /// full. `Chunk::End` also triggers shutdown directly.
    pub async fn feed(&self, chunk: Chunk) -> ProxyResult<()> {
        match self.control.state() {
            TunnelState::Created => return Err(ProxyError::NotStarted),
            TunnelState::ShuttingDown | TunnelState::Closed => {
                return Err(ProxyError::TunnelClosed)
            }
            TunnelState::Started => {}
        }
        let tx = self.inbound_tx.as_ref().ok_or(ProxyError::TunnelClosed)?;

        let end = chunk.is_end();
        tokio::select! {
            biased;
            _ = self.control.cancel.cancelled() => return Err(ProxyError::TunnelClosed),
            sent = tx.send(chunk) => sent.map_err(|_| ProxyError::TunnelClosed)?,
        }

        if end {
            self.control.shutdown(CloseReason::Normal);
        }
        Ok(())
    }

    /// Shut down with a normal close.
    pub async fn shutdown(&mut self) -> bool {
        self.shutdown_with(CloseReason::Normal).await
    }

    /// Trigger shutdown (if nobody has yet), join every worker, and mark the
    /// tunnel `Closed`. Safe to call repeatedly.
    ///
    /// Returns whether this call performed the shutdown transition.
    pub async fn shutdown_with(&mut self, reason: CloseReason) -> bool {
        let performed = self.control.shutdown(reason);
        self.inbound_tx = None;
        self.sink_tx = None;
        self.join_workers().await;
        self.control.mark_closed();
        performed
    }

    async fn join_workers(&mut self) {
        let target = self.control.target;
        let workers = &mut self.workers;
        let join_all = async {
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok((worker, WorkerOutcome::Failed(reason))) => {
                        warn!(target = %target, %worker, %reason, "relay worker failed");
                    }
                    Ok((worker, WorkerOutcome::Stopped)) => {
                        debug!(target = %target, %worker, "relay worker stopped");
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!(target = %target, error = %e, "relay worker panicked"),
                }
            }
        };

        // Workers only linger past cancellation while sending the close frame.
        let grace = self.settings.close_timeout * 2;
        if tokio::time::timeout(grace, join_all).await.is_err() {
            warn!(target = %target, "relay workers did not stop in time, aborting");
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }
    }
}

/// Make dropping the socket send RST instead of FIN.
#[allow(deprecated)]
fn abort_on_close(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_linger(Some(Duration::ZERO))
}

/// inbound queue → TCP.
async fn inbound_drain(
    control: Arc<Control>,
    mut inbound_rx: mpsc::Receiver<Chunk>,
    mut writer: OwnedWriteHalf,
) -> (Worker, WorkerOutcome) {
    let outcome = loop {
        let chunk = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => break WorkerOutcome::Stopped,
            chunk = inbound_rx.recv() => chunk,
        };

        let data = match chunk {
            Some(Chunk::Data(data)) => data,
            Some(Chunk::End) | None => {
                control.shutdown(CloseReason::Normal);
                break WorkerOutcome::Stopped;
            }
        };

        let written = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => break WorkerOutcome::Stopped,
            written = write_and_flush(&mut writer, &data) => written,
        };
        if let Err(e) = written {
            control.shutdown(CloseReason::Normal);
            break WorkerOutcome::Failed(format!("write to target: {e}"));
        }
    };

    // Leave the socket open until the read half drops; the close is then
    // an abort, never a graceful FIN.
    writer.forget();
    (Worker::InboundDrain, outcome)
}

async fn write_and_flush(writer: &mut OwnedWriteHalf, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

/// TCP → outbound queue.
///
/// A clean EOF queues `End` behind the pending chunks so everything the
/// service wrote before closing can still reach the client. The
/// outbound-drain worker shuts down when it reaches `End`; if it has not
/// within `eof_flush_timeout` (a client that stopped reading), shutdown is
/// triggered here and the remaining chunks are dropped.
async fn tcp_read(
    control: Arc<Control>,
    mut reader: OwnedReadHalf,
    outbound_tx: mpsc::Sender<Chunk>,
    chunk_size: usize,
    eof_flush_timeout: Duration,
) -> (Worker, WorkerOutcome) {
    let mut buf = vec![0u8; chunk_size];

    let outcome = loop {
        let read = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => break WorkerOutcome::Stopped,
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                debug!(target = %control.target, "target closed connection");
                flush_then_shutdown(&control, &outbound_tx, eof_flush_timeout).await;
                break WorkerOutcome::Stopped;
            }
            Ok(n) => n,
            Err(e) => {
                // Best effort: shutdown below ends the outbound drain either way.
                if let Err(e) = outbound_tx.try_send(Chunk::End) {
                    debug!(target = %control.target, error = %e, "end marker not queued");
                }
                control.shutdown(CloseReason::Normal);
                break WorkerOutcome::Failed(format!("read from target: {e}"));
            }
        };

        let sent = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => break WorkerOutcome::Stopped,
            sent = outbound_tx.send(Chunk::Data(buf[..n].to_vec())) => sent,
        };
        if sent.is_err() {
            control.shutdown(CloseReason::Normal);
            break WorkerOutcome::Stopped;
        }
    };

    (Worker::TcpRead, outcome)
}

/// Queue `End` and wait, bounded, for the outbound-drain worker to reach it.
async fn flush_then_shutdown(
    control: &Control,
    outbound_tx: &mpsc::Sender<Chunk>,
    eof_flush_timeout: Duration,
) {
    let drained = tokio::time::timeout(eof_flush_timeout, async {
        tokio::select! {
            biased;
            _ = control.cancel.cancelled() => {}
            sent = outbound_tx.send(Chunk::End) => {
                if sent.is_ok() {
                    control.cancel.cancelled().await;
                }
            }
        }
    })
    .await;

    if drained.is_err() {
        debug!(target = %control.target, "client did not drain after target EOF");
    }
    // No-op when the outbound-drain worker already shut down.
    control.shutdown(CloseReason::Normal);
}

/// outbound queue → WebSocket. Closes the WebSocket on the way out.
async fn outbound_drain<S>(
    control: Arc<Control>,
    mut outbound_rx: mpsc::Receiver<Chunk>,
    sink_rx: oneshot::Receiver<S>,
    close_timeout: Duration,
) -> (Worker, WorkerOutcome)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: fmt::Display + Send,
{
    let mut sink = tokio::select! {
        biased;
        _ = control.cancel.cancelled() => return (Worker::OutboundDrain, WorkerOutcome::Stopped),
        sink = sink_rx => match sink {
            Ok(sink) => sink,
            // The handler kept the connection; it closes it itself.
            Err(_) => return (Worker::OutboundDrain, WorkerOutcome::Stopped),
        },
    };

    let outcome = loop {
        let chunk = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => break WorkerOutcome::Stopped,
            chunk = outbound_rx.recv() => chunk,
        };

        let data = match chunk {
            Some(Chunk::Data(data)) => data,
            Some(Chunk::End) | None => {
                control.shutdown(CloseReason::Normal);
                break WorkerOutcome::Stopped;
            }
        };

        let sent = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => break WorkerOutcome::Stopped,
            sent = sink.send(Message::Binary(data)) => sent,
        };
        if let Err(e) = sent {
            control.shutdown(CloseReason::Normal);
            break WorkerOutcome::Failed(format!("send to client: {e}"));
        }
    };

    let frame = control.close_reason().frame();
    match tokio::time::timeout(close_timeout, sink.send(Message::Close(Some(frame)))).await {
        Ok(Ok(())) => debug!(target = %control.target, "sent close frame"),
        Ok(Err(e)) => debug!(target = %control.target, error = %e, "close frame not sent"),
        Err(_) => debug!(target = %control.target, "timed out sending close frame"),
    }

    (Worker::OutboundDrain, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_util::sync::PollSender;

    type TestSink = PollSender<Message>;

    fn settings() -> Arc<TunnelSettings> {
        Arc::new(TunnelSettings {
            target_host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_secs(2),
            close_timeout: Duration::from_millis(500),
            eof_flush_timeout: Duration::from_millis(500),
            ..Default::default()
        })
    }

    /// Echo every byte back until the peer goes away.
    async fn spawn_echo() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        port
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn test_sink() -> (TestSink, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        (PollSender::new(tx), rx)
    }

    async fn next_message(rx: &mut mpsc::Receiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("sink channel closed")
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let port = spawn_echo().await;
        let mut tunnel: Tunnel<TestSink> = Tunnel::new(PortSpec::tcp(port), settings());
        tunnel.start().await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::Started);
        assert_eq!(tunnel.active_workers(), 3);

        assert!(matches!(tunnel.start().await, Err(ProxyError::AlreadyStarted)));

        tunnel.shutdown().await;
        assert_eq!(tunnel.state(), TunnelState::Closed);
        assert_eq!(tunnel.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_failed_start_spawns_nothing() {
        let port = unused_port().await;
        let mut tunnel: Tunnel<TestSink> = Tunnel::new(PortSpec::tcp(port), settings());
        let err = tunnel.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::Connect { .. }), "got {err:?}");
        assert_eq!(tunnel.state(), TunnelState::Created);
        assert_eq!(tunnel.active_workers(), 0);
        assert!(matches!(
            tunnel.feed(Chunk::Data(b"x".to_vec())).await,
            Err(ProxyError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_udp_is_unsupported() {
        let mut tunnel: Tunnel<TestSink> = Tunnel::new(PortSpec::udp(53), settings());
        let err = tunnel.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::UnsupportedProtocol(_)));
        assert!(err.is_unavailable());
        assert_eq!(tunnel.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_relays_chunks_in_order() {
        let port = spawn_echo().await;
        let mut tunnel = Tunnel::new(PortSpec::tcp(port), settings());
        tunnel.start().await.unwrap();
        let (sink, mut rx) = test_sink();
        assert!(tunnel.attach_inbound(sink).is_ok());

        for chunk in [&b"one,"[..], b"two,", b"three"] {
            tunnel.feed(Chunk::Data(chunk.to_vec())).await.unwrap();
        }

        let mut echoed = Vec::new();
        while echoed.len() < b"one,two,three".len() {
            match next_message(&mut rx).await {
                Message::Binary(data) => echoed.extend_from_slice(&data),
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(echoed, b"one,two,three");

        tunnel.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_runs_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let mut tunnel = Tunnel::new(PortSpec::tcp(port), settings());
        tunnel.start().await.unwrap();
        let (sink, mut rx) = test_sink();
        assert!(tunnel.attach_inbound(sink).is_ok());
        let mut target = accepted.await.unwrap();

        let a = tunnel.handle();
        let b = tunnel.handle();
        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.shutdown(CloseReason::Normal) }),
            tokio::spawn(async move { b.shutdown(CloseReason::Normal) }),
        );
        assert!(first.unwrap() ^ second.unwrap(), "exactly one caller shuts down");
        assert_eq!(tunnel.state(), TunnelState::ShuttingDown);

        assert!(!tunnel.shutdown().await);
        assert_eq!(tunnel.state(), TunnelState::Closed);
        assert!(!tunnel.shutdown().await);

        // One close frame, then the sink is dropped.
        let mut closes = 0;
        while let Some(msg) = rx.recv().await {
            if let Message::Close(frame) = msg {
                assert_eq!(frame.unwrap().code, CloseCode::Normal);
                closes += 1;
            }
        }
        assert_eq!(closes, 1);

        // The target connection was torn down.
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), target.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_target_eof_flushes_then_closes_inbound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"goodbye").await.unwrap();
        });

        let mut tunnel = Tunnel::new(PortSpec::tcp(port), settings());
        tunnel.start().await.unwrap();
        let (sink, mut rx) = test_sink();
        assert!(tunnel.attach_inbound(sink).is_ok());

        let mut received = Vec::new();
        loop {
            match next_message(&mut rx).await {
                Message::Binary(data) => received.extend_from_slice(&data),
                Message::Close(frame) => {
                    assert_eq!(frame.unwrap().code, CloseCode::Normal);
                    break;
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(received, b"goodbye");

        tokio::time::timeout(Duration::from_secs(5), tunnel.handle().closing())
            .await
            .unwrap();
        assert!(!tunnel.shutdown().await, "EOF already shut the tunnel down");
    }

    #[tokio::test]
    async fn test_target_eof_with_stalled_client_still_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&vec![7u8; 256 * 1024]).await.unwrap();
        });

        let mut tunnel = Tunnel::new(PortSpec::tcp(port), settings());
        tunnel.start().await.unwrap();
        // Room for one message, and nobody ever takes it.
        let (tx, _rx) = mpsc::channel::<Message>(1);
        assert!(tunnel.attach_inbound(PollSender::new(tx)).is_ok());

        tokio::time::timeout(Duration::from_secs(3), tunnel.handle().closing())
            .await
            .expect("target EOF must end the tunnel even if the client stalls");
        assert!(!tunnel.shutdown().await);
        assert_eq!(tunnel.state(), TunnelState::Closed);
        assert_eq!(tunnel.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_end_chunk_shuts_down_and_rejects_further_feeds() {
        let port = spawn_echo().await;
        let mut tunnel: Tunnel<TestSink> = Tunnel::new(PortSpec::tcp(port), settings());
        tunnel.start().await.unwrap();

        tunnel.feed(Chunk::End).await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::ShuttingDown);
        assert!(matches!(
            tunnel.feed(Chunk::Data(b"late".to_vec())).await,
            Err(ProxyError::TunnelClosed)
        ));

        tunnel.shutdown().await;
        assert!(matches!(
            tunnel.feed(Chunk::Data(b"later".to_vec())).await,
            Err(ProxyError::TunnelClosed)
        ));
    }

    #[tokio::test]
    async fn test_going_away_close_code() {
        let port = spawn_echo().await;
        let mut tunnel = Tunnel::new(PortSpec::tcp(port), settings());
        tunnel.start().await.unwrap();
        let (sink, mut rx) = test_sink();
        assert!(tunnel.attach_inbound(sink).is_ok());

        assert!(tunnel.shutdown_with(CloseReason::GoingAway).await);
        match next_message(&mut rx).await {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Away);
                assert_eq!(frame.reason, "Server shutdown");
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_attach_after_shutdown_returns_sink() {
        let port = spawn_echo().await;
        let mut tunnel = Tunnel::new(PortSpec::tcp(port), settings());
        tunnel.start().await.unwrap();
        tunnel.shutdown().await;

        let (sink, _rx) = test_sink();
        assert!(tunnel.attach_inbound(sink).is_err());
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        const CHUNK: usize = 64 * 1024;
        const MAX_CHUNKS: usize = 4096;
        const EXTRA: usize = 3;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (resume_tx, resume_rx) = oneshot::channel::<usize>();
        let target = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Not reading until told how much to expect.
            let expected = resume_rx.await.unwrap();
            let mut received = vec![0u8; expected];
            stream.read_exact(&mut received).await.unwrap();
            received
        });

        let mut tunnel: Tunnel<TestSink> = Tunnel::new(
            PortSpec::tcp(port),
            Arc::new(TunnelSettings {
                queue_capacity: 2,
                ..(*settings()).clone()
            }),
        );
        tunnel.start().await.unwrap();

        let pattern = |i: usize| vec![(i % 251) as u8; CHUNK];

        let mut fed = 0;
        let mut stalled = false;
        while fed < MAX_CHUNKS {
            let feed = tunnel.feed(Chunk::Data(pattern(fed)));
            match tokio::time::timeout(Duration::from_millis(250), feed).await {
                Ok(result) => {
                    result.unwrap();
                    fed += 1;
                }
                Err(_) => {
                    stalled = true;
                    break;
                }
            }
        }
        assert!(stalled, "feeding never blocked after {fed} chunks");

        resume_tx.send((fed + EXTRA) * CHUNK).unwrap();
        for i in fed..fed + EXTRA {
            tunnel.feed(Chunk::Data(pattern(i))).await.unwrap();
        }

        let received = tokio::time::timeout(Duration::from_secs(30), target)
            .await
            .unwrap()
            .unwrap();
        for (i, chunk) in received.chunks(CHUNK).enumerate() {
            assert!(chunk.iter().all(|b| *b == (i % 251) as u8), "chunk {i} out of order");
        }

        tunnel.shutdown().await;
    }
}
