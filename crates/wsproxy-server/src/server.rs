//! Core server: accepts connections and dispatches each to the handler.
//!
//! Owns the listener, the session registry and the set of connection tasks.
//! On shutdown it stops accepting, tells every open session the server is
//! going away, and waits (bounded) for them to finish.

use crate::config::ServerConfig;
use crate::handler::{self, HandlerContext};
use crate::registry::SessionRegistry;
use crate::transport::{Upgrader, WebSocketListener};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use wsproxy_core::ProxyResult;

/// The wsproxy server instance.
pub struct ProxyServer {
    listener: WebSocketListener,
    ctx: Arc<HandlerContext>,
    registry: Arc<SessionRegistry>,
    shutdown_grace: Duration,
}

impl ProxyServer {
    /// Bind the listener. Fails if the address is unavailable.
    pub async fn bind(
        config: ServerConfig,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> ProxyResult<Self> {
        let listener = WebSocketListener::bind(
            &config.bind,
            config.port,
            tls,
            &config.path,
            config.max_message_size,
            config.handshake_timeout,
        )
        .await?;

        let registry = Arc::new(SessionRegistry::new());
        let ctx = Arc::new(HandlerContext {
            whitelist: config.whitelist,
            tunnel: config.tunnel,
            handshake_timeout: config.handshake_timeout,
            registry: registry.clone(),
        });

        Ok(Self {
            listener,
            ctx,
            registry,
            shutdown_grace: config.shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Accept connections until `shutdown` resolves, then close every open
    /// session with "going away".
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> ProxyResult<()> {
        let Self {
            listener,
            ctx,
            registry,
            shutdown_grace,
        } = self;
        let upgrader = listener.upgrader();
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(remote = %remote, "accepted connection");
                        connections.spawn(serve_connection(
                            stream,
                            remote,
                            upgrader.clone(),
                            ctx.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        for entry in registry.list() {
            debug!(
                remote = %entry.remote_addr,
                age_secs = entry.connected_at.elapsed().as_secs(),
                "closing session"
            );
        }
        let notified = registry.broadcast_going_away();
        info!(sessions = notified, "shutting down, closing open sessions");

        let drained = tokio::time::timeout(shutdown_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "sessions did not close within grace period, aborting"
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        info!("server stopped");
        Ok(())
    }
}

/// TLS (if configured), WebSocket upgrade, then the session handler.
async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    upgrader: Upgrader,
    ctx: Arc<HandlerContext>,
) {
    let result = match upgrader.tls() {
        Some(acceptor) => match upgrader.accept_tls(acceptor, stream).await {
            Ok(tls) => match upgrader.upgrade(tls).await {
                Ok(ws) => handler::handle_connection(ws, remote, ctx).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        },
        None => match upgrader.upgrade(stream).await {
            Ok(ws) => handler::handle_connection(ws, remote, ctx).await,
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        debug!(remote = %remote, error = %e, "connection ended with error");
    }
}
