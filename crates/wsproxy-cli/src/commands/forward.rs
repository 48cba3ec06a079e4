//! `wsproxy forward <URL> <SPEC> [--listen ADDR]`: local port forward.
//!
//! Every accepted local connection gets its own tunnel. A tunnel that fails
//! to open only drops that connection.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use wsproxy_client::TunnelClient;
use wsproxy_core::PortSpec;

pub async fn run(url: &str, spec: PortSpec, listen: &str) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to listen on {listen}"))?;
    let local = listener.local_addr()?;
    info!(listen = %local, url = %url, target = %spec, "forwarding");
    eprintln!("wsproxy: forwarding {local} -> {spec} via {url}");

    let client = TunnelClient::new(url);
    tokio::select! {
        result = serve(listener, client, spec) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    }
}

/// Accept loop, split out so tests can drive it without signals.
async fn serve(listener: TcpListener, client: TunnelClient, spec: PortSpec) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = forward_one(stream, peer, &client, spec).await {
                warn!(peer = %peer, error = %format!("{e:#}"), "forward failed");
            }
        });
    }
}

async fn forward_one(
    stream: TcpStream,
    peer: SocketAddr,
    client: &TunnelClient,
    spec: PortSpec,
) -> Result<()> {
    debug!(peer = %peer, "local connection");
    let tunnel = client
        .open(spec)
        .await
        .with_context(|| format!("failed to open tunnel to {spec}"))?;

    let (reader, writer) = stream.into_split();
    let stats = tunnel.bridge(reader, writer).await?;
    debug!(peer = %peer, sent = stats.sent, received = stats.received, "local connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::Message;

    /// Relay stand-in: SUCCESS for TCP:7, INVALID_PORT otherwise, then echo.
    async fn relay_stub() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    let Some(Ok(Message::Text(request))) = ws.next().await else {
                        return;
                    };
                    if request != "TCP:7" {
                        let _ = ws.send(Message::Text("INVALID_PORT".into())).await;
                        let _ = ws.close(None).await;
                        return;
                    }
                    ws.send(Message::Text("SUCCESS".into())).await.unwrap();
                    while let Some(Ok(msg)) = ws.next().await {
                        match msg {
                            Message::Binary(data) if data.is_empty() => {
                                let _ = ws.close(None).await;
                            }
                            Message::Binary(data) => {
                                if ws.send(Message::Binary(data)).await.is_err() {
                                    break;
                                }
                            }
                            _ => {}
                        }
                    }
                });
            }
        });
        url
    }

    async fn start_forward(spec: PortSpec) -> SocketAddr {
        let url = relay_stub().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, TunnelClient::new(url), spec));
        addr
    }

    #[tokio::test]
    async fn test_each_connection_gets_a_tunnel() {
        let addr = start_forward(PortSpec::tcp(7)).await;

        for payload in [&b"first"[..], &b"second"[..]] {
            let mut conn = TcpStream::connect(addr).await.unwrap();
            conn.write_all(payload).await.unwrap();
            let mut buf = vec![0u8; payload.len()];
            tokio::time::timeout(Duration::from_secs(5), conn.read_exact(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(buf, payload);
        }
    }

    #[tokio::test]
    async fn test_rejected_tunnel_drops_connection() {
        let addr = start_forward(PortSpec::tcp(8)).await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
