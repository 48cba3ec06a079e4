//! `wsproxy stdio <URL> <SPEC>`: bridge stdin/stdout through one tunnel.
//!
//! Meant for `ssh -o ProxyCommand='wsproxy stdio wss://host/ TCP:22' host`.

use anyhow::{Context, Result};
use tracing::{debug, info};
use wsproxy_client::TunnelClient;
use wsproxy_core::PortSpec;

pub async fn run(url: &str, spec: PortSpec) -> Result<()> {
    info!(url = %url, target = %spec, "opening tunnel");

    let tunnel = TunnelClient::connect(url, spec)
        .await
        .with_context(|| format!("failed to open tunnel to {spec} via {url}"))?;

    let stats = tunnel
        .bridge(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("tunnel failed")?;

    debug!(sent = stats.sent, received = stats.received, "tunnel closed");
    Ok(())
}
