//! wsproxy-server: WebSocket-to-TCP proxy.
//!
//! Accepts WebSocket connections, lets each client pick one whitelisted
//! `PROTOCOL:PORT` target on the local host, and relays binary messages to
//! and from that TCP service until either side ends the session.

mod config;
mod handler;
mod registry;
mod server;
mod tls;
mod transport;
mod tunnel;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::ProxyServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use wsproxy_core::PortSpec;

/// wsproxy-server: relay whitelisted local ports over WebSocket
#[derive(Parser, Debug)]
#[command(name = "wsproxy-server", version, about = "WebSocket-to-TCP proxy server")]
struct Cli {
    /// Address to listen on
    #[arg(short, long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// TLS certificate (PEM)
    #[arg(long = "ssl-cert-file")]
    ssl_cert_file: Option<String>,

    /// TLS private key (PEM)
    #[arg(long = "ssl-key-file")]
    ssl_key_file: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.wsproxy/config.toml")]
    config: String,

    /// Increase log verbosity (-v warn, -vv info, -vvv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Ports clients may forward to, as PROTOCOL:PORT (e.g. TCP:22)
    #[arg(value_name = "FORWARD_PORT")]
    forward_port: Vec<PortSpec>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let level = match cli.verbose {
        0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        CliOverrides {
            bind: cli.bind,
            port: cli.port,
            cert: cli.ssl_cert_file,
            key: cli.ssl_key_file,
            forward: cli.forward_port,
        },
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let tls_config = match (&server_config.cert_path, &server_config.key_path) {
        (Some(cert), Some(key)) => match tls::load_tls_config(cert, key) {
            Ok(cfg) => Some(Arc::new(cfg)),
            Err(e) => {
                error!(error = %e, "failed to load TLS config");
                std::process::exit(1);
            }
        },
        _ => None,
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %server_config.bind,
        port = server_config.port,
        tls = server_config.tls_enabled(),
        forwards = server_config.whitelist.len(),
        "starting wsproxy-server"
    );

    let proxy_server = match ProxyServer::bind(server_config, tls_config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    if let Err(e) = proxy_server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("wsproxy-server stopped");
}

/// Wait for SIGINT, SIGTERM or SIGHUP.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sighup) =
            match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
                (Ok(term), Ok(hup)) => (term, hup),
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "failed to install signal handlers");
                    ctrl_c.await;
                    info!("received shutdown signal");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
            _ = sighup.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }

    info!("received shutdown signal");
}
