//! wsproxy: client CLI for the WebSocket-to-TCP proxy.
//!
//! Bridges stdin/stdout (for use as an SSH `ProxyCommand`) or a local TCP
//! listener through a wsproxy tunnel.

mod commands;

use clap::{Parser, Subcommand};
use tracing::error;
use wsproxy_core::PortSpec;

#[derive(Parser)]
#[command(name = "wsproxy", version, about = "Tunnel TCP through a wsproxy WebSocket relay")]
struct Cli {
    /// Enable debug logging (stderr)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bridge stdin/stdout through a tunnel
    Stdio {
        /// Relay endpoint (ws:// or wss://)
        url: String,
        /// Target as PROTOCOL:PORT, e.g. TCP:22
        spec: PortSpec,
    },

    /// Accept local TCP connections and tunnel each one
    Forward {
        /// Relay endpoint (ws:// or wss://)
        url: String,
        /// Target as PROTOCOL:PORT, e.g. TCP:22
        spec: PortSpec,
        /// Local address to listen on
        #[arg(short, long, default_value = "127.0.0.1:2222")]
        listen: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays a clean byte stream.
    let filter = if cli.verbose {
        "wsproxy=debug,wsproxy_cli=debug,wsproxy_client=debug"
    } else {
        "wsproxy=warn,wsproxy_cli=warn,wsproxy_client=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose)
        .init();

    let result = match cli.command {
        Command::Stdio { url, spec } => commands::stdio::run(&url, spec).await,
        Command::Forward { url, spec, listen } => {
            commands::forward::run(&url, spec, &listen).await
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("wsproxy: {e:#}");
        std::process::exit(1);
    }
}
