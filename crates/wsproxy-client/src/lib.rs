//! wsproxy-client: Rust client library for the wsproxy relay.
//!
//! Opens a WebSocket to a wsproxy server, requests one whitelisted
//! `PROTOCOL:PORT` target, and exposes the resulting relay as a
//! [`TunnelStream`].
//!
//! # Quick Start
//!
//! ```no_run
//! use wsproxy_client::{PortSpec, TunnelClient};
//!
//! # async fn example() -> wsproxy_client::ProxyResult<()> {
//! let mut tunnel = TunnelClient::connect("wss://example.com/", PortSpec::tcp(22)).await?;
//! tunnel.send(b"SSH-2.0-example\r\n").await?;
//!
//! if let Some(banner) = tunnel.recv().await? {
//!     println!("{}", String::from_utf8_lossy(&banner));
//! }
//!
//! tunnel.finish().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod stream;

pub use client::TunnelClient;
pub use stream::{BridgeStats, TunnelStream};

// Re-export wsproxy-core types for convenience.
pub use wsproxy_core::{HandshakeStatus, PortSpec, Protocol, ProxyError, ProxyResult};
