//! Inbound transport: TCP listener, optional TLS, WebSocket upgrade.

pub mod websocket;

pub use websocket::{Upgrader, WebSocketListener};
