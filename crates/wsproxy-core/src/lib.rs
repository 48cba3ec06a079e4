//! wsproxy-core: Shared protocol library for the WebSocket-to-TCP proxy.
//!
//! Provides the `PROTOCOL:PORT` target type and its whitelist, the handshake
//! status codes exchanged before relay mode, the queue element used by the
//! relay engine, and the error type shared by server and client.

pub mod chunk;
pub mod error;
pub mod port_spec;
pub mod status;

// Re-export commonly used items at crate root.
pub use chunk::Chunk;
pub use error::{ProxyError, ProxyResult};
pub use port_spec::{PortSpec, Protocol, Whitelist};
pub use status::HandshakeStatus;

/// Default bound, in chunks, of each relay queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Default number of bytes requested per read from the target socket.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;
