//! Network layer for Mockwire
//!
//! Accepts WebSocket clients, registers them with the session core and
//! either replays a recording to each one or proxies it to an upstream
//! server while recording.

mod admission;
mod handler;
mod server;
mod websocket;

pub use admission::{ConnectionLimit, SessionPermit};
pub use server::MockServer;
pub use websocket::{close_parts, message_data, to_message, WsTransport};

/// Upstream connect timeout (record mode)
pub const CONNECT_TIMEOUT_MS: u64 = 5000;

/// Client handshake timeout
pub const HANDSHAKE_TIMEOUT_MS: u64 = 5000;

/// Graceful shutdown timeout
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;
