//! WebSocket session registry
//!
//! `Connection` holds per-session state; `ConnectionManager` is the single
//! source of truth for who is online and who belongs to which group.

mod connection;
mod manager;
mod transport;

pub use connection::{Connection, ConnectionInfo};
pub use manager::{ConnectionManager, ManagerStats};
pub use transport::{ChannelTransport, OutboundMessage, Transport, TransportEvent};

/// Default bound on groups a single connection may join
pub const MAX_GROUPS_PER_CONNECTION: usize = 100;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Endpoint going away (server shutdown)
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Server hit an unexpected condition
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
