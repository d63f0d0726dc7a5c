//! Error types for Mockwire

use std::io;
use thiserror::Error;

/// Result type for Mockwire operations
pub type Result<T> = std::result::Result<T, MockError>;

/// Errors that can occur in Mockwire
#[derive(Debug, Error)]
pub enum MockError {
    /// Connection is already a member of the group
    #[error("Connection {connection_id} is already in group '{group}'")]
    AlreadyInGroup {
        /// Connection ID
        connection_id: String,
        /// Group name
        group: String,
    },

    /// Connection is not a member of the group
    #[error("Connection {connection_id} is not in group '{group}'")]
    NotInGroup {
        /// Connection ID
        connection_id: String,
        /// Group name
        group: String,
    },

    /// Joining would exceed the per-connection group bound
    #[error("Connection {connection_id} cannot join more than {limit} groups")]
    TooManyGroups {
        /// Connection ID
        connection_id: String,
        /// Maximum groups per connection
        limit: usize,
    },

    /// No connection registered under this ID
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// Connection is closed or its context was cancelled
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Recording is missing or not a WebSocket recording
    #[error("Invalid recording: {0}")]
    InvalidRecording(String),

    /// Recording contains no frames
    #[error("Recording has no frames to replay")]
    NoFramesToReplay,

    /// Replay mode name not recognized
    #[error("Invalid replay mode: '{0}' (expected pure, triggered or synchronized)")]
    InvalidReplayMode(String),

    /// `start()` called on a replay that already left `pending`
    #[error("Replay already started")]
    AlreadyStarted,

    /// Operation requires a started replay
    #[error("Replay not started")]
    ReplayNotStarted,

    /// `advance()` called outside triggered mode
    #[error("Operation only valid in triggered mode")]
    TriggeredModeOnly,

    /// Synchronized replay waited too long for a client frame
    #[error("Timed out after {timeout_ms}ms waiting for client frame {sequence}")]
    ReplayTimeout {
        /// Sequence number of the awaited client frame
        sequence: u64,
        /// Configured timeout
        timeout_ms: u64,
    },

    /// Recording sink returned an error
    #[error("Recording hook failed: {0}")]
    Hook(String),

    /// Frame payload could not be decoded
    #[error("Invalid payload in frame {sequence}: {reason}")]
    InvalidPayload {
        /// Frame sequence number
        sequence: u64,
        /// Decoding failure
        reason: String,
    },

    /// Transport write or close failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl MockError {
    /// Whether the caller violated a precondition of the operation
    #[must_use]
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInGroup { .. }
                | Self::NotInGroup { .. }
                | Self::TooManyGroups { .. }
                | Self::ConnectionNotFound(_)
                | Self::InvalidRecording(_)
                | Self::NoFramesToReplay
                | Self::InvalidReplayMode(_)
                | Self::AlreadyStarted
                | Self::ReplayNotStarted
                | Self::TriggeredModeOnly
        )
    }
}
