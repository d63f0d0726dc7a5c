//! Configuration types for Mockwire

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::replay::ReplayConfig;
use crate::session::MAX_GROUPS_PER_CONNECTION;
use crate::{MockError, Result};

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Proxy clients to an upstream server and capture the conversation
    Record,
    /// Play a captured conversation back to every client
    Replay,
}

impl Mode {
    /// Check if mode is Record
    #[must_use]
    pub fn is_record(&self) -> bool {
        matches!(self, Mode::Record)
    }

    /// Check if mode is Replay
    #[must_use]
    pub fn is_replay(&self) -> bool {
        matches!(self, Mode::Replay)
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Operating mode
    pub mode: Mode,
    /// Listener and peer settings
    pub server: ServerConfig,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Replay behaviour
    #[serde(default)]
    pub replay: ReplaySettings,
    /// Where captured sessions are written
    #[serde(default)]
    pub recording: RecordingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to accept WebSocket clients on
    pub listen_addr: SocketAddr,
    /// Upstream WebSocket URL (record mode)
    #[serde(default)]
    pub upstream_url: Option<String>,
    /// Recording to play back (replay mode)
    #[serde(default)]
    pub recording: Option<PathBuf>,
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum groups a single connection may join
    pub max_groups_per_connection: usize,
    /// Inbound client messages buffered per synchronized replay
    pub inbound_buffer: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 4096,
            max_groups_per_connection: MAX_GROUPS_PER_CONNECTION,
            inbound_buffer: 64,
        }
    }
}

/// Replay settings as written in the config file
///
/// Converted into a [`ReplayConfig`] with [`ReplayConfig::from_settings`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySettings {
    /// `pure`, `triggered` or `synchronized`
    pub mode: String,
    /// Playback speed multiplier (pure mode)
    pub timing_scale: f64,
    /// Skip client frames instead of waiting out their timing
    pub skip_client_frames: bool,
    /// Wait limit for an expected client frame (synchronized mode)
    pub timeout_ms: u64,
    /// `error` or `abort` when the wait limit is hit
    pub on_timeout: String,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            mode: "pure".to_string(),
            timing_scale: 1.0,
            skip_client_frames: true,
            timeout_ms: 30_000,
            on_timeout: "error".to_string(),
        }
    }
}

/// Recording output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Directory receiving `<connection-id>.json` files
    pub dir: PathBuf,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("recordings"),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MockError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string without validating it
    ///
    /// # Errors
    ///
    /// Returns error if the TOML is malformed
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| MockError::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Replay configuration derived from `[replay]` and `[limits]`
    ///
    /// # Errors
    ///
    /// Returns `InvalidReplayMode` or `ConfigError` for bad settings
    pub fn replay_config(&self) -> Result<ReplayConfig> {
        ReplayConfig::from_settings(&self.replay, self.limits.inbound_buffer)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            Mode::Record => {
                let upstream = self.server.upstream_url.as_deref().unwrap_or_default();
                if !upstream.starts_with("ws://") {
                    return Err(MockError::ConfigError(
                        "Record mode requires a ws:// server.upstream_url".to_string(),
                    ));
                }
                if !self.recording.dir.is_dir() {
                    return Err(MockError::ConfigError(format!(
                        "Recording directory does not exist: {}",
                        self.recording.dir.display()
                    )));
                }
            }
            Mode::Replay => match &self.server.recording {
                Some(path) if path.is_file() => {}
                Some(path) => {
                    return Err(MockError::ConfigError(format!(
                        "Recording file does not exist: {}",
                        path.display()
                    )));
                }
                None => {
                    return Err(MockError::ConfigError(
                        "Replay mode requires server.recording".to_string(),
                    ));
                }
            },
        }

        if self.limits.max_connections == 0 {
            return Err(MockError::ConfigError(
                "limits.max_connections must be > 0".to_string(),
            ));
        }
        if self.limits.max_groups_per_connection == 0 {
            return Err(MockError::ConfigError(
                "limits.max_groups_per_connection must be > 0".to_string(),
            ));
        }
        if self.limits.inbound_buffer == 0 {
            return Err(MockError::ConfigError(
                "limits.inbound_buffer must be > 0".to_string(),
            ));
        }

        self.replay_config()?;
        Ok(())
    }
}
