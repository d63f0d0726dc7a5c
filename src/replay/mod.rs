//! Replay of recorded WebSocket conversations onto live connections

mod engine;

pub use engine::Replayer;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::config::ReplaySettings;
use crate::{MockError, Result};

/// Default wait for an expected client frame in synchronized mode
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of inbound client messages buffered in synchronized mode
pub const DEFAULT_INBOUND_BUFFER: usize = 64;

/// What a synchronized replay does when a client frame never arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// End the replay in `error`
    #[default]
    Error,
    /// End the replay in `aborted`
    Abort,
}

impl FromStr for TimeoutPolicy {
    type Err = MockError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "error" => Ok(Self::Error),
            "abort" => Ok(Self::Abort),
            other => Err(MockError::ConfigError(format!(
                "Unknown timeout policy '{other}' (expected error or abort)"
            ))),
        }
    }
}

/// Timing discipline, carrying only the data its mode needs
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplayMode {
    /// Emit server frames on the recorded timeline, divided by `timing_scale`
    Pure {
        /// Values above 1.0 play faster
        timing_scale: f64,
    },
    /// Emit server frames only when `Replayer::advance` is called
    Triggered,
    /// Emit server frames once the preceding client frames have arrived
    Synchronized {
        /// Wait limit per expected client frame
        timeout: Duration,
        /// Outcome when the wait limit is hit
        on_timeout: TimeoutPolicy,
        /// Inbound message buffer capacity
        buffer: usize,
    },
}

impl ReplayMode {
    /// Pure mode at recorded speed
    #[must_use]
    pub fn pure() -> Self {
        Self::Pure { timing_scale: 1.0 }
    }

    /// Synchronized mode with default buffering and error-on-timeout
    #[must_use]
    pub fn synchronized(timeout: Duration) -> Self {
        Self::Synchronized {
            timeout,
            on_timeout: TimeoutPolicy::Error,
            buffer: DEFAULT_INBOUND_BUFFER,
        }
    }

    /// Mode name as used in configuration
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pure { .. } => "pure",
            Self::Triggered => "triggered",
            Self::Synchronized { .. } => "synchronized",
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            Self::Pure { timing_scale } if !(timing_scale.is_finite() && timing_scale > 0.0) => {
                Err(MockError::ConfigError(format!(
                    "timing_scale must be a positive number, got {timing_scale}"
                )))
            }
            Self::Synchronized { timeout, .. } if timeout.is_zero() => Err(
                MockError::ConfigError("synchronized timeout must be > 0".to_string()),
            ),
            Self::Synchronized { buffer: 0, .. } => Err(MockError::ConfigError(
                "synchronized inbound buffer must be > 0".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

impl FromStr for ReplayMode {
    type Err = MockError;

    /// Parse a mode name, using default parameters for the mode
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pure" => Ok(Self::pure()),
            "triggered" => Ok(Self::Triggered),
            "synchronized" => Ok(Self::synchronized(DEFAULT_TIMEOUT)),
            other => Err(MockError::InvalidReplayMode(other.to_string())),
        }
    }
}

/// Replay configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayConfig {
    /// Timing discipline
    pub mode: ReplayMode,
    /// Pass over client frames instead of treating them as timing anchors
    pub skip_client_frames: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            mode: ReplayMode::pure(),
            skip_client_frames: true,
        }
    }
}

impl ReplayConfig {
    /// Config for `mode` with default options
    #[must_use]
    pub fn new(mode: ReplayMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Build from file settings
    ///
    /// # Errors
    ///
    /// Returns `InvalidReplayMode` for an unknown mode name, `ConfigError`
    /// for out-of-range parameters
    pub fn from_settings(settings: &ReplaySettings, buffer: usize) -> Result<Self> {
        let mode = match settings.mode.parse::<ReplayMode>()? {
            ReplayMode::Pure { .. } => ReplayMode::Pure {
                timing_scale: settings.timing_scale,
            },
            ReplayMode::Triggered => ReplayMode::Triggered,
            ReplayMode::Synchronized { .. } => ReplayMode::Synchronized {
                timeout: Duration::from_millis(settings.timeout_ms),
                on_timeout: settings.on_timeout.parse()?,
                buffer,
            },
        };

        let config = Self {
            mode,
            skip_client_frames: settings.skip_client_frames,
        };
        config.mode.validate()?;
        Ok(config)
    }
}

/// Replay lifecycle: `pending -> playing -> {completed | aborted | error}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayStatus {
    /// Created, not started
    Pending,
    /// Emitting frames
    Playing,
    /// Every frame was played
    Completed,
    /// Stopped or cancelled before the end
    Aborted,
    /// Failed while playing
    Error,
}

impl ReplayStatus {
    /// Whether no further transition can happen
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Error)
    }
}

impl fmt::Display for ReplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Playing => "playing",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Replay progress snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplayProgress {
    /// Index of the next frame to emit or await
    pub current: usize,
    /// Frames in the recording
    pub total: usize,
    /// Server frames emitted
    pub sent: usize,
    /// Wall time since `start`; zero before
    pub elapsed: Duration,
    /// Current status
    pub status: ReplayStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!("pure".parse::<ReplayMode>().unwrap(), ReplayMode::pure());
        assert_eq!("triggered".parse::<ReplayMode>().unwrap(), ReplayMode::Triggered);
        assert_eq!(
            "synchronized".parse::<ReplayMode>().unwrap().name(),
            "synchronized"
        );
        assert!(matches!(
            "live".parse::<ReplayMode>(),
            Err(MockError::InvalidReplayMode(m)) if m == "live"
        ));
    }

    #[test]
    fn test_default_config() {
        let config = ReplayConfig::default();
        assert_eq!(config.mode, ReplayMode::Pure { timing_scale: 1.0 });
        assert!(config.skip_client_frames);
    }

    #[test]
    fn test_from_settings() {
        let settings = ReplaySettings {
            mode: "synchronized".to_string(),
            timeout_ms: 250,
            on_timeout: "abort".to_string(),
            ..ReplaySettings::default()
        };

        let config = ReplayConfig::from_settings(&settings, 8).unwrap();
        assert_eq!(
            config.mode,
            ReplayMode::Synchronized {
                timeout: Duration::from_millis(250),
                on_timeout: TimeoutPolicy::Abort,
                buffer: 8,
            }
        );
    }

    #[test]
    fn test_from_settings_rejects_bad_values() {
        let settings = ReplaySettings {
            timing_scale: 0.0,
            ..ReplaySettings::default()
        };
        assert!(matches!(
            ReplayConfig::from_settings(&settings, 8),
            Err(MockError::ConfigError(_))
        ));

        let settings = ReplaySettings {
            mode: "synchronized".to_string(),
            on_timeout: "retry".to_string(),
            ..ReplaySettings::default()
        };
        assert!(ReplayConfig::from_settings(&settings, 8).is_err());
    }

    #[test]
    fn test_status_terminal() {
        assert!(!ReplayStatus::Pending.is_terminal());
        assert!(!ReplayStatus::Playing.is_terminal());
        assert!(ReplayStatus::Completed.is_terminal());
        assert!(ReplayStatus::Aborted.is_terminal());
        assert!(ReplayStatus::Error.is_terminal());
        assert_eq!(ReplayStatus::Aborted.to_string(), "aborted");
    }
}
