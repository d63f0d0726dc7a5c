//! Recording sinks

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{MockError, Result};

use super::frame::{CloseRecord, RecordedFrame, Recording};

/// Receiver of recorded frames and session lifecycle events
///
/// Any persistence mechanism can implement this; errors returned from
/// `on_frame`/`on_complete` are handed back to the recorder's caller as-is.
pub trait WebSocketRecordingHook: Send + Sync {
    /// Session opened with the given negotiated subprotocol
    fn on_connect(&self, subprotocol: Option<&str>);

    /// A frame was captured
    ///
    /// # Errors
    ///
    /// Returns error if the sink cannot accept the frame
    fn on_frame(&self, frame: &RecordedFrame) -> Result<()>;

    /// Close handshake observed
    fn on_close(&self, code: u16, reason: &str);

    /// Session finished; no further frames follow
    ///
    /// # Errors
    ///
    /// Returns error if the sink cannot be finalized
    fn on_complete(&self) -> Result<()>;

    /// Transport or session failure observed while recording
    fn on_error(&self, err: &MockError);
}

/// Collects a recording in memory
pub struct MemoryHook {
    recording: Mutex<Recording>,
    completed: AtomicBool,
}

impl MemoryHook {
    /// Create an empty in-memory sink
    #[must_use]
    pub fn new(recording_id: impl Into<String>) -> Self {
        Self {
            recording: Mutex::new(Recording::websocket(recording_id)),
            completed: AtomicBool::new(false),
        }
    }

    /// Set the endpoint path stored with the recording
    #[must_use]
    pub fn with_endpoint_path(self, path: impl Into<String>) -> Self {
        self.recording.lock().endpoint_path = Some(path.into());
        self
    }

    /// Copy of everything captured so far
    #[must_use]
    pub fn snapshot(&self) -> Recording {
        self.recording.lock().clone()
    }

    /// Whether `on_complete` has been called
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

impl WebSocketRecordingHook for MemoryHook {
    fn on_connect(&self, subprotocol: Option<&str>) {
        self.recording.lock().subprotocol = subprotocol.map(str::to_string);
    }

    fn on_frame(&self, frame: &RecordedFrame) -> Result<()> {
        if self.is_complete() {
            return Err(MockError::Hook(format!(
                "frame {} arrived after recording completed",
                frame.sequence
            )));
        }
        self.recording.lock().frames.push(frame.clone());
        Ok(())
    }

    fn on_close(&self, code: u16, reason: &str) {
        self.recording.lock().close = Some(CloseRecord {
            code,
            reason: reason.to_string(),
        });
    }

    fn on_complete(&self) -> Result<()> {
        self.completed.store(true, Ordering::Release);
        Ok(())
    }

    fn on_error(&self, err: &MockError) {
        let id = self.recording.lock().id.clone();
        warn!("Recording {} observed error: {}", id, err);
    }
}

/// Collects a recording in memory and writes `<dir>/<id>.json` on completion
pub struct JsonFileHook {
    path: PathBuf,
    memory: MemoryHook,
}

impl JsonFileHook {
    /// Create a sink writing into `dir`
    #[must_use]
    pub fn new(dir: &Path, recording_id: &str) -> Self {
        Self {
            path: dir.join(format!("{recording_id}.json")),
            memory: MemoryHook::new(recording_id),
        }
    }

    /// Set the endpoint path stored with the recording
    #[must_use]
    pub fn with_endpoint_path(mut self, path: impl Into<String>) -> Self {
        self.memory = self.memory.with_endpoint_path(path);
        self
    }

    /// Destination file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WebSocketRecordingHook for JsonFileHook {
    fn on_connect(&self, subprotocol: Option<&str>) {
        self.memory.on_connect(subprotocol);
    }

    fn on_frame(&self, frame: &RecordedFrame) -> Result<()> {
        debug!(
            "Captured frame {} ({:?}, {} bytes)",
            frame.sequence, frame.direction, frame.data_size
        );
        self.memory.on_frame(frame)
    }

    fn on_close(&self, code: u16, reason: &str) {
        self.memory.on_close(code, reason);
    }

    fn on_complete(&self) -> Result<()> {
        self.memory.on_complete()?;
        let recording = self.memory.snapshot();

        // Readers polling the directory never see a half-written file
        let partial = self.path.with_extension("json.partial");
        recording.write_json_file(&partial)?;
        std::fs::rename(&partial, &self.path)?;

        info!(
            "Saved recording '{}': {} frames -> {}",
            recording.id,
            recording.frames.len(),
            self.path.display()
        );
        Ok(())
    }

    fn on_error(&self, err: &MockError) {
        self.memory.on_error(err);
    }
}
