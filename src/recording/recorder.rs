//! Per-connection frame recorder

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::{MockError, Result};

use super::frame::{Direction, MessageType, RecordedFrame};
use super::hook::WebSocketRecordingHook;

/// Turns a connection's traffic into an ordered frame stream
///
/// Both directions share one sequence counter, so the emitted sequence
/// numbers reproduce the exact client/server interleaving.
pub struct ConnectionRecorder {
    hook: Arc<dyn WebSocketRecordingHook>,
    started_at: Instant,
    // Held while the hook runs so frames reach the sink in sequence order.
    sequence: Mutex<u64>,
    completed: AtomicBool,
}

impl ConnectionRecorder {
    /// Create a recorder; the session clock starts now
    #[must_use]
    pub fn new(hook: Arc<dyn WebSocketRecordingHook>) -> Self {
        Self {
            hook,
            started_at: Instant::now(),
            sequence: Mutex::new(0),
            completed: AtomicBool::new(false),
        }
    }

    /// Create a recorder and report the negotiated subprotocol to the hook
    #[must_use]
    pub fn start(hook: Arc<dyn WebSocketRecordingHook>, subprotocol: Option<&str>) -> Self {
        hook.on_connect(subprotocol);
        Self::new(hook)
    }

    /// Record a server-to-client message
    ///
    /// # Errors
    ///
    /// Returns the hook's error unchanged
    pub fn record_send(&self, message_type: MessageType, data: &[u8]) -> Result<()> {
        self.record(Direction::ServerToClient, message_type, data)
    }

    /// Record a client-to-server message
    ///
    /// # Errors
    ///
    /// Returns the hook's error unchanged
    pub fn record_receive(&self, message_type: MessageType, data: &[u8]) -> Result<()> {
        self.record(Direction::ClientToServer, message_type, data)
    }

    fn record(&self, direction: Direction, message_type: MessageType, data: &[u8]) -> Result<()> {
        let mut sequence = self.sequence.lock();
        *sequence += 1;

        let frame = RecordedFrame::new(
            *sequence,
            self.started_at.elapsed(),
            direction,
            message_type,
            data,
        );
        debug!(
            "Recording frame {} {:?} ({} bytes)",
            frame.sequence, direction, frame.data_size
        );

        self.hook.on_frame(&frame)
    }

    /// Forward a close handshake; does not consume a sequence number
    pub fn record_close(&self, code: u16, reason: &str) {
        self.hook.on_close(code, reason);
    }

    /// Forward a session failure
    pub fn record_error(&self, err: &MockError) {
        self.hook.on_error(err);
    }

    /// Finish the session
    ///
    /// Only the first call reaches the hook.
    ///
    /// # Errors
    ///
    /// Returns the hook's error unchanged
    pub fn complete(&self) -> Result<()> {
        if self.completed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.hook.on_complete()
    }

    /// Number of frames recorded so far
    #[must_use]
    pub fn frames_recorded(&self) -> u64 {
        *self.sequence.lock()
    }

    /// Whether `complete` has run
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{MemoryHook, PayloadEncoding};
    use std::sync::atomic::AtomicUsize;

    struct FailingHook {
        completes: AtomicUsize,
    }

    impl WebSocketRecordingHook for FailingHook {
        fn on_connect(&self, _subprotocol: Option<&str>) {}

        fn on_frame(&self, frame: &RecordedFrame) -> Result<()> {
            Err(MockError::Hook(format!("disk full at frame {}", frame.sequence)))
        }

        fn on_close(&self, _code: u16, _reason: &str) {}

        fn on_complete(&self) -> Result<()> {
            self.completes.fetch_add(1, Ordering::SeqCst);
            Err(MockError::Hook("flush failed".to_string()))
        }

        fn on_error(&self, _err: &MockError) {}
    }

    #[test]
    fn test_alternating_sequence() {
        let hook = Arc::new(MemoryHook::new("alt"));
        let recorder = ConnectionRecorder::new(hook.clone());

        recorder.record_receive(MessageType::Text, b"hello").unwrap();
        recorder.record_send(MessageType::Text, b"hi").unwrap();
        recorder.record_receive(MessageType::Text, b"how are you").unwrap();
        recorder.record_send(MessageType::Text, b"fine").unwrap();

        let frames = hook.snapshot().frames;
        let sequences: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
        let directions: Vec<Direction> = frames.iter().map(|f| f.direction).collect();

        assert_eq!(sequences, vec![1, 2, 3, 4]);
        assert_eq!(
            directions,
            vec![
                Direction::ClientToServer,
                Direction::ServerToClient,
                Direction::ClientToServer,
                Direction::ServerToClient,
            ]
        );
        assert_eq!(recorder.frames_recorded(), 4);
    }

    #[test]
    fn test_binary_payload_encoded() {
        let hook = Arc::new(MemoryHook::new("bin"));
        let recorder = ConnectionRecorder::new(hook.clone());

        recorder.record_send(MessageType::Binary, &[0, 159, 146, 150]).unwrap();

        let frame = &hook.snapshot().frames[0];
        assert_eq!(frame.encoding, PayloadEncoding::Base64);
        assert_eq!(frame.data_size, 4);
        assert_eq!(frame.payload_bytes().unwrap().as_ref(), &[0, 159, 146, 150]);
    }

    #[test]
    fn test_relative_time_non_decreasing() {
        let hook = Arc::new(MemoryHook::new("timing"));
        let recorder = ConnectionRecorder::new(hook.clone());

        for _ in 0..20 {
            recorder.record_send(MessageType::Text, b"tick").unwrap();
        }

        let frames = hook.snapshot().frames;
        assert!(frames.windows(2).all(|w| w[0].relative_ms <= w[1].relative_ms));
    }

    #[test]
    fn test_hook_error_propagates_verbatim() {
        let hook = Arc::new(FailingHook {
            completes: AtomicUsize::new(0),
        });
        let recorder = ConnectionRecorder::new(hook);

        let err = recorder.record_send(MessageType::Text, b"x").unwrap_err();
        assert_eq!(err.to_string(), "Recording hook failed: disk full at frame 1");

        let err = recorder.record_receive(MessageType::Text, b"y").unwrap_err();
        assert_eq!(err.to_string(), "Recording hook failed: disk full at frame 2");
    }

    #[test]
    fn test_complete_reaches_hook_once() {
        let hook = Arc::new(FailingHook {
            completes: AtomicUsize::new(0),
        });
        let recorder = ConnectionRecorder::new(hook.clone());

        assert!(recorder.complete().is_err());
        assert!(recorder.complete().is_ok());
        assert!(recorder.is_complete());
        assert_eq!(hook.completes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_does_not_consume_sequence() {
        let hook = Arc::new(MemoryHook::new("close"));
        let recorder = ConnectionRecorder::start(hook.clone(), Some("v2"));

        recorder.record_send(MessageType::Text, b"a").unwrap();
        recorder.record_close(1001, "going away");
        recorder.record_receive(MessageType::Text, b"b").unwrap();

        let recording = hook.snapshot();
        assert_eq!(recording.subprotocol.as_deref(), Some("v2"));
        assert_eq!(recording.frames[1].sequence, 2);
        assert_eq!(recording.close.unwrap().reason, "going away");
    }
}
