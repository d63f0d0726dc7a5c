//! Replay engine driving recorded frames onto a live connection

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::recording::{Protocol, RecordedFrame, Recording};
use crate::session::Connection;
use crate::{MockError, Result};

use super::{ReplayConfig, ReplayMode, ReplayProgress, ReplayStatus, TimeoutPolicy};

/// Mode-specific machinery
enum Driver {
    Pure {
        timing_scale: f64,
    },
    Triggered {
        // Serializes concurrent `advance` calls.
        advance: tokio::sync::Mutex<()>,
    },
    Synchronized {
        timeout: Duration,
        on_timeout: TimeoutPolicy,
        inbound_tx: mpsc::Sender<Bytes>,
        inbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    },
}

/// Why playback stopped before the last frame
enum Halt {
    Cancelled,
    Aborted(String),
    Failed(MockError),
}

/// One-shot player of a recording onto a connection
///
/// Created in `pending`, driven to a terminal status exactly once.
pub struct Replayer {
    recording_id: String,
    frames: Vec<RecordedFrame>,
    connection: Arc<Connection>,
    skip_client_frames: bool,
    driver: Driver,
    status: watch::Sender<ReplayStatus>,
    cursor: AtomicUsize,
    sent: AtomicUsize,
    started_at: Mutex<Option<Instant>>,
    cancel: CancellationToken,
    last_error: Mutex<Option<String>>,
}

impl std::fmt::Debug for Replayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replayer")
            .field("recording_id", &self.recording_id)
            .finish_non_exhaustive()
    }
}

impl Replayer {
    /// Validate a recording and prepare it for playback on `connection`
    ///
    /// The replay's cancellation handle is a child of the connection's, so
    /// closing the connection stops the replay.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecording` for a missing or non-WebSocket recording,
    /// `NoFramesToReplay` for an empty one, `ConfigError` for out-of-range
    /// mode parameters
    pub fn new<'a>(
        recording: impl Into<Option<&'a Recording>>,
        connection: Arc<Connection>,
        config: ReplayConfig,
    ) -> Result<Arc<Self>> {
        let recording = recording
            .into()
            .ok_or_else(|| MockError::InvalidRecording("no recording supplied".to_string()))?;

        if recording.protocol != Protocol::WebSocket {
            return Err(MockError::InvalidRecording(format!(
                "recording '{}' is {:?}, not WebSocket",
                recording.id, recording.protocol
            )));
        }
        if recording.frames.is_empty() {
            return Err(MockError::NoFramesToReplay);
        }
        config.mode.validate()?;

        let driver = match config.mode {
            ReplayMode::Pure { timing_scale } => Driver::Pure { timing_scale },
            ReplayMode::Triggered => Driver::Triggered {
                advance: tokio::sync::Mutex::new(()),
            },
            ReplayMode::Synchronized {
                timeout,
                on_timeout,
                buffer,
            } => {
                let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
                Driver::Synchronized {
                    timeout,
                    on_timeout,
                    inbound_tx,
                    inbound_rx: Mutex::new(Some(inbound_rx)),
                }
            }
        };

        let (status, _) = watch::channel(ReplayStatus::Pending);
        let cancel = connection.context().child_token();

        Ok(Arc::new(Self {
            recording_id: recording.id.clone(),
            frames: recording.frames.clone(),
            connection,
            skip_client_frames: config.skip_client_frames,
            driver,
            status,
            cursor: AtomicUsize::new(0),
            sent: AtomicUsize::new(0),
            started_at: Mutex::new(None),
            cancel,
            last_error: Mutex::new(None),
        }))
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> ReplayStatus {
        *self.status.borrow()
    }

    /// ID of the recording being played
    #[must_use]
    pub fn recording_id(&self) -> &str {
        &self.recording_id
    }

    /// Connection the replay writes to
    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Mode name
    #[must_use]
    pub fn mode_name(&self) -> &'static str {
        match self.driver {
            Driver::Pure { .. } => "pure",
            Driver::Triggered { .. } => "triggered",
            Driver::Synchronized { .. } => "synchronized",
        }
    }

    /// Why the replay ended in `error` (or was aborted on timeout)
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Cancellation handle of this replay
    #[must_use]
    pub fn context(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// (index of next frame, total frames, server frames sent)
    #[must_use]
    pub fn progress(&self) -> (usize, usize, usize) {
        (
            self.cursor.load(Ordering::Acquire),
            self.frames.len(),
            self.sent.load(Ordering::Acquire),
        )
    }

    /// Progress including elapsed time since `start`
    #[must_use]
    pub fn get_progress(&self) -> ReplayProgress {
        let (current, total, sent) = self.progress();
        let started_at = *self.started_at.lock();
        let elapsed = started_at
            .map(|started| started.elapsed())
            .unwrap_or_default();

        ReplayProgress {
            current,
            total,
            sent,
            elapsed,
            status: self.status(),
        }
    }

    fn transition(&self, from: ReplayStatus, to: ReplayStatus) -> bool {
        self.status.send_if_modified(|status| {
            if *status == from {
                *status = to;
                true
            } else {
                false
            }
        })
    }

    fn finish(&self, to: ReplayStatus) {
        if self.transition(ReplayStatus::Playing, to) {
            info!(
                "Replay '{}' on {} finished: {} ({}/{} frames, {} sent)",
                self.recording_id,
                self.connection.id(),
                to,
                self.cursor.load(Ordering::Acquire),
                self.frames.len(),
                self.sent.load(Ordering::Acquire)
            );
        }
    }

    fn halt(&self, halt: Halt) {
        match halt {
            Halt::Cancelled => self.finish(ReplayStatus::Aborted),
            Halt::Aborted(reason) => {
                *self.last_error.lock() = Some(reason);
                self.finish(ReplayStatus::Aborted);
            }
            Halt::Failed(err) => {
                warn!("Replay '{}' failed: {}", self.recording_id, err);
                *self.last_error.lock() = Some(err.to_string());
                self.finish(ReplayStatus::Error);
            }
        }
    }

    /// Begin playback
    ///
    /// Pure and synchronized replays run on a spawned task; triggered
    /// replays wait for `advance`. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` unless the replay is `pending`
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let started = self.status.send_if_modified(|status| {
            if *status == ReplayStatus::Pending {
                *status = ReplayStatus::Playing;
                *self.started_at.lock() = Some(Instant::now());
                true
            } else {
                false
            }
        });
        if !started {
            return Err(MockError::AlreadyStarted);
        }

        info!(
            "Replay '{}' started on {} ({} mode, {} frames)",
            self.recording_id,
            self.connection.id(),
            self.mode_name(),
            self.frames.len()
        );

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await });
        Ok(())
    }

    /// Stop a playing replay, leaving it `aborted`
    ///
    /// No-op once the replay has already ended.
    ///
    /// # Errors
    ///
    /// Returns `ReplayNotStarted` if `start` was never called
    pub fn stop(&self) -> Result<()> {
        if self.transition(ReplayStatus::Playing, ReplayStatus::Aborted) {
            info!("Replay '{}' stopped", self.recording_id);
            self.cancel.cancel();
            return Ok(());
        }
        if self.status() == ReplayStatus::Pending {
            return Err(MockError::ReplayNotStarted);
        }
        Ok(())
    }

    /// Wait until the replay reaches a terminal status
    ///
    /// Never returns for a replay that is not started.
    pub async fn wait(&self) -> ReplayStatus {
        let mut rx = self.status.subscribe();
        let result = rx.wait_for(|status| status.is_terminal()).await.map(|s| *s);
        result.unwrap_or_else(|_| self.status())
    }

    /// Feed a live client message to a synchronized replay
    ///
    /// Buffered so bursts are not lost while a server frame is being sent.
    /// Returns immediately, discarding the message, once the replay is
    /// cancelled or finished; other modes ignore it. Returns whether the
    /// message was queued.
    pub async fn on_client_message(&self, data: Bytes) -> bool {
        let Driver::Synchronized { inbound_tx, .. } = &self.driver else {
            return false;
        };
        if self.cancel.is_cancelled() {
            return false;
        }

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            result = inbound_tx.send(data) => result.is_ok(),
        }
    }

    /// Emit up to `n` pending server frames (triggered mode)
    ///
    /// Client frames are passed over. Returns how many frames were emitted.
    ///
    /// # Errors
    ///
    /// Returns `TriggeredModeOnly` in other modes, `ReplayNotStarted` before
    /// `start`, or the send failure that moved the replay to `error`
    pub async fn advance(&self, n: usize) -> Result<usize> {
        let Driver::Triggered { advance } = &self.driver else {
            return Err(MockError::TriggeredModeOnly);
        };
        match self.status() {
            ReplayStatus::Pending => return Err(MockError::ReplayNotStarted),
            ReplayStatus::Playing => {}
            _ => return Ok(0),
        }

        let _guard = advance.lock().await;
        let mut emitted = 0;

        while emitted < n && self.status() == ReplayStatus::Playing {
            let index = self.cursor.load(Ordering::Acquire);
            let Some(frame) = self.frames.get(index) else {
                break;
            };
            if frame.is_client_frame() {
                self.cursor.fetch_add(1, Ordering::AcqRel);
                continue;
            }

            match self.emit(frame).await {
                Ok(()) => {
                    self.cursor.fetch_add(1, Ordering::AcqRel);
                    emitted += 1;
                }
                Err(Halt::Failed(err)) => {
                    *self.last_error.lock() = Some(err.to_string());
                    self.finish(ReplayStatus::Error);
                    return Err(err);
                }
                Err(halt) => {
                    self.halt(halt);
                    break;
                }
            }
        }

        let index = self.cursor.load(Ordering::Acquire);
        if self.frames[index.min(self.frames.len())..]
            .iter()
            .all(RecordedFrame::is_client_frame)
        {
            self.cursor.store(self.frames.len(), Ordering::Release);
            self.finish(ReplayStatus::Completed);
        }

        debug!("Advanced replay '{}' by {} frames", self.recording_id, emitted);
        Ok(emitted)
    }

    async fn run(&self) {
        let outcome = match &self.driver {
            Driver::Pure { timing_scale } => self.run_pure(*timing_scale).await,
            Driver::Synchronized {
                timeout,
                on_timeout,
                inbound_rx,
                ..
            } => {
                let inbound = inbound_rx.lock().take();
                match inbound {
                    Some(inbound) => self.run_synchronized(inbound, *timeout, *on_timeout).await,
                    None => Err(Halt::Failed(MockError::AlreadyStarted)),
                }
            }
            Driver::Triggered { .. } => {
                // Only cancellation ends a triggered replay without `advance`.
                let mut status = self.status.subscribe();
                tokio::select! {
                    () = self.cancel.cancelled() => self.finish(ReplayStatus::Aborted),
                    _ = status.wait_for(|s| s.is_terminal()) => {}
                }
                return;
            }
        };

        match outcome {
            Ok(()) => self.finish(ReplayStatus::Completed),
            Err(halt) => self.halt(halt),
        }
    }

    async fn run_pure(&self, timing_scale: f64) -> std::result::Result<(), Halt> {
        let started_at = *self.started_at.lock();
        let started = started_at.unwrap_or_else(Instant::now);

        loop {
            let index = self.cursor.load(Ordering::Acquire);
            let Some(frame) = self.frames.get(index) else {
                return Ok(());
            };
            if frame.is_client_frame() && self.skip_client_frames {
                self.cursor.fetch_add(1, Ordering::AcqRel);
                continue;
            }

            let due = deadline(started, frame.relative_time(), timing_scale);
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(Halt::Cancelled),
                () = tokio::time::sleep_until(due) => {}
            }

            if !frame.is_client_frame() {
                self.emit(frame).await?;
            }
            self.cursor.fetch_add(1, Ordering::AcqRel);
        }
    }

    async fn run_synchronized(
        &self,
        mut inbound: mpsc::Receiver<Bytes>,
        timeout: Duration,
        on_timeout: TimeoutPolicy,
    ) -> std::result::Result<(), Halt> {
        loop {
            let index = self.cursor.load(Ordering::Acquire);
            let Some(frame) = self.frames.get(index) else {
                return Ok(());
            };

            if frame.is_client_frame() {
                let received = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return Err(Halt::Cancelled),
                    received = tokio::time::timeout(timeout, inbound.recv()) => received,
                };

                match received {
                    Ok(Some(data)) => {
                        if frame.payload_bytes().ok().as_ref() != Some(&data) {
                            debug!(
                                "Client frame {} differs from recording ({} bytes received)",
                                frame.sequence,
                                data.len()
                            );
                        }
                    }
                    Ok(None) => return Err(Halt::Cancelled),
                    Err(_) => {
                        let err = MockError::ReplayTimeout {
                            sequence: frame.sequence,
                            timeout_ms: timeout.as_millis() as u64,
                        };
                        warn!("Replay '{}': {}", self.recording_id, err);
                        return Err(match on_timeout {
                            TimeoutPolicy::Error => Halt::Failed(err),
                            TimeoutPolicy::Abort => Halt::Aborted(err.to_string()),
                        });
                    }
                }
            } else {
                self.emit(frame).await?;
            }
            self.cursor.fetch_add(1, Ordering::AcqRel);
        }
    }

    async fn emit(&self, frame: &RecordedFrame) -> std::result::Result<(), Halt> {
        let payload = frame.payload_bytes().map_err(Halt::Failed)?;

        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Halt::Cancelled),
            result = self.connection.send(frame.message_type, payload) => result,
        };

        match result {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::AcqRel);
                debug!(
                    "Replayed frame {} to {}",
                    frame.sequence,
                    self.connection.id()
                );
                Ok(())
            }
            Err(_) if self.cancel.is_cancelled() => Err(Halt::Cancelled),
            Err(err) => Err(Halt::Failed(err)),
        }
    }
}

/// Deadlines past this horizon are clamped to it
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn scale(offset: Duration, timing_scale: f64) -> Duration {
    Duration::try_from_secs_f64(offset.as_secs_f64() / timing_scale).unwrap_or(Duration::MAX)
}

fn deadline(started: Instant, offset: Duration, timing_scale: f64) -> Instant {
    let scaled = scale(offset, timing_scale).min(FAR_FUTURE);
    started.checked_add(scaled).unwrap_or(started + FAR_FUTURE)
}
