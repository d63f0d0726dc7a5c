//! WebSocket mock server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Mode};
use crate::recording::{Protocol, Recording};
use crate::replay::Replayer;
use crate::session::ConnectionManager;
use crate::{MockError, Result};

use super::admission::ConnectionLimit;
use super::handler::SessionHandler;
use super::SHUTDOWN_TIMEOUT_MS;

/// Listener that turns every accepted client into a managed connection
pub struct MockServer {
    listener: TcpListener,
    handler: Arc<SessionHandler>,
}

impl MockServer {
    /// Bind the listener and load the recording (replay mode)
    ///
    /// # Errors
    ///
    /// Returns error if the replay settings are invalid, the recording
    /// cannot be loaded, or the address cannot be bound
    pub async fn bind(config: Config) -> Result<Self> {
        let replay_config = config.replay_config()?;

        let recording = match config.mode {
            Mode::Replay => Some(Arc::new(load_recording(&config)?)),
            Mode::Record => None,
        };

        let listener = TcpListener::bind(config.server.listen_addr).await?;
        let manager = Arc::new(ConnectionManager::from_limits(&config.limits));
        let limit = ConnectionLimit::new(config.limits.max_connections);

        Ok(Self {
            listener,
            handler: Arc::new(SessionHandler {
                config: Arc::new(config),
                manager,
                limit,
                recording,
                replay_config,
                replays: DashMap::new(),
            }),
        })
    }

    /// Address the listener is bound to
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be read
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Registry of live client connections
    #[must_use]
    pub fn manager(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.handler.manager)
    }

    /// Replay currently driving the given connection
    #[must_use]
    pub fn replayer(&self, connection_id: &str) -> Option<Arc<Replayer>> {
        self.handler
            .replays
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Advance every active triggered replay by `n` frames
    ///
    /// Returns the total number of frames emitted.
    pub async fn advance_all(&self, n: usize) -> usize {
        let replays: Vec<Arc<Replayer>> = self
            .handler
            .replays
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut emitted = 0;
        for replayer in replays {
            match replayer.advance(n).await {
                Ok(count) => emitted += count,
                Err(e) => debug!("Skipping replay '{}': {}", replayer.recording_id(), e),
            }
        }
        emitted
    }

    /// Accept clients until `shutdown` is cancelled, then close every
    /// connection and wait for sessions to wind down
    ///
    /// # Errors
    ///
    /// Returns error if the listener address cannot be read
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!(
            "Listening on {} ({:?} mode, max {} connections)",
            addr,
            self.handler.config.mode,
            self.handler.limit.max_connections()
        );

        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Initiating graceful shutdown");
                    break;
                }
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let Some(permit) = self.handler.limit.try_admit() else {
                                warn!("Connection limit reached, rejecting {}", peer_addr);
                                drop(stream);
                                continue;
                            };

                            let handler = Arc::clone(&self.handler);
                            tasks.spawn(async move {
                                let _permit = permit;
                                if let Err(e) = handler.handle(stream, peer_addr).await {
                                    warn!("Session with {} failed: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        warn!("Session task failed: {}", e);
                    }
                }
            }
        }

        let closed = self.handler.manager.stop().await;
        debug!("Closed {} connections", closed);

        let drained = tokio::time::timeout(Duration::from_millis(SHUTDOWN_TIMEOUT_MS), async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!("Task cleanup error: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Sessions still running after shutdown timeout, aborting them");
            tasks.abort_all();
        }

        info!("Shutdown complete");
        Ok(())
    }
}

fn load_recording(config: &Config) -> Result<Recording> {
    let path = config.server.recording.as_deref().ok_or_else(|| {
        MockError::ConfigError("Replay mode requires server.recording".to_string())
    })?;

    let recording = Recording::from_json_file(path)?;
    if recording.protocol != Protocol::WebSocket {
        return Err(MockError::InvalidRecording(format!(
            "{} is not a WebSocket recording",
            path.display()
        )));
    }
    if recording.frames.is_empty() {
        return Err(MockError::NoFramesToReplay);
    }

    info!(
        "Loaded recording '{}' ({} frames, {} from server)",
        recording.id,
        recording.frames.len(),
        recording.server_frame_count()
    );
    Ok(recording)
}
