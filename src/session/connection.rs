//! A single logical WebSocket session

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::recording::{ConnectionRecorder, MessageType};
use crate::{MockError, Result};

use super::manager::ManagerShared;
use super::transport::{OutboundMessage, Transport};
use super::MAX_GROUPS_PER_CONNECTION;

/// Negotiated properties of a connection, fixed at construction
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    /// Path the client connected to
    pub endpoint_path: String,
    /// Negotiated subprotocol
    pub subprotocol: Option<String>,
}

impl ConnectionInfo {
    /// Info for a connection on `endpoint_path` without a subprotocol
    #[must_use]
    pub fn new(endpoint_path: impl Into<String>) -> Self {
        Self {
            endpoint_path: endpoint_path.into(),
            subprotocol: None,
        }
    }

    /// Set the negotiated subprotocol
    #[must_use]
    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = Some(subprotocol.into());
        self
    }
}

#[derive(Default)]
struct ConnectionState {
    groups: HashSet<String>,
    metadata: HashMap<String, Value>,
}

/// Thread-safe session state, independent of transport mechanics
///
/// Lock order: manager registry, then the `manager` slot, then `state`.
/// The `recorder` slot is a leaf lock.
pub struct Connection {
    id: String,
    info: ConnectionInfo,
    transport: Arc<dyn Transport>,
    connected_at: SystemTime,
    last_message_ms: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
    max_groups: usize,
    state: Mutex<ConnectionState>,
    manager: Mutex<Weak<ManagerShared>>,
    recorder: Mutex<Option<Arc<ConnectionRecorder>>>,
}

impl Connection {
    /// Create a connection whose cancellation handle is a child of `parent`
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        info: ConnectionInfo,
        transport: Arc<dyn Transport>,
        parent: &CancellationToken,
    ) -> Self {
        let connected_at = SystemTime::now();
        Self {
            id: id.into(),
            info,
            transport,
            connected_at,
            last_message_ms: AtomicU64::new(unix_millis(connected_at)),
            closed: AtomicBool::new(false),
            cancel: parent.child_token(),
            max_groups: MAX_GROUPS_PER_CONNECTION,
            state: Mutex::new(ConnectionState::default()),
            manager: Mutex::new(Weak::new()),
            recorder: Mutex::new(None),
        }
    }

    /// Override the group membership bound
    #[must_use]
    pub fn with_max_groups(mut self, max_groups: usize) -> Self {
        self.max_groups = max_groups;
        self
    }

    /// Connection ID
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path the client connected to
    #[must_use]
    pub fn endpoint_path(&self) -> &str {
        &self.info.endpoint_path
    }

    /// Negotiated subprotocol
    #[must_use]
    pub fn subprotocol(&self) -> Option<&str> {
        self.info.subprotocol.as_deref()
    }

    /// Peer address reported by the transport
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.remote_addr()
    }

    /// Creation time
    #[must_use]
    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// Time of the most recent inbound or outbound message
    #[must_use]
    pub fn last_message_at(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.last_message_ms.load(Ordering::Relaxed))
    }

    /// Time since the most recent message
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.last_message_at())
            .unwrap_or_default()
    }

    fn touch(&self) {
        self.last_message_ms
            .fetch_max(unix_millis(SystemTime::now()), Ordering::Relaxed);
    }

    /// Cancellation handle observed by tasks tied to this connection
    #[must_use]
    pub fn context(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ---- groups ----

    /// Join a group, updating the owning manager's index in the same step
    ///
    /// # Errors
    ///
    /// Returns `AlreadyInGroup` or `TooManyGroups`
    pub fn join_group(&self, name: &str) -> Result<()> {
        loop {
            let slot = self.manager.lock();
            let Some(shared) = slot.upgrade() else {
                // Registration takes the slot before reading our groups
                return self.join_local(name);
            };
            drop(slot);
            if shared.join_group(self, name)? {
                return Ok(());
            }
        }
    }

    /// Leave a group, updating the owning manager's index in the same step
    ///
    /// # Errors
    ///
    /// Returns `NotInGroup` if not a member
    pub fn leave_group(&self, name: &str) -> Result<()> {
        loop {
            let slot = self.manager.lock();
            let Some(shared) = slot.upgrade() else {
                return self.leave_local(name);
            };
            drop(slot);
            if shared.leave_group(self, name)? {
                return Ok(());
            }
        }
    }

    pub(crate) fn join_local(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.groups.contains(name) {
            return Err(MockError::AlreadyInGroup {
                connection_id: self.id.clone(),
                group: name.to_string(),
            });
        }
        if state.groups.len() >= self.max_groups {
            return Err(MockError::TooManyGroups {
                connection_id: self.id.clone(),
                limit: self.max_groups,
            });
        }
        state.groups.insert(name.to_string());
        Ok(())
    }

    pub(crate) fn leave_local(&self, name: &str) -> Result<()> {
        if self.state.lock().groups.remove(name) {
            Ok(())
        } else {
            Err(MockError::NotInGroup {
                connection_id: self.id.clone(),
                group: name.to_string(),
            })
        }
    }

    pub(crate) fn take_groups(&self) -> HashSet<String> {
        std::mem::take(&mut self.state.lock().groups)
    }

    /// Copy of current group membership, sorted
    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.state.lock().groups.iter().cloned().collect();
        groups.sort_unstable();
        groups
    }

    /// Whether this connection is in `name`
    #[must_use]
    pub fn in_group(&self, name: &str) -> bool {
        self.state.lock().groups.contains(name)
    }

    /// Number of groups joined
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.state.lock().groups.len()
    }

    /// Group membership bound
    #[must_use]
    pub fn max_groups(&self) -> usize {
        self.max_groups
    }

    // ---- metadata ----

    /// Set a metadata entry, returning the previous value
    pub fn set_metadata(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.state.lock().metadata.insert(key.into(), value)
    }

    /// Copy of one metadata entry
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<Value> {
        self.state.lock().metadata.get(key).cloned()
    }

    /// Remove a metadata entry
    pub fn remove_metadata(&self, key: &str) -> Option<Value> {
        self.state.lock().metadata.remove(key)
    }

    /// Copy of all metadata
    #[must_use]
    pub fn metadata(&self) -> HashMap<String, Value> {
        self.state.lock().metadata.clone()
    }

    // ---- manager back-reference ----

    /// Held by registration from the group snapshot until the handle is set
    pub(crate) fn manager_slot(&self) -> MutexGuard<'_, Weak<ManagerShared>> {
        self.manager.lock()
    }

    pub(crate) fn clear_manager(&self) {
        *self.manager.lock() = Weak::new();
    }

    // ---- recording tap ----

    /// Record all further traffic through `recorder`
    pub fn attach_recorder(&self, recorder: Arc<ConnectionRecorder>) {
        *self.recorder.lock() = Some(recorder);
    }

    /// Stop recording, returning the recorder if one was attached
    pub fn detach_recorder(&self) -> Option<Arc<ConnectionRecorder>> {
        self.recorder.lock().take()
    }

    fn recorder(&self) -> Option<Arc<ConnectionRecorder>> {
        self.recorder.lock().clone()
    }

    // ---- lifecycle ----

    /// Flip the closed flag; exactly one caller observes `true`
    ///
    /// The winner cancels the connection's context before returning.
    pub fn mark_closed(&self) -> bool {
        let won = self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.cancel.cancel();
        }
        won
    }

    /// Whether the connection has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() || self.cancel.is_cancelled() {
            return Err(MockError::ConnectionClosed(self.id.clone()));
        }
        Ok(())
    }

    /// Send a data message to the client
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` after close, the transport's error, or the
    /// attached recorder's hook error
    pub async fn send(&self, message_type: MessageType, payload: Bytes) -> Result<()> {
        self.ensure_open()?;

        let message = OutboundMessage {
            message_type,
            payload,
        };
        self.transport.send(message.clone()).await?;
        self.touch();

        if let Some(recorder) = self.recorder() {
            recorder.record_send(message.message_type, &message.payload)?;
        }
        Ok(())
    }

    /// Send a text message
    ///
    /// # Errors
    ///
    /// See [`Connection::send`]
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(MessageType::Text, Bytes::from(text.into())).await
    }

    /// Report a message read from the client
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` after close, or the attached recorder's
    /// hook error
    pub fn note_received(&self, message_type: MessageType, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.touch();

        if let Some(recorder) = self.recorder() {
            recorder.record_receive(message_type, data)?;
        }
        Ok(())
    }

    /// Tear the connection down
    ///
    /// Returns `Ok(false)` if another caller already closed it. The winner
    /// cancels the context, deregisters from the manager, finishes any
    /// attached recording and closes the transport.
    ///
    /// # Errors
    ///
    /// Returns the transport's close error
    pub async fn close(&self, code: u16, reason: &str) -> Result<bool> {
        if !self.mark_closed() {
            return Ok(false);
        }
        debug!("Closing connection {} ({} {})", self.id, code, reason);

        let owner = self.manager_slot().upgrade();
        if let Some(shared) = owner {
            shared.remove(&self.id);
        }

        if let Some(recorder) = self.detach_recorder() {
            recorder.record_close(code, reason);
            if let Err(e) = recorder.complete() {
                warn!("Failed to complete recording for {}: {}", self.id, e);
                recorder.record_error(&e);
            }
        }

        self.transport.close(code, reason).await?;
        Ok(true)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint_path", &self.info.endpoint_path)
            .field("subprotocol", &self.info.subprotocol)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
