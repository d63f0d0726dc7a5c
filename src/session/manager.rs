//! Process-wide connection registry and group router

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::LimitsConfig;
use crate::id::{IdGenerator, SortableIdGenerator};
use crate::recording::MessageType;
use crate::{MockError, Result};

use super::connection::{Connection, ConnectionInfo};
use super::transport::Transport;
use super::{CLOSE_GOING_AWAY, MAX_GROUPS_PER_CONNECTION};

/// Both indices live behind one lock so they can never disagree
#[derive(Default)]
struct Registry {
    connections: HashMap<String, Arc<Connection>>,
    group_index: HashMap<String, HashSet<String>>,
}

impl Registry {
    fn is_registered(&self, conn: &Connection) -> bool {
        self.connections
            .get(conn.id())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), conn))
    }

    fn index_add(&mut self, id: &str, group: &str) {
        self.group_index
            .entry(group.to_string())
            .or_default()
            .insert(id.to_string());
    }

    fn index_remove(&mut self, id: &str, group: &str) {
        if let Some(members) = self.group_index.get_mut(group) {
            members.remove(id);
            if members.is_empty() {
                self.group_index.remove(group);
            }
        }
    }

    fn detach(&mut self, id: &str) -> Option<Arc<Connection>> {
        let conn = self.connections.remove(id)?;
        for group in conn.take_groups() {
            self.index_remove(id, &group);
        }
        conn.clear_manager();
        Some(conn)
    }
}

/// State a `Connection` points back to through a `Weak` handle
#[derive(Default)]
pub(crate) struct ManagerShared {
    registry: RwLock<Registry>,
}

impl ManagerShared {
    /// Returns `Ok(false)` without touching anything if `conn` is no longer
    /// registered here, so the caller can retry against its current owner.
    pub(crate) fn join_group(&self, conn: &Connection, group: &str) -> Result<bool> {
        let mut registry = self.registry.write();
        if !registry.is_registered(conn) {
            return Ok(false);
        }
        conn.join_local(group)?;
        registry.index_add(conn.id(), group);
        Ok(true)
    }

    pub(crate) fn leave_group(&self, conn: &Connection, group: &str) -> Result<bool> {
        let mut registry = self.registry.write();
        if !registry.is_registered(conn) {
            return Ok(false);
        }
        conn.leave_local(group)?;
        registry.index_remove(conn.id(), group);
        Ok(true)
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        let removed = self.registry.write().detach(id);
        if removed.is_some() {
            info!("Connection removed: {}", id);
        }
        removed
    }
}

/// Point-in-time registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// Registered connections
    pub connections: usize,
    /// Non-empty groups
    pub groups: usize,
    /// Connections per endpoint path
    pub by_endpoint: BTreeMap<String, usize>,
}

/// Central directory of live connections
///
/// Every mutation takes the single registry write lock; reads share it.
/// The lock is never held across an await point or a transport call:
/// operations acting on many connections go through [`snapshot`] first.
///
/// [`snapshot`]: ConnectionManager::snapshot
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
    id_generator: Arc<dyn IdGenerator>,
    max_groups_per_connection: usize,
    root: CancellationToken,
}

impl ConnectionManager {
    /// Create a manager enforcing `max_groups_per_connection`
    #[must_use]
    pub fn new(max_groups_per_connection: usize) -> Self {
        Self {
            shared: Arc::new(ManagerShared::default()),
            id_generator: Arc::new(SortableIdGenerator::new()),
            max_groups_per_connection,
            root: CancellationToken::new(),
        }
    }

    /// Create a manager from configured limits
    #[must_use]
    pub fn from_limits(limits: &LimitsConfig) -> Self {
        Self::new(limits.max_groups_per_connection)
    }

    /// Replace the connection ID source
    #[must_use]
    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    /// Root cancellation handle; every connection created here derives from it
    #[must_use]
    pub fn context(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Build a connection with a fresh ID, without registering it
    #[must_use]
    pub fn create_connection(
        &self,
        info: ConnectionInfo,
        transport: Arc<dyn Transport>,
    ) -> Arc<Connection> {
        let id = self.id_generator.next_id();
        Arc::new(
            Connection::new(id, info, transport, &self.root)
                .with_max_groups(self.max_groups_per_connection),
        )
    }

    /// Build and register a connection
    pub fn open(&self, info: ConnectionInfo, transport: Arc<dyn Transport>) -> Arc<Connection> {
        let conn = self.create_connection(info, transport);
        self.add(Arc::clone(&conn));
        conn
    }

    /// Register a connection, indexing any groups it already belongs to
    ///
    /// A different connection registered under the same ID is detached first.
    pub fn add(&self, conn: Arc<Connection>) {
        {
            let mut registry = self.shared.registry.write();
            if registry.is_registered(&conn) {
                return;
            }
            registry.detach(conn.id());
            // Unowned joins hold the slot, so the groups read here are final
            let mut slot = conn.manager_slot();
            for group in conn.groups() {
                registry.index_add(conn.id(), &group);
            }
            registry
                .connections
                .insert(conn.id().to_string(), Arc::clone(&conn));
            *slot = Arc::downgrade(&self.shared);
        }
        info!(
            "Connection registered: {} on {}",
            conn.id(),
            conn.endpoint_path()
        );
    }

    /// Deregister a connection and purge it from every group
    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        self.shared.remove(id)
    }

    /// Look up a connection
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.shared.registry.read().connections.get(id).cloned()
    }

    /// Number of registered connections
    #[must_use]
    pub fn count(&self) -> usize {
        self.shared.registry.read().connections.len()
    }

    /// Immutable copy of every registered connection
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.shared
            .registry
            .read()
            .connections
            .values()
            .cloned()
            .collect()
    }

    /// All registered connections
    #[must_use]
    pub fn list_all(&self) -> Vec<Arc<Connection>> {
        self.snapshot()
    }

    /// Connections on an endpoint path
    #[must_use]
    pub fn list_by_endpoint(&self, path: &str) -> Vec<Arc<Connection>> {
        self.shared
            .registry
            .read()
            .connections
            .values()
            .filter(|c| c.endpoint_path() == path)
            .cloned()
            .collect()
    }

    /// Number of connections on an endpoint path
    #[must_use]
    pub fn count_by_endpoint(&self, path: &str) -> usize {
        self.shared
            .registry
            .read()
            .connections
            .values()
            .filter(|c| c.endpoint_path() == path)
            .count()
    }

    /// Members of a group
    #[must_use]
    pub fn list_by_group(&self, group: &str) -> Vec<Arc<Connection>> {
        let registry = self.shared.registry.read();
        registry
            .group_index
            .get(group)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| registry.connections.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of members of a group
    #[must_use]
    pub fn group_size(&self, group: &str) -> usize {
        self.shared
            .registry
            .read()
            .group_index
            .get(group)
            .map_or(0, HashSet::len)
    }

    /// Names of all non-empty groups, sorted
    #[must_use]
    pub fn list_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self
            .shared
            .registry
            .read()
            .group_index
            .keys()
            .cloned()
            .collect();
        groups.sort_unstable();
        groups
    }

    /// Registry statistics
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        let registry = self.shared.registry.read();
        let mut by_endpoint = BTreeMap::new();
        for conn in registry.connections.values() {
            *by_endpoint
                .entry(conn.endpoint_path().to_string())
                .or_insert(0) += 1;
        }
        ManagerStats {
            connections: registry.connections.len(),
            groups: registry.group_index.len(),
            by_endpoint,
        }
    }

    /// Add a registered connection to a group
    ///
    /// # Errors
    ///
    /// Returns `ConnectionNotFound`, `AlreadyInGroup` or `TooManyGroups`
    pub fn join_group(&self, id: &str, group: &str) -> Result<()> {
        let conn = self
            .get(id)
            .ok_or_else(|| MockError::ConnectionNotFound(id.to_string()))?;
        conn.join_group(group)
    }

    /// Remove a registered connection from a group
    ///
    /// # Errors
    ///
    /// Returns `ConnectionNotFound` or `NotInGroup`
    pub fn leave_group(&self, id: &str, group: &str) -> Result<()> {
        let conn = self
            .get(id)
            .ok_or_else(|| MockError::ConnectionNotFound(id.to_string()))?;
        conn.leave_group(group)
    }

    /// Send to every current member of `group`; returns how many accepted it
    pub async fn broadcast_to_group_raw(
        &self,
        group: &str,
        message_type: MessageType,
        payload: Bytes,
    ) -> usize {
        let members = self.list_by_group(group);
        let sent = deliver(members, message_type, payload).await;
        debug!("Broadcast to group '{}': {} recipients", group, sent);
        sent
    }

    /// Send to every registered connection; returns how many accepted it
    pub async fn broadcast_all(&self, message_type: MessageType, payload: Bytes) -> usize {
        let sent = deliver(self.snapshot(), message_type, payload).await;
        debug!("Broadcast to all: {} recipients", sent);
        sent
    }

    /// Close every registered connection; returns how many this call closed
    pub async fn close_all(&self, code: u16, reason: &str) -> usize {
        let connections = self.snapshot();
        info!("Closing {} connections", connections.len());

        let results = join_all(connections.iter().map(|c| c.close(code, reason))).await;
        results
            .into_iter()
            .zip(&connections)
            .filter(|(result, conn)| match result {
                Ok(closed) => *closed,
                Err(e) => {
                    debug!("Close of {} reported: {}", conn.id(), e);
                    // The connection is torn down even if the transport complained.
                    true
                }
            })
            .count()
    }

    /// Cancel every connection's context, then close them all
    pub async fn stop(&self) -> usize {
        self.root.cancel();
        self.close_all(CLOSE_GOING_AWAY, "server shutting down").await
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(MAX_GROUPS_PER_CONNECTION)
    }
}

async fn deliver(
    targets: Vec<Arc<Connection>>,
    message_type: MessageType,
    payload: Bytes,
) -> usize {
    let sends = targets
        .iter()
        .filter(|conn| !conn.is_closed())
        .map(|conn| conn.send(message_type, payload.clone()));

    join_all(sends)
        .await
        .into_iter()
        .filter(Result::is_ok)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SequentialIdGenerator;
    use crate::session::transport::{ChannelTransport, TransportEvent};
    use tokio::sync::mpsc;

    fn test_manager() -> ConnectionManager {
        ConnectionManager::new(4).with_id_generator(Arc::new(SequentialIdGenerator::new("c")))
    }

    fn open(
        manager: &ConnectionManager,
        path: &str,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (transport, rx) = ChannelTransport::new();
        let conn = manager.open(ConnectionInfo::new(path), Arc::new(transport));
        (conn, rx)
    }

    #[test]
    fn test_add_and_get() {
        let manager = test_manager();
        let (conn, _rx) = open(&manager, "/ws");

        assert_eq!(conn.id(), "c-000001");
        assert_eq!(manager.count(), 1);
        assert!(manager.get("c-000001").is_some());
        assert!(manager.get("missing").is_none());
    }

    #[test]
    fn test_manager_group_operations() {
        let manager = test_manager();
        let (a, _ra) = open(&manager, "/ws");
        let (b, _rb) = open(&manager, "/ws");

        manager.join_group(a.id(), "room").unwrap();
        b.join_group("room").unwrap();

        assert_eq!(manager.group_size("room"), 2);
        assert_eq!(manager.list_groups(), vec!["room".to_string()]);

        manager.leave_group(a.id(), "room").unwrap();
        assert_eq!(manager.group_size("room"), 1);
        assert!(matches!(
            manager.leave_group(a.id(), "room"),
            Err(MockError::NotInGroup { .. })
        ));
        assert!(matches!(
            manager.join_group("nobody", "room"),
            Err(MockError::ConnectionNotFound(_))
        ));
    }

    #[test]
    fn test_remove_purges_groups() {
        let manager = test_manager();
        let (conn, _rx) = open(&manager, "/ws");
        conn.join_group("a").unwrap();
        conn.join_group("b").unwrap();

        let removed = manager.remove(conn.id()).unwrap();

        assert!(Arc::ptr_eq(&removed, &conn));
        assert_eq!(manager.count(), 0);
        assert!(manager.list_by_group("a").is_empty());
        assert!(manager.list_groups().is_empty());
        assert!(conn.groups().is_empty());

        // Detached connections no longer touch the index
        conn.join_group("a").unwrap();
        assert_eq!(manager.group_size("a"), 0);
    }

    #[test]
    fn test_add_indexes_existing_groups() {
        let manager = test_manager();
        let (transport, _rx) = ChannelTransport::new();
        let conn = manager.create_connection(ConnectionInfo::new("/ws"), Arc::new(transport));
        conn.join_group("early").unwrap();

        manager.add(Arc::clone(&conn));
        assert_eq!(manager.group_size("early"), 1);
    }

    #[test]
    fn test_endpoint_queries_and_stats() {
        let manager = test_manager();
        let (a, _ra) = open(&manager, "/chat");
        let (_b, _rb) = open(&manager, "/chat");
        let (_c, _rc) = open(&manager, "/feed");
        a.join_group("g").unwrap();

        assert_eq!(manager.count_by_endpoint("/chat"), 2);
        assert_eq!(manager.list_by_endpoint("/feed").len(), 1);

        let stats = manager.stats();
        assert_eq!(stats.connections, 3);
        assert_eq!(stats.groups, 1);
        assert_eq!(stats.by_endpoint.get("/chat"), Some(&2));
    }

    #[test]
    fn test_manager_limit_applies() {
        let manager = test_manager();
        let (conn, _rx) = open(&manager, "/ws");

        for i in 0..4 {
            manager.join_group(conn.id(), &format!("g{i}")).unwrap();
        }
        assert!(matches!(
            manager.join_group(conn.id(), "g4"),
            Err(MockError::TooManyGroups { limit: 4, .. })
        ));
        assert_eq!(manager.list_groups().len(), 4);
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed() {
        let manager = test_manager();
        let (a, mut ra) = open(&manager, "/ws");
        let (b, _rb) = open(&manager, "/ws");
        let (c, _rc) = open(&manager, "/ws");
        for conn in [&a, &b, &c] {
            conn.join_group("room").unwrap();
        }
        // Closed but still registered
        c.mark_closed();

        let sent = manager
            .broadcast_to_group_raw("room", MessageType::Text, Bytes::from_static(b"hi"))
            .await;

        assert_eq!(sent, 2);
        assert!(matches!(ra.recv().await, Some(TransportEvent::Message(_))));
    }

    #[tokio::test]
    async fn test_close_all_copy_then_act() {
        let manager = test_manager();
        let mut receivers = Vec::new();
        for _ in 0..10 {
            let (conn, rx) = open(&manager, "/ws");
            conn.join_group("everyone").unwrap();
            receivers.push(rx);
        }

        let closed = manager.close_all(1000, "bye").await;

        assert_eq!(closed, 10);
        assert_eq!(manager.count(), 0);
        assert!(manager.list_groups().is_empty());
    }

    #[tokio::test]
    async fn test_stop_cancels_contexts() {
        let manager = test_manager();
        let (conn, _rx) = open(&manager, "/ws");
        let ctx = conn.context();

        assert_eq!(manager.stop().await, 1);
        assert!(ctx.is_cancelled());
        assert!(conn.is_closed());
    }
}
