//! Admission control for the accept loop

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds how many client sessions are served at once
///
/// Each admitted session holds a [`SessionPermit`] for its whole lifetime.
#[derive(Clone)]
pub struct ConnectionLimit {
    permits: Arc<Semaphore>,
    max_connections: usize,
}

impl ConnectionLimit {
    /// Allow up to `max_connections` concurrent sessions (at least one)
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        }
    }

    /// Admit one session, or `None` when the limit is reached
    pub fn try_admit(&self) -> Option<SessionPermit> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .ok()
            .map(|permit| SessionPermit { _permit: permit })
    }

    /// Sessions currently admitted
    #[must_use]
    pub fn active(&self) -> usize {
        self.max_connections - self.permits.available_permits()
    }

    /// Configured limit
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Slot held by an admitted session; released on drop
pub struct SessionPermit {
    _permit: OwnedSemaphorePermit,
}
