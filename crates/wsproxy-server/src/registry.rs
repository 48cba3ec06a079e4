//! Registry of live inbound sessions.
//!
//! Each connection handler registers on accept and holds the returned
//! [`SessionGuard`]; dropping the guard unregisters, so every exit path of the
//! handler (return, error, panic, task abort) cleans up. The registry is only
//! iterated by [`SessionRegistry::broadcast_going_away`] during server
//! shutdown.
//!
//! The map sits behind a `std::sync::Mutex` that is never held across an
//! `.await`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A registered session.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub remote_addr: SocketAddr,
    pub connected_at: Instant,
    going_away: CancellationToken,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<u64, SessionEntry>,
    /// Set by the broadcast; sessions registering afterwards start out
    /// already told to go away.
    closing: bool,
}

/// Set of live sessions, owned by the server and shared with each handler.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a newly accepted session.
    pub fn register(self: &Arc<Self>, remote_addr: SocketAddr) -> SessionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let going_away = CancellationToken::new();

        let mut inner = self.inner();
        if inner.closing {
            going_away.cancel();
        }
        inner.sessions.insert(
            id,
            SessionEntry {
                remote_addr,
                connected_at: Instant::now(),
                going_away: going_away.clone(),
            },
        );
        drop(inner);

        debug!(session = id, remote = %remote_addr, "session registered");
        SessionGuard {
            id,
            going_away,
            registry: self.clone(),
        }
    }

    fn unregister(&self, id: u64) {
        if let Some(entry) = self.inner().sessions.remove(&id) {
            debug!(
                session = id,
                remote = %entry.remote_addr,
                secs = entry.connected_at.elapsed().as_secs(),
                "session unregistered"
            );
        }
    }

    /// Tell every live session (and any registered later) to close with a
    /// going-away indication. Returns how many sessions were notified.
    pub fn broadcast_going_away(&self) -> usize {
        let mut inner = self.inner();
        inner.closing = true;
        for entry in inner.sessions.values() {
            entry.going_away.cancel();
        }
        inner.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.inner().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the live sessions.
    pub fn list(&self) -> Vec<SessionEntry> {
        self.inner().sessions.values().cloned().collect()
    }
}

/// Membership of one session in the registry.
pub struct SessionGuard {
    id: u64,
    going_away: CancellationToken,
    registry: Arc<SessionRegistry>,
}

impl SessionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolves once the server has broadcast going-away.
    pub async fn going_away(&self) {
        self.going_away.cancelled().await
    }

    #[cfg(test)]
    pub fn is_going_away(&self) -> bool {
        self.going_away.is_cancelled()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
