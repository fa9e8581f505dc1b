//! Process-wide bookkeeping of live sessions.
//!
//! Sessions register on connect and deregister when their [`Registration`]
//! drops. The only iteration is [`ConnectionRegistry::close_all`], used during
//! shutdown.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::{Notify, watch};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<Uuid, Arc<Notify>>>,
    count: watch::Sender<usize>,
    draining: AtomicBool,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            count: watch::Sender::new(0),
            draining: AtomicBool::new(false),
        }
    }
}

/// Proof of membership in the registry. Dropping it removes the session.
#[derive(Debug)]
pub struct Registration {
    id: Uuid,
    close: Arc<Notify>,
    registry: Arc<ConnectionRegistry>,
}

impl Registration {
    /// Resolves once the registry asks this session to close. A request made
    /// before the first call is not lost.
    pub async fn close_requested(&self) {
        self.close.notified().await
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a session. Returns `None` once the registry is draining.
    ///
    /// The draining check happens under the map lock, so a session either
    /// lands before [`close_all`](Self::close_all) and gets signalled, or is
    /// refused.
    pub fn register(self: &Arc<Self>, id: Uuid) -> Option<Registration> {
        let close = Arc::new(Notify::new());
        let mut sessions = self.lock();
        if self.draining.load(Ordering::SeqCst) {
            return None;
        }
        sessions.insert(id, close.clone());
        self.count.send_replace(sessions.len());
        drop(sessions);
        debug!(%id, "Session registered");

        Some(Registration {
            id,
            close,
            registry: self.clone(),
        })
    }

    fn remove(&self, id: Uuid) {
        let mut sessions = self.lock();
        if sessions.remove(&id).is_some() {
            self.count.send_replace(sessions.len());
            debug!(%id, "Session deregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Stops accepting registrations and asks every live session to close.
    /// Returns how many sessions were signalled.
    pub fn close_all(&self) -> usize {
        let sessions = self.lock();
        self.draining.store(true, Ordering::SeqCst);
        for close in sessions.values() {
            close.notify_one();
        }
        sessions.len()
    }

    /// Waits until no session is registered.
    pub async fn wait_until_empty(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<Notify>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
