//! Bookkeeping for nodes that are joining the network.
//!
//! A session lives from the moment a joiner shows up in purgatory until it is
//! admitted. Sessions that outlive their TTL are removed by a background task
//! in deadline order.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use pulsenet_common::NodeRef;
use pulsenet_consensus::StaticCertificate;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no session with id {0}")]
    NotFound(SessionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub node_ref: NodeRef,
    pub certificate: Option<Arc<StaticCertificate>>,
    pub ttl: Duration,
}

struct Entry {
    session: Session,
    deadline: Instant,
}

#[derive(Default)]
struct Shared {
    sessions: Mutex<HashMap<SessionId, Entry>>,
    changed: Notify,
}

impl Shared {
    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Entry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, id: SessionId, session: Session) {
        let deadline = Instant::now() + session.ttl;
        self.sessions().insert(id, Entry { session, deadline });
        self.changed.notify_one();
    }

    /// Drops expired sessions, earliest deadline first. Returns the next
    /// deadline, if any session is left.
    fn expire(&self, now: Instant) -> Option<Instant> {
        let mut sessions = self.sessions();
        let mut expired: Vec<(Instant, SessionId)> = sessions
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, e)| (e.deadline, *id))
            .collect();
        expired.sort();
        for (_, id) in expired {
            if let Some(entry) = sessions.remove(&id) {
                warn!(
                    "Join session {} of node {} expired before admission",
                    id, entry.session.node_ref
                );
            }
        }
        sessions.values().map(|e| e.deadline).min()
    }
}

struct Cleanup {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct SessionManager {
    shared: Arc<Shared>,
    cleanup: Mutex<Option<Cleanup>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            cleanup: Mutex::new(None),
        }
    }

    pub fn new_session(
        &self,
        node_ref: NodeRef,
        certificate: Option<Arc<StaticCertificate>>,
        ttl: Duration,
    ) -> SessionId {
        let id = SessionId::new();
        self.shared.insert(
            id,
            Session {
                node_ref,
                certificate,
                ttl,
            },
        );
        debug!("Opened join session {} for node {}", id, node_ref);
        id
    }

    /// Removes the session and hands it back.
    pub fn release_session(&self, id: SessionId) -> Result<Session, SessionError> {
        self.shared
            .sessions()
            .remove(&id)
            .map(|entry| entry.session)
            .ok_or(SessionError::NotFound(id))
    }

    /// Puts a released session back under `id` with a fresh deadline.
    pub fn prolongate_session(&self, id: SessionId, session: Session) {
        self.shared.insert(id, session);
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.shared.sessions().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.shared.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts the cleanup task. Calling it again is a no-op.
    pub fn start(&self) {
        let mut cleanup = self.cleanup.lock().unwrap_or_else(|e| e.into_inner());
        if cleanup.is_some() {
            return;
        }
        let (stop, mut stopped) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            loop {
                let next = shared.expire(Instant::now());
                // Without sessions, sleep until one is added.
                let wake = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
                tokio::select! {
                    _ = sleep_until(wake) => {}
                    _ = shared.changed.notified() => {}
                    _ = stopped.changed() => break,
                }
            }
        });
        *cleanup = Some(Cleanup { stop, handle });
    }

    /// Stops the cleanup task and waits for it. Calling it again is a no-op.
    pub async fn stop(&self) {
        let cleanup = self.cleanup.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(Cleanup { stop, handle }) = cleanup {
            let _ = stop.send(true);
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.cleanup.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn node_ref(seed: u8) -> NodeRef {
        NodeRef::from_bytes([seed; 32])
    }

    #[tokio::test]
    async fn test_new_manager_is_idle() {
        let manager = SessionManager::new();
        assert!(!manager.is_running());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired() {
        let manager = SessionManager::new();
        manager.start();
        manager.new_session(node_ref(1), None, Duration::from_millis(200));
        assert_eq!(manager.len(), 1);

        sleep(Duration::from_millis(400)).await;
        assert_eq!(manager.len(), 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_cleanup_after_concurrent_release() {
        let manager = SessionManager::new();
        manager.start();
        let id = manager.new_session(node_ref(1), None, Duration::from_millis(200));
        manager.release_session(id).unwrap();

        sleep(Duration::from_millis(400)).await;
        assert_eq!(manager.len(), 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_cleanup_order() {
        let manager = SessionManager::new();
        manager.start();
        manager.new_session(node_ref(1), None, Duration::from_millis(800));
        manager.new_session(node_ref(2), None, Duration::from_millis(800));
        manager.new_session(node_ref(3), None, Duration::from_millis(200));
        assert_eq!(manager.len(), 3);

        sleep(Duration::from_millis(500)).await;
        assert_eq!(manager.len(), 2);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let manager = SessionManager::new();
        manager.start();
        manager.start();
        assert!(manager.is_running());
        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_release_and_prolongate() {
        let manager = SessionManager::new();
        manager.start();
        let id = manager.new_session(node_ref(4), None, Duration::from_secs(2));

        let session = manager.release_session(id).unwrap();
        assert_eq!(session.node_ref, node_ref(4));
        assert!(!manager.contains(id));
        assert_eq!(manager.release_session(id).unwrap_err(), SessionError::NotFound(id));

        manager.prolongate_session(id, session);
        let session = manager.release_session(id).unwrap();
        assert_eq!(session.node_ref, node_ref(4));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_prolongated_session_gets_fresh_deadline() {
        let manager = SessionManager::new();
        manager.start();
        let id = manager.new_session(node_ref(5), None, Duration::from_millis(300));

        sleep(Duration::from_millis(200)).await;
        let session = manager.release_session(id).unwrap();
        manager.prolongate_session(id, session);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.len(), 1);
        sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.len(), 0);
        manager.stop().await;
    }
}
