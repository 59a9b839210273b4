//! Session lifecycle management.
//!
//! Maps `clientId` to [`ClientSession`]. Backed by a sharded map so lookups
//! from concurrent connections never contend on one server-wide lock.

use super::client::ClientSession;
use comet_core::{CometError, CometResult};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Snapshot of one session, for listing and diagnostics.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub browser_id: Option<String>,
    pub idle: Duration,
    pub queued: usize,
    pub suspended: bool,
}

/// All live client sessions.
pub struct SessionStore {
    sessions: DashMap<String, Arc<ClientSession>>,
    max_sessions: usize,
}

impl SessionStore {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
        }
    }

    /// Register a new session.
    pub fn insert(&self, session: Arc<ClientSession>) -> CometResult<()> {
        if self.sessions.len() >= self.max_sessions {
            return Err(CometError::Other(format!(
                "max sessions ({}) reached",
                self.max_sessions
            )));
        }
        info!(client_id = %session.id(), "session created");
        self.sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<ClientSession>> {
        self.sessions
            .get(client_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Look up a session, reporting unknown ids as an error.
    pub fn require(&self, client_id: &str) -> CometResult<Arc<ClientSession>> {
        self.get(client_id)
            .ok_or_else(|| CometError::SessionNotFound(client_id.to_string()))
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<ClientSession>> {
        let removed = self.sessions.remove(client_id).map(|(_, s)| s);
        if removed.is_some() {
            info!(client_id, "session removed");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of the current sessions. Entries are cloned out first so no
    /// shard lock is held across a session lock.
    fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// List all active sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::new();
        for session in self.snapshot() {
            let state = session.lock().await;
            infos.push(SessionInfo {
                id: session.id().to_string(),
                browser_id: state.browser_id().map(str::to_string),
                idle: state.last_access().elapsed(),
                queued: state.queued(),
                suspended: state.is_suspended(),
            });
        }
        infos
    }

    /// Sessions with no poll parked on them that have been quiet for longer
    /// than their poll timeout (`default_timeout` unless the client asked for
    /// its own) plus `max_interval`.
    pub async fn idle(
        &self,
        default_timeout: Duration,
        max_interval: Duration,
    ) -> Vec<Arc<ClientSession>> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for session in self.snapshot() {
            let state = session.lock().await;
            let max_idle = state.timeout().unwrap_or(default_timeout) + max_interval;
            if !state.is_suspended() && now.duration_since(state.last_access()) > max_idle {
                expired.push(Arc::clone(&session));
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "idle sessions found");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspend::{suspend, ConnectionId};

    fn session(id: &str) -> Arc<ClientSession> {
        Arc::new(ClientSession::new(id.into(), None))
    }

    #[test]
    fn insert_get_remove() {
        let store = SessionStore::new(10);
        store.insert(session("a")).unwrap();
        assert!(store.get("a").is_some());
        assert!(store.get("b").is_none());
        assert!(matches!(
            store.require("b"),
            Err(CometError::SessionNotFound(_))
        ));
        assert!(store.remove("a").is_some());
        assert!(store.remove("a").is_none());
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn enforces_capacity() {
        let store = SessionStore::new(1);
        store.insert(session("a")).unwrap();
        assert!(store.insert(session("b")).is_err());
        assert_eq!(store.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_skips_suspended_sessions() {
        let store = SessionStore::new(10);
        let parked = session("parked");
        let (handle, _suspension) = suspend(ConnectionId::next(), Duration::from_secs(60));
        parked.lock().await.suspend(handle);
        store.insert(parked).unwrap();
        store.insert(session("quiet")).unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        let expired = store.idle(Duration::from_secs(5), Duration::from_secs(5)).await;
        let ids: Vec<_> = expired.iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, ["quiet"]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_honours_client_timeout() {
        let store = SessionStore::new(10);
        let patient = session("patient");
        patient.set_timeout(Duration::from_secs(60)).await;
        store.insert(patient).unwrap();
        store.insert(session("default")).unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        let expired = store.idle(Duration::from_secs(5), Duration::from_secs(5)).await;
        let ids: Vec<_> = expired.iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, ["default"]);
    }

    #[tokio::test]
    async fn list_reports_queue_and_suspension() {
        let store = SessionStore::new(10);
        let s = session("a");
        s.deliver(comet_core::MessageRef::new(comet_core::Message::new("/x")))
            .await;
        s.set_browser_id("b1").await;
        store.insert(s).unwrap();

        let infos = store.list().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].queued, 1);
        assert!(!infos[0].suspended);
        assert_eq!(infos[0].browser_id.as_deref(), Some("b1"));
    }
}
