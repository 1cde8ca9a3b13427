//! Per-device session state
//!
//! Sessions are created lazily and evicted after a period of inactivity.
//! Each lives behind its own async mutex; holding it is what makes
//! mutation single-writer per device, so an extraction run and a chat
//! turn for the same device never interleave.

mod context;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use context::SessionContext;

use crate::config::SessionConfig;
use crate::memory::ShortTermMemory;

/// Upper bound of a session's message history
pub const MAX_MESSAGES: usize = 50;

/// What a session is currently doing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Idle,
    Processing,
    Chatting,
}

/// In-memory state of one device
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub device_id: String,
    pub mode: SessionMode,
    pub context: SessionContext,
    pub short_term: ShortTermMemory,
    pub created_at: Instant,
    last_activity: Instant,
}

impl Session {
    #[must_use]
    pub fn new(device_id: impl Into<String>, max_messages: usize) -> Self {
        let now = Instant::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            mode: SessionMode::Idle,
            context: SessionContext::new(max_messages),
            short_term: ShortTermMemory::new(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    #[must_use]
    pub const fn last_activity(&self) -> Instant {
        self.last_activity
    }
}

/// Shared handle to one device's session
pub type SessionHandle = Arc<Mutex<Session>>;

/// Exclusive access to one device's session
pub type SessionGuard = OwnedMutexGuard<Session>;

/// Owner of all device sessions
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
    config: SessionConfig,
}

impl SessionStore {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    async fn get_or_create(&self, device_id: &str) -> SessionHandle {
        if let Some(handle) = self.sessions.read().await.get(device_id) {
            return Arc::clone(handle);
        }

        let mut sessions = self.sessions.write().await;
        Arc::clone(sessions.entry(device_id.to_string()).or_insert_with(|| {
            tracing::debug!(device_id, "session created");
            Arc::new(Mutex::new(Session::new(device_id, self.config.max_messages)))
        }))
    }

    /// Lock the device's session, creating it if needed, and mark it active
    pub async fn lock(&self, device_id: &str) -> SessionGuard {
        loop {
            let handle = self.get_or_create(device_id).await;
            let mut guard = Arc::clone(&handle).lock_owned().await;

            // Evicted while we waited; start over with a fresh session
            let current = self
                .sessions
                .read()
                .await
                .get(device_id)
                .is_some_and(|h| Arc::ptr_eq(h, &handle));
            if current {
                guard.touch();
                return guard;
            }
        }
    }

    /// Existing session, without creating one
    pub async fn get(&self, device_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(device_id).cloned()
    }

    pub async fn remove(&self, device_id: &str) -> bool {
        self.sessions.write().await.remove(device_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Evict sessions idle past the TTL; locked sessions are in use and kept
    pub async fn sweep_expired(&self) -> usize {
        let ttl = self.config.ttl;
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();

        sessions.retain(|device_id, handle| match handle.try_lock() {
            Ok(session) => {
                let keep = now.duration_since(session.last_activity) <= ttl;
                if !keep {
                    tracing::debug!(device_id = %device_id, "session expired");
                }
                keep
            }
            Err(_) => true,
        });

        before - sessions.len()
    }

    /// Run [`Self::sweep_expired`] on the configured interval
    #[must_use]
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(store.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = store.sweep_expired().await;
                if evicted > 0 {
                    tracing::info!(evicted, "swept idle sessions");
                }
            }
        })
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn store_with_ttl(ttl: Duration) -> SessionStore {
        SessionStore::new(SessionConfig {
            ttl,
            sweep_interval: Duration::from_secs(1),
            max_messages: MAX_MESSAGES,
        })
    }

    #[tokio::test]
    async fn one_session_per_device() {
        let store = SessionStore::default();
        let first_id = store.lock("dev-1").await.id.clone();
        let second_id = store.lock("dev-1").await.id.clone();
        assert_eq!(first_id, second_id);

        store.lock("dev-2").await;
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_swept() {
        let store = store_with_ttl(Duration::from_secs(60));
        drop(store.lock("idle").await);
        tokio::time::advance(Duration::from_secs(30)).await;
        drop(store.lock("busy").await);
        tokio::time::advance(Duration::from_secs(45)).await;

        assert_eq!(store.sweep_expired().await, 1);
        assert!(store.get("idle").await.is_none());
        assert!(store.get("busy").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn locked_sessions_survive_sweep() {
        let store = store_with_ttl(Duration::from_secs(60));
        let guard = store.lock("dev").await;
        tokio::time::advance(Duration::from_secs(120)).await;

        assert_eq!(store.sweep_expired().await, 0);
        drop(guard);
        assert_eq!(store.sweep_expired().await, 1);
    }

    #[tokio::test]
    async fn lock_serializes_writers() {
        let store = SessionStore::default();
        let guard = store.lock("dev").await;

        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut session = store.lock("dev").await;
                session.mode = SessionMode::Chatting;
            })
        };

        tokio::task::yield_now().await;
        assert_eq!(guard.mode, SessionMode::Idle);
        drop(guard);
        contender.await.unwrap();
        assert_eq!(store.lock("dev").await.mode, SessionMode::Chatting);
    }
}
