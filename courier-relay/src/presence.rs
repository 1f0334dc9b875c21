//! Presence registry: which user is online, and through which session.
//!
//! ```text
//! user_id ──► SessionHandle { session_id, sink } ──► socket write half
//! ```
//!
//! One live session per user. A new connection for the same user replaces
//! the old entry; the displaced session keeps its socket until it closes,
//! and its exit cannot evict the newer session (compare-and-delete).

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Writes encoded frames to one connected client.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: String) -> Result<(), SinkError>;
}

/// Channel-backed sink, used to embed the relay or to observe deliveries.
#[async_trait]
impl FrameSink for mpsc::UnboundedSender<String> {
    async fn send_frame(&self, frame: String) -> Result<(), SinkError> {
        self.send(frame)
            .map_err(|_| SinkError("frame channel closed".to_string()))
    }
}

/// A write to a session failed; the session should be treated as dead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError(pub String);

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session write failed: {}", self.0)
    }
}

impl std::error::Error for SinkError {}

/// A live connection as seen by the rest of the relay.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    user_id: String,
    created_at: Instant,
    /// Seconds since epoch, for logs
    connected_at: u64,
    sink: Arc<dyn FrameSink>,
}

impl SessionHandle {
    pub fn new(user_id: impl Into<String>, sink: Arc<dyn FrameSink>) -> Self {
        let connected_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            created_at: Instant::now(),
            connected_at,
            sink,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub async fn send_frame(&self, frame: String) -> Result<(), SinkError> {
        self.sink.send_frame(frame).await
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    EmptyUserId,
}

impl fmt::Display for PresenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceError::EmptyUserId => write!(f, "User id must not be empty"),
        }
    }
}

impl std::error::Error for PresenceError {}

/// Concurrent map from user id to that user's live session.
#[derive(Default)]
pub struct PresenceRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as the live session of its user.
    ///
    /// Last writer wins. Returns the displaced session, which is not notified.
    pub async fn register(
        &self,
        handle: SessionHandle,
    ) -> Result<Option<SessionHandle>, PresenceError> {
        if handle.user_id().is_empty() {
            return Err(PresenceError::EmptyUserId);
        }
        let mut sessions = self.sessions.write().await;
        Ok(sessions.insert(handle.user_id().to_string(), handle))
    }

    /// Remove the entry only if it still belongs to `session_id`.
    pub async fn unregister(&self, user_id: &str, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(user_id) {
            Some(current) if current.id() == session_id => {
                sessions.remove(user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, user_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(user_id).cloned()
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.sessions.read().await.contains_key(user_id)
    }

    pub async fn online_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn online_users(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
