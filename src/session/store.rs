//! Bounded in-memory session store with least-recently-used eviction

use chrono::Utc;
use lru::LruCache;
use std::num::NonZeroUsize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::session::{
    errors::{SessionError, SessionResult},
    types::{generate_message_id, generate_session_id, Message, NewMessage, Session, SessionSummary},
};

/// Capacity limits for a [`SessionStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_sessions: usize,
    pub max_messages_per_session: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            max_messages_per_session: 100,
        }
    }
}

struct StoreInner {
    /// Iteration order is most-recently-used first
    sessions: LruCache<String, Session>,
    next_sequence: u64,
}

impl StoreInner {
    fn insert(&mut self, session: Session) {
        let id = session.id.clone();
        if let Some((evicted_id, evicted)) = self.sessions.push(id.clone(), session) {
            if evicted_id != id {
                debug!(
                    "Evicted least recently used session {} ({} messages)",
                    evicted_id,
                    evicted.messages.len()
                );
            }
        }
    }
}

/// Authoritative keeper of sessions and their messages.
///
/// Every operation takes the single store lock for in-memory work only and
/// returns owned copies, so no caller ever holds a reference into the store.
/// Reads and writes both count as access for recency.
pub struct SessionStore {
    inner: Mutex<StoreInner>,
    limits: StoreLimits,
}

impl SessionStore {
    /// Create a store. Limits of zero are raised to one.
    pub fn new(limits: StoreLimits) -> Self {
        let limits = StoreLimits {
            max_sessions: limits.max_sessions.max(1),
            max_messages_per_session: limits.max_messages_per_session.max(1),
        };
        let capacity = NonZeroUsize::new(limits.max_sessions).unwrap_or(NonZeroUsize::MIN);

        info!(
            "Session store initialized: max_sessions={}, max_messages_per_session={}",
            limits.max_sessions, limits.max_messages_per_session
        );

        Self {
            inner: Mutex::new(StoreInner {
                sessions: LruCache::new(capacity),
                next_sequence: 1,
            }),
            limits,
        }
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    /// Create a session with a fresh id, evicting the least recently used one if full
    pub async fn create_session(&self) -> Session {
        let mut inner = self.inner.lock().await;

        let mut id = generate_session_id();
        while inner.sessions.contains(&id) {
            id = generate_session_id();
        }

        let session = Session::new(id);
        inner.insert(session.clone());
        info!("Session created: {}", session.id);
        session
    }

    /// Fetch a session, marking it most recently used
    pub async fn get_session(&self, id: &str) -> SessionResult<Session> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.touch();
        Ok(session.clone())
    }

    /// Fetch a session or create it under the given id
    pub async fn get_or_create(&self, id: &str) -> Session {
        let mut inner = self.inner.lock().await;

        if let Some(session) = inner.sessions.get_mut(id) {
            session.touch();
            return session.clone();
        }

        let session = Session::new(id.to_string());
        inner.insert(session.clone());
        info!("Session created: {}", id);
        session
    }

    /// Append a message, dropping the oldest messages beyond the per-session bound
    pub async fn append_message(&self, session_id: &str, draft: NewMessage) -> SessionResult<Message> {
        let max_messages = self.limits.max_messages_per_session;
        let mut guard = self.inner.lock().await;
        let StoreInner {
            sessions,
            next_sequence,
        } = &mut *guard;

        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let mut timestamp = Utc::now();
        if let Some(last) = session.messages.back() {
            if last.timestamp > timestamp {
                timestamp = last.timestamp;
            }
        }

        let sequence = *next_sequence;
        *next_sequence += 1;

        let message = Message {
            id: generate_message_id(sequence),
            session_id: session_id.to_string(),
            sequence,
            role: draft.role,
            content: draft.content,
            timestamp,
            sources: draft.sources,
        };

        session.messages.push_back(message.clone());
        while session.messages.len() > max_messages {
            if let Some(dropped) = session.messages.pop_front() {
                debug!("Dropped oldest message {} from session {}", dropped.id, session_id);
            }
        }
        session.touch();

        debug!(
            "Message appended: session={}, role={}, id={}",
            session_id, message.role, message.id
        );
        Ok(message)
    }

    /// The most recent `limit` messages in chronological order, or all of them
    pub async fn list_messages(&self, session_id: &str, limit: Option<usize>) -> SessionResult<Vec<Message>> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.touch();

        let skip = match limit {
            Some(limit) if limit > 0 => session.messages.len().saturating_sub(limit),
            _ => 0,
        };
        Ok(session.messages.iter().skip(skip).cloned().collect())
    }

    /// Snapshot of all sessions, most recently used first. Does not affect recency.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let inner = self.inner.lock().await;
        inner.sessions.iter().map(|(_, session)| session.summary()).collect()
    }

    /// Remove a session and its messages. Returns whether anything was removed;
    /// deleting an absent id is not an error.
    pub async fn delete_session(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner.sessions.pop(id).is_some();
        if removed {
            info!("Session deleted: {}", id);
        }
        removed
    }

    /// Remove all messages of a session while keeping the session
    pub async fn clear_session(&self, id: &str) -> SessionResult<()> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.messages.clear();
        session.touch();
        info!("Session cleared: {}", id);
        Ok(())
    }

    /// Whether a session is resident, without promoting it
    pub async fn contains(&self, id: &str) -> bool {
        self.inner.lock().await.sessions.contains(id)
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    pub async fn total_message_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.sessions.iter().map(|(_, s)| s.messages.len()).sum()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(StoreLimits::default())
    }
}
