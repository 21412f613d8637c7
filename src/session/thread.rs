//! Chat sessions and the in-memory store that owns them.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::llm::Message;

/// One browser chat ("New Chat" starts another).
///
/// Holds the user/assistant history shown in the chat widget. Tool traffic
/// never lands here; it lives only inside one orchestrator run.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    id: String,
    messages: RwLock<Vec<Message>>,
    created_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    /// Held for the whole duration of a turn.
    turn: tokio::sync::Mutex<()>,
}

impl Session {
    fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(SessionInner {
                id,
                messages: RwLock::new(Vec::new()),
                created_at: now,
                last_activity: RwLock::new(now),
                turn: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Get the session ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Wait until no other turn runs in this session.
    pub async fn lock_turn(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.turn.lock().await
    }

    /// Whether a turn currently holds the session.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.turn.try_lock().is_err()
    }

    /// Append one finished exchange.
    ///
    /// Both entries land under the same write lock, so readers never observe
    /// a user entry without its answer.
    pub fn commit_turn(&self, user: impl Into<String>, assistant: impl Into<String>) {
        let mut guard = self
            .inner
            .messages
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard.push(Message::user(user));
        guard.push(Message::assistant(assistant));
        drop(guard);
        self.touch();
    }

    /// Snapshot of the visible history, oldest first.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.inner
            .messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner
            .messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn touch(&self) {
        let mut guard = self
            .inner
            .last_activity
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Utc::now();
    }

    /// Check if the session has been idle longer than `timeout`.
    #[must_use]
    pub fn is_expired_with_timeout(&self, timeout: Duration) -> bool {
        let last = *self
            .inner
            .last_activity
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        // Negative durations (clock skew) count as fresh.
        (Utc::now() - last)
            .to_std()
            .is_ok_and(|idle| idle > timeout)
    }
}

/// Sessions keyed by id, shared by every request handler.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under a fresh UUID.
    #[must_use]
    pub fn create(&self) -> Session {
        self.create_with_id(Uuid::new_v4().to_string())
    }

    /// Create a new session with a specific ID, replacing any existing one.
    #[must_use]
    pub fn create_with_id(&self, id: impl Into<String>) -> Session {
        let id = id.into();
        let session = Session::new(id.clone());
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, session.clone());
        session
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Resume the chat a client already knows, or open it under that id.
    #[must_use]
    pub fn get_or_create(&self, id: &str) -> Session {
        let mut guard = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id.to_string()))
            .clone()
    }

    /// Remove a session by ID.
    pub fn remove(&self, id: &str) -> Option<Session> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop sessions idle for longer than `timeout`.
    ///
    /// Sessions with a turn in flight are kept. Returns the number removed.
    pub fn cleanup_expired(&self, timeout: Duration) -> usize {
        let mut guard = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = guard.len();
        guard.retain(|_, session| session.is_busy() || !session.is_expired_with_timeout(timeout));
        before - guard.len()
    }
}
