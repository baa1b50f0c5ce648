//! # Session Registry
//!
//! Mutex-guarded map of in-flight sessions. The registry's size equals the
//! number of executions that have started and not yet finished.
//!
//! Sessions are retired through a [`SessionGuard`], which removes the entry
//! when dropped, including when the owning `execute` future is abandoned.
//! Explicit `remove` calls on top of the guard are no-ops.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::Request;

/// One in-flight execution of the pipeline
#[derive(Debug)]
pub struct Session {
    /// Opaque unique token, never reused
    pub id: String,
    pub request: Arc<Request>,
    pub started_at: DateTime<Utc>,
    /// Cancels this session's phases and steps
    pub cancel: CancellationToken,
}

impl Session {
    /// Open a session with a fresh id under the given cancellation token
    pub fn open(request: Arc<Request>, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request,
            started_at: Utc::now(),
            cancel,
        }
    }
}

/// Concurrent session-id → session store
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        // Entries are inserted or removed whole; a poisoned map is still consistent
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a session. Returns false (and keeps the existing entry) on an id clash
    pub fn insert(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.lock();
        if sessions.contains_key(&session.id) {
            return false;
        }
        sessions.insert(session.id.clone(), session);
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().get(id).cloned()
    }

    /// Remove a session; removing an unknown id is a no-op returning None
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.lock().remove(id)
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Ids of the sessions currently in flight (unordered)
    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Cancel a live session by id; false if it is not registered
    pub fn cancel(&self, id: &str) -> bool {
        match self.get(id) {
            Some(session) => {
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Register a session and return a guard that retires it on drop
    pub fn track(self: &Arc<Self>, session: Arc<Session>) -> Option<SessionGuard> {
        let id = session.id.clone();
        if !self.insert(session) {
            return None;
        }
        Some(SessionGuard {
            registry: Arc::clone(self),
            id,
        })
    }
}

/// Removes its session from the registry when dropped
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: String,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.registry.remove(&self.id).is_some() {
            tracing::trace!(session_id = %self.id, "Session retired");
        }
    }
}
