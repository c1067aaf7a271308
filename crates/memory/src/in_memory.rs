//! In-memory session store, useful for testing and ephemeral sessions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use vaultmind_core::error::StoreError;
use vaultmind_core::message::TranscriptMessage;
use vaultmind_core::session::{Session, SessionStatus, SessionStore};

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    transcripts: HashMap<String, Vec<TranscriptMessage>>,
}

/// A session store that keeps everything in process memory.
/// Useful for tests and runs where persistence isn't needed.
pub struct InMemorySessionStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    /// Number of sessions held, in any status.
    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create_session(&self, agent_id: &str) -> Result<Session, StoreError> {
        let session = Session::new(agent_id);
        let mut inner = self.inner.write().await;
        inner.sessions.insert(session.id.clone(), session.clone());
        inner.transcripts.insert(session.id.clone(), Vec::new());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.inner.read().await.sessions.get(id).cloned())
    }

    async fn get_or_create_session(&self, agent_id: &str) -> Result<Session, StoreError> {
        // Held across lookup and insert so two callers can't both create.
        let mut inner = self.inner.write().await;
        let existing = inner
            .sessions
            .values()
            .filter(|s| s.agent_id == agent_id && s.status == SessionStatus::Active)
            .max_by_key(|s| s.updated_at)
            .cloned();
        if let Some(session) = existing {
            return Ok(session);
        }

        let session = Session::new(agent_id);
        inner.sessions.insert(session.id.clone(), session.clone());
        inner.transcripts.insert(session.id.clone(), Vec::new());
        Ok(session)
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(&session.id) {
            Some(stored) => {
                stored.check_update(session)?;
                *stored = session.clone();
                Ok(())
            }
            None => Err(StoreError::SessionNotFound(session.id.clone())),
        }
    }

    async fn end_session(&self, id: &str, status: SessionStatus) -> Result<Session, StoreError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
        session.transition(status)?;
        Ok(session.clone())
    }

    async fn append_to_transcript(
        &self,
        session_id: &str,
        message: &TranscriptMessage,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.sessions.contains_key(session_id) {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        inner
            .transcripts
            .entry(session_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn read_transcript(&self, session_id: &str) -> Result<Vec<TranscriptMessage>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .transcripts
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}
