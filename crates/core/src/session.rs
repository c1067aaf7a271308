//! Session domain types and the session store contract.
//!
//! A session is one ongoing conversation thread with a single agent and the
//! unit of lock granularity in the engine. Its status only ever moves
//! forward: `active → completed` or `active → abandoned`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::message::TranscriptMessage;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
        }
    }

    /// Whether the session has ended and can no longer accept turns.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }

    /// Only `active → completed` and `active → abandoned` are legal.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (SessionStatus::Active, SessionStatus::Completed)
                | (SessionStatus::Active, SessionStatus::Abandoned)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One conversation thread between a user and an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID
    pub id: String,

    /// The agent this session belongs to
    pub agent_id: String,

    /// Lifecycle status
    pub status: SessionStatus,

    /// Optional title (user-set or generated)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Free-form tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Number of transcript messages persisted so far
    #[serde(default)]
    pub message_count: usize,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set when the session leaves the active state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a new active session for an agent.
    pub fn new(agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            status: SessionStatus::Active,
            title: None,
            tags: Vec::new(),
            message_count: 0,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    /// Move the session to a new status, enforcing the forward-only invariant.
    pub fn transition(&mut self, next: SessionStatus) -> Result<(), StoreError> {
        if !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                session_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        self.ended_at = Some(now);
        Ok(())
    }

    /// Check that `next` may replace this stored record.
    ///
    /// Metadata may change freely; the status may only stay the same or
    /// move forward. A stale copy can never reopen an ended session.
    pub fn check_update(&self, next: &Session) -> Result<(), StoreError> {
        if self.status == next.status || self.status.can_transition_to(next.status) {
            return Ok(());
        }
        Err(StoreError::InvalidTransition {
            session_id: self.id.clone(),
            from: self.status.to_string(),
            to: next.status.to_string(),
        })
    }

    /// Record that `count` messages were appended to the transcript.
    pub fn record_messages(&mut self, count: usize) {
        self.message_count += count;
        self.updated_at = Utc::now();
    }
}

/// Durable storage for sessions and their append-only transcripts.
///
/// Implementations: in-memory (tests, ephemeral), JSON/JSONL files.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The backend name (e.g., "in_memory", "file").
    fn name(&self) -> &str;

    /// Create and persist a new active session for an agent.
    async fn create_session(&self, agent_id: &str) -> Result<Session, StoreError>;

    /// Look up a session by id.
    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError>;

    /// Return the agent's most recently updated active session, creating one if none exists.
    async fn get_or_create_session(&self, agent_id: &str) -> Result<Session, StoreError>;

    /// Overwrite the stored metadata of an existing session.
    async fn update_session(&self, session: &Session) -> Result<(), StoreError>;

    /// End a session with a terminal status.
    async fn end_session(&self, id: &str, status: SessionStatus) -> Result<Session, StoreError>;

    /// Append one message to the session transcript.
    async fn append_to_transcript(
        &self,
        session_id: &str,
        message: &TranscriptMessage,
    ) -> Result<(), StoreError>;

    /// Read the whole transcript in chronological order.
    async fn read_transcript(&self, session_id: &str) -> Result<Vec<TranscriptMessage>, StoreError>;

    /// Read the last `limit` transcript messages in chronological order.
    async fn get_recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<TranscriptMessage>, StoreError> {
        let mut all = self.read_transcript(session_id).await?;
        let skip = all.len().saturating_sub(limit);
        Ok(all.split_off(skip))
    }
}
