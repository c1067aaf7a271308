//! File-based session store: JSON session files plus JSONL transcripts.
//!
//! Layout under the store root:
//!
//! ```text
//! sessions/<session-id>.json       session metadata, rewritten on update
//! transcripts/<session-id>.jsonl   one TranscriptMessage per line, append-only
//! ```
//!
//! Everything is human-inspectable. A transcript line that fails to parse is
//! skipped with a warning instead of failing the whole read.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use vaultmind_core::error::StoreError;
use vaultmind_core::message::TranscriptMessage;
use vaultmind_core::session::{Session, SessionStatus, SessionStore};

pub struct FileSessionStore {
    sessions_dir: PathBuf,
    transcripts_dir: PathBuf,
    /// Serializes metadata writes so get-or-create is atomic in-process.
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        let sessions_dir = root.join("sessions");
        let transcripts_dir = root.join("transcripts");
        for dir in [&sessions_dir, &transcripts_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                StoreError::Storage(format!("Failed to create {}: {e}", dir.display()))
            })?;
        }
        debug!(root = %root.display(), "File session store opened");
        Ok(Self {
            sessions_dir,
            transcripts_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{id}.json"))
    }

    fn transcript_path(&self, id: &str) -> PathBuf {
        self.transcripts_dir.join(format!("{id}.jsonl"))
    }

    async fn write_session(&self, session: &Session) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(session)
            .map_err(|e| StoreError::Storage(format!("Failed to serialize session: {e}")))?;
        let path = self.session_path(&session.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to write session file: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to replace session file: {e}")))?;
        Ok(())
    }

    async fn read_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        if !is_safe_id(id) {
            return Ok(None);
        }
        let path = self.session_path(id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Storage(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        serde_json::from_str(&data)
            .map(Some)
            .map_err(|e| StoreError::Corrupted(format!("{}: {e}", path.display())))
    }

    /// All parseable sessions on disk. Unreadable files are skipped.
    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.sessions_dir)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to list sessions: {e}")))?;
        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?
        {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match self.read_session(id).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Skipping unreadable session file"),
            }
        }
        Ok(sessions)
    }
}

/// Session ids become file names; refuse anything that could escape the store.
fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl SessionStore for FileSessionStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn create_session(&self, agent_id: &str) -> Result<Session, StoreError> {
        let _guard = self.write_lock.lock().await;
        let session = Session::new(agent_id);
        self.write_session(&session).await?;
        debug!(session_id = %session.id, agent_id, "Session created");
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.read_session(id).await
    }

    async fn get_or_create_session(&self, agent_id: &str) -> Result<Session, StoreError> {
        let _guard = self.write_lock.lock().await;
        let existing = self
            .list_sessions()
            .await?
            .into_iter()
            .filter(|s| s.agent_id == agent_id && s.status == SessionStatus::Active)
            .max_by_key(|s| s.updated_at);
        if let Some(session) = existing {
            return Ok(session);
        }

        let session = Session::new(agent_id);
        self.write_session(&session).await?;
        debug!(session_id = %session.id, agent_id, "Session created");
        Ok(session)
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let stored = self
            .read_session(&session.id)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(session.id.clone()))?;
        stored.check_update(session)?;
        self.write_session(session).await
    }

    async fn end_session(&self, id: &str, status: SessionStatus) -> Result<Session, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut session = self
            .read_session(id)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
        session.transition(status)?;
        self.write_session(&session).await?;
        Ok(session)
    }

    async fn append_to_transcript(
        &self,
        session_id: &str,
        message: &TranscriptMessage,
    ) -> Result<(), StoreError> {
        if !is_safe_id(session_id) || !self.session_path(session_id).exists() {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }

        let mut line = serde_json::to_string(message)
            .map_err(|e| StoreError::Storage(format!("Failed to serialize message: {e}")))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.transcript_path(session_id))
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open transcript: {e}")))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to append transcript: {e}")))?;
        file.flush()
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to flush transcript: {e}")))?;
        Ok(())
    }

    async fn read_transcript(&self, session_id: &str) -> Result<Vec<TranscriptMessage>, StoreError> {
        if !is_safe_id(session_id) {
            return Ok(Vec::new());
        }
        let path = self.transcript_path(session_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Storage(format!("Failed to read transcript: {e}"))),
        };

        Ok(data
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<TranscriptMessage>(line) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(session_id, error = %e, "Skipping corrupted transcript line");
                    None
                }
            })
            .collect())
    }
}
