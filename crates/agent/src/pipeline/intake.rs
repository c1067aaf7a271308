//! INTAKE: validate the message, resolve agent and session, take the lock.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vaultmind_core::agent::{AgentDef, AgentValidation};
use vaultmind_core::session::Session;

use super::orchestrator::Orchestrator;
use super::{ErrorCode, PipelineError, PipelineRequest};
use crate::lock::{LockError, SessionLock};

#[derive(Debug, Clone)]
pub struct IntakeOutput {
    pub run_id: String,
    pub session_id: String,
    pub session: Session,
    pub agent: AgentDef,
    pub agent_path: PathBuf,
    pub lock: SessionLock,
}

/// Typed failures of INTAKE. No lock is held when one is returned.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IntakeError {
    #[error("{0}")]
    Validation(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent definition at {path} is invalid: {}", reasons.join("; "))]
    AgentInvalid { path: PathBuf, reasons: Vec<String> },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {session_id} is {status} and cannot accept new messages")]
    SessionTerminated { session_id: String, status: String },

    #[error("{0}")]
    LockTimeout(LockError),

    #[error("Failed to acquire session lock: {0}")]
    LockFailed(String),
}

impl IntakeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            IntakeError::Validation(_) => ErrorCode::ValidationError,
            IntakeError::AgentNotFound(_) => ErrorCode::AgentNotFound,
            IntakeError::AgentInvalid { .. } => ErrorCode::AgentInvalid,
            IntakeError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            IntakeError::SessionTerminated { .. } => ErrorCode::SessionTerminated,
            IntakeError::LockTimeout(_) => ErrorCode::LockTimeout,
            IntakeError::LockFailed(_) => ErrorCode::LockFailed,
        }
    }
}

impl From<IntakeError> for PipelineError {
    fn from(e: IntakeError) -> Self {
        PipelineError::new(e.code(), e.to_string())
    }
}

impl Orchestrator {
    pub(super) async fn intake(
        &self,
        request: &PipelineRequest,
    ) -> Result<IntakeOutput, IntakeError> {
        self.validate_message(&request.message)?;
        let agent = self.resolve_agent(request).await?;
        let session = self.resolve_session(request, &agent).await?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let outcome = self.locks.acquire(&session.id, Some(run_id.clone())).await;
        let lock = match (outcome.lock, outcome.error) {
            (Some(lock), _) if outcome.success => lock,
            (_, Some(e @ (LockError::Timeout { .. } | LockError::Contended))) => {
                return Err(IntakeError::LockTimeout(e));
            }
            (_, Some(e)) => return Err(IntakeError::LockFailed(e.to_string())),
            (_, None) => return Err(IntakeError::LockFailed("no lock returned".into())),
        };

        debug!(
            run_id = %run_id,
            session_id = %session.id,
            agent_id = %agent.id,
            waited_ms = outcome.waited_ms,
            "Intake complete"
        );

        Ok(IntakeOutput {
            run_id,
            session_id: session.id.clone(),
            agent_path: agent.path.clone(),
            session,
            agent,
            lock,
        })
    }

    fn validate_message(&self, message: &str) -> Result<(), IntakeError> {
        let len = message.trim().chars().count();
        let limits = &self.config.intake;
        if len < limits.min_length {
            return Err(IntakeError::Validation(format!(
                "Message must be at least {} characters",
                limits.min_length
            )));
        }
        if len > limits.max_length {
            return Err(IntakeError::Validation(format!(
                "Message is {len} characters; the limit is {}",
                limits.max_length
            )));
        }
        Ok(())
    }

    /// Explicit path, then project path, then id lookup, then the default agent.
    async fn resolve_agent(&self, request: &PipelineRequest) -> Result<AgentDef, IntakeError> {
        let vault = &self.config.vault;

        if let Some(path) = &request.agent_path {
            return self.load_agent_at(path).await;
        }
        if let Some(project) = &request.project {
            return self.load_agent_at(&vault.project_agent_path(project)).await;
        }

        let wanted = request
            .agent_id
            .as_deref()
            .unwrap_or(&vault.default_agent_id);
        let discovered = self.agents.discover_agents(&vault.agents_root()).await;
        match discovered.into_iter().find(|a| a.id() == Some(wanted)) {
            Some(validation) => accept(validation),
            None => Err(IntakeError::AgentNotFound(wanted.to_string())),
        }
    }

    async fn load_agent_at(&self, path: &Path) -> Result<AgentDef, IntakeError> {
        match self.agents.load_agent_definition(path).await {
            Some(validation) => accept(validation),
            None => Err(IntakeError::AgentNotFound(path.display().to_string())),
        }
    }

    async fn resolve_session(
        &self,
        request: &PipelineRequest,
        agent: &AgentDef,
    ) -> Result<Session, IntakeError> {
        if request.force_new_session {
            return self
                .store
                .create_session(&agent.id)
                .await
                .map_err(|e| IntakeError::SessionNotFound(format!("could not create session: {e}")));
        }

        if let Some(id) = &request.session_id {
            let session = self
                .store
                .get_session(id)
                .await
                .map_err(|e| IntakeError::SessionNotFound(format!("{id}: {e}")))?
                .ok_or_else(|| IntakeError::SessionNotFound(id.clone()))?;
            if session.status.is_terminal() {
                return Err(IntakeError::SessionTerminated {
                    session_id: session.id,
                    status: session.status.to_string(),
                });
            }
            if session.agent_id != agent.id {
                warn!(
                    session_id = %session.id,
                    session_agent = %session.agent_id,
                    agent_id = %agent.id,
                    "Resuming a session that belongs to another agent"
                );
            }
            return Ok(session);
        }

        self.store
            .get_or_create_session(&agent.id)
            .await
            .map_err(|e| IntakeError::SessionNotFound(format!("no session for {}: {e}", agent.id)))
    }
}

fn accept(validation: AgentValidation) -> Result<AgentDef, IntakeError> {
    match validation {
        AgentValidation::Valid(def) => Ok(def),
        AgentValidation::Invalid { path, reasons, .. } => {
            Err(IntakeError::AgentInvalid { path, reasons })
        }
    }
}
