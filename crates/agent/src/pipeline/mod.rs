//! The four-stage execution pipeline: INTAKE → CONTEXT → EXECUTE → PERSIST.
//!
//! INTAKE is the only stage that fails through `Err`; it runs before any lock
//! is held. Every later stage reports failure as data the orchestrator
//! matches on, so releasing the session lock never depends on unwinding.

mod context;
mod execute;
mod intake;
mod orchestrator;
mod persist;

pub use context::ContextOutput;
pub use execute::ExecuteOutput;
pub use intake::{IntakeError, IntakeOutput};
pub use orchestrator::Orchestrator;
pub use persist::{PersistIssue, PersistOutput};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use vaultmind_core::provider::Usage;

/// One user turn handed to the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    pub message: String,
    /// Explicit path to an agent definition (file or directory).
    pub agent_path: Option<PathBuf>,
    /// Project whose directory holds the agent definition.
    pub project: Option<String>,
    /// Agent id looked up among discovered agents.
    pub agent_id: Option<String>,
    /// Resume this session instead of the agent's current one.
    pub session_id: Option<String>,
    pub force_new_session: bool,
    /// Observed during EXECUTE only.
    pub cancel: Option<CancellationToken>,
}

impl PipelineRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_agent_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.agent_path = Some(path.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn force_new_session(mut self) -> Self {
        self.force_new_session = true;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Caller-facing failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    AgentNotFound,
    AgentInvalid,
    SessionNotFound,
    SessionTerminated,
    LockTimeout,
    LockFailed,
    ContextOverflow,
    ExecutionFailed,
    Aborted,
    PersistFailed,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::AgentNotFound => "AGENT_NOT_FOUND",
            ErrorCode::AgentInvalid => "AGENT_INVALID",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::SessionTerminated => "SESSION_TERMINATED",
            ErrorCode::LockTimeout => "LOCK_TIMEOUT",
            ErrorCode::LockFailed => "LOCK_FAILED",
            ErrorCode::ContextOverflow => "CONTEXT_OVERFLOW",
            ErrorCode::ExecutionFailed => "EXECUTION_FAILED",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::PersistFailed => "PERSIST_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::ValidationError | ErrorCode::AgentInvalid => 400,
            ErrorCode::AgentNotFound | ErrorCode::SessionNotFound => 404,
            ErrorCode::SessionTerminated => 410,
            ErrorCode::ContextOverflow => 413,
            ErrorCode::Aborted => 499,
            ErrorCode::LockFailed | ErrorCode::InternalError | ErrorCode::PersistFailed => 500,
            ErrorCode::ExecutionFailed => 502,
            ErrorCode::LockTimeout => 503,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineError {
    pub code: ErrorCode,
    pub message: String,
    pub http_status: u16,
}

impl PipelineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            http_status: code.http_status(),
        }
    }
}

/// Failure of a post-INTAKE stage, returned as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl StageFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<StageFailure> for PipelineError {
    fn from(f: StageFailure) -> Self {
        PipelineError::new(f.code, f.message)
    }
}

pub type StageResult<T> = std::result::Result<T, StageFailure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Intake,
    Context,
    Execute,
    Persist,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Context => "context",
            Stage::Execute => "execute",
            Stage::Persist => "persist",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub stage: Stage,
    pub duration_ms: u64,
    pub ok: bool,
}

/// The structured outcome of one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub success: bool,
    /// Present on success and on PERSIST_FAILED.
    pub response: Option<String>,
    pub session_id: Option<String>,
    pub run_id: Option<String>,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PipelineError>,
    pub stages: Vec<StageReport>,
}

impl PipelineResult {
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    pub fn http_status(&self) -> u16 {
        self.error.as_ref().map_or(200, |e| e.http_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ErrorCode::ValidationError.http_status(), 400);
        assert_eq!(ErrorCode::AgentInvalid.http_status(), 400);
        assert_eq!(ErrorCode::AgentNotFound.http_status(), 404);
        assert_eq!(ErrorCode::SessionNotFound.http_status(), 404);
        assert_eq!(ErrorCode::SessionTerminated.http_status(), 410);
        assert_eq!(ErrorCode::LockTimeout.http_status(), 503);
        assert_eq!(ErrorCode::LockFailed.http_status(), 500);
        assert_eq!(ErrorCode::InternalError.http_status(), 500);
        assert_eq!(ErrorCode::PersistFailed.http_status(), 500);
        assert_eq!(ErrorCode::Aborted.http_status(), 499);
    }

    #[test]
    fn codes_serialize_screaming() {
        let json = serde_json::to_string(&ErrorCode::SessionTerminated).unwrap();
        assert_eq!(json, "\"SESSION_TERMINATED\"");
        for code in [ErrorCode::LockTimeout, ErrorCode::PersistFailed, ErrorCode::Aborted] {
            assert_eq!(serde_json::to_string(&code).unwrap(), format!("\"{code}\""));
        }
    }

    #[test]
    fn pipeline_error_carries_status() {
        let err: PipelineError = StageFailure::new(ErrorCode::ContextOverflow, "too big").into();
        assert_eq!(err.http_status, 413);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["httpStatus"], 413);
        assert_eq!(json["code"], "CONTEXT_OVERFLOW");
    }
}
