//! The orchestrator: runs the stages in order and always returns a result.

use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use vaultmind_config::VaultConfig;
use vaultmind_core::agent::AgentRegistry;
use vaultmind_core::event::{EventBus, PipelineEvent};
use vaultmind_core::knowledge::KnowledgeSource;
use vaultmind_core::memory::AgentMemory;
use vaultmind_core::provider::{LlmHandler, Usage};
use vaultmind_core::session::SessionStore;
use vaultmind_core::tool::{ToolExecutor, ToolRegistry};
use vaultmind_memory::{NoopKnowledge, NoopMemory};

use super::intake::IntakeOutput;
use super::{
    ErrorCode, PipelineError, PipelineRequest, PipelineResult, Stage, StageFailure, StageReport,
};
use crate::context::{ContextGuard, PromptAssembler, TokenEstimator};
use crate::lock::{SessionLockGuard, SessionLockManager};

/// Drives INTAKE → CONTEXT → EXECUTE → PERSIST for each request.
///
/// Every collaborator is injected, including the lock manager, so tests
/// and embedders control all shared state.
pub struct Orchestrator {
    pub(super) config: VaultConfig,
    pub(super) locks: Arc<SessionLockManager>,
    pub(super) agents: Arc<dyn AgentRegistry>,
    pub(super) store: Arc<dyn SessionStore>,
    pub(super) memory: Arc<dyn AgentMemory>,
    pub(super) knowledge: Arc<dyn KnowledgeSource>,
    pub(super) llm: Arc<dyn LlmHandler>,
    pub(super) tools: Arc<dyn ToolExecutor>,
    pub(super) events: Arc<EventBus>,
    pub(super) estimator: TokenEstimator,
    pub(super) guard: ContextGuard,
    pub(super) assembler: PromptAssembler,
}

impl Orchestrator {
    /// Create an orchestrator with no working memory, knowledge or tools.
    pub fn new(
        config: VaultConfig,
        locks: Arc<SessionLockManager>,
        agents: Arc<dyn AgentRegistry>,
        store: Arc<dyn SessionStore>,
        llm: Arc<dyn LlmHandler>,
    ) -> Self {
        let estimator = TokenEstimator::new(config.tokens.clone());
        let guard = ContextGuard::from_config(&config.context);
        let assembler = PromptAssembler::new(config.context.budgets.clone(), estimator.clone());
        Self {
            config,
            locks,
            agents,
            store,
            memory: Arc::new(NoopMemory),
            knowledge: Arc::new(NoopKnowledge),
            llm,
            tools: Arc::new(ToolRegistry::new()),
            events: Arc::new(EventBus::default()),
            estimator,
            guard,
            assembler,
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn AgentMemory>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeSource>) -> Self {
        self.knowledge = knowledge;
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<SessionLockManager> {
        &self.locks
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Run one request through the pipeline. Never panics and never returns `Err`.
    pub async fn run(&self, request: PipelineRequest) -> PipelineResult {
        let mut stages = Vec::with_capacity(4);

        let started = Instant::now();
        let intake = self.intake(&request).await;
        let intake_ms = elapsed_ms(started);
        let intake = match intake {
            Ok(intake) => {
                stages.push(report(Stage::Intake, intake_ms, true));
                intake
            }
            Err(e) => {
                warn!(code = %e.code(), error = %e, "Intake rejected request");
                stages.push(report(Stage::Intake, intake_ms, false));
                let result = failure(e.into(), None, None, Usage::default(), stages);
                self.publish_finished("", &result);
                return result;
            }
        };

        self.events.publish(PipelineEvent::RunStarted {
            run_id: intake.run_id.clone(),
            session_id: intake.session_id.clone(),
            agent_id: intake.agent.id.clone(),
            timestamp: Utc::now(),
        });

        let span = info_span!(
            "pipeline",
            run_id = %intake.run_id,
            session_id = %intake.session_id,
            agent_id = %intake.agent.id,
        );
        let cancel = request.cancel.clone().unwrap_or_default();
        let mut lock_guard = SessionLockGuard::new(
            self.locks.clone(),
            intake.session_id.clone(),
            intake.run_id.clone(),
        );
        let guarded = AssertUnwindSafe(
            self.run_locked(&request, &intake, &cancel, &mut stages)
                .instrument(span),
        )
        .catch_unwind()
        .await;

        let result = match guarded {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic_message(&*panic);
                let released = self.locks.release(&intake.session_id, &intake.run_id);
                error!(
                    run_id = %intake.run_id,
                    session_id = %intake.session_id,
                    released,
                    panic = %detail,
                    "Pipeline panicked after intake"
                );
                failure(
                    PipelineError::new(ErrorCode::InternalError, format!("Internal error: {detail}")),
                    Some(&intake),
                    None,
                    Usage::default(),
                    stages,
                )
            }
        };

        // Every path above released the lock explicitly.
        lock_guard.disarm();
        self.publish_finished(&intake.run_id, &result);
        result
    }

    /// Everything after INTAKE. Every exit path releases the lock exactly once;
    /// if this future is dropped instead, the guard in [`run`](Self::run) does.
    async fn run_locked(
        &self,
        request: &PipelineRequest,
        intake: &IntakeOutput,
        cancel: &CancellationToken,
        stages: &mut Vec<StageReport>,
    ) -> PipelineResult {
        let message = request.message.trim();

        let started = Instant::now();
        let context = self.context(intake, message).await;
        let ok = context.is_ok();
        self.stage_done(intake, Stage::Context, started, ok, stages);
        let context = match context {
            Ok(context) => context,
            Err(f) => return self.abandon(intake, f, Usage::default(), stages),
        };

        let started = Instant::now();
        let executed = self.execute(intake, &context, message, cancel).await;
        let ok = matches!(&executed, Ok(out) if !out.aborted);
        self.stage_done(intake, Stage::Execute, started, ok, stages);
        let executed = match executed {
            Ok(executed) => executed,
            Err(f) => return self.abandon(intake, f, Usage::default(), stages),
        };

        let started = Instant::now();
        let persisted = self
            .persist(
                intake,
                &context.history,
                message,
                &executed.response,
                context.needs_flush,
            )
            .await;
        let critical = persisted.has_critical();
        self.stage_done(intake, Stage::Persist, started, !critical, stages);

        let stages = std::mem::take(stages);
        if executed.aborted {
            info!(partial_chars = executed.response.len(), "Run aborted");
            return failure(
                PipelineError::new(ErrorCode::Aborted, "Execution was cancelled"),
                Some(intake),
                None,
                executed.usage,
                stages,
            );
        }

        if critical {
            return failure(
                PipelineError::new(ErrorCode::PersistFailed, persisted.critical_message()),
                Some(intake),
                Some(executed.response),
                executed.usage,
                stages,
            );
        }

        info!(
            input_tokens = executed.usage.input_tokens,
            output_tokens = executed.usage.output_tokens,
            iterations = executed.iterations,
            tool_calls = executed.tool_calls,
            "Run complete"
        );
        PipelineResult {
            success: true,
            response: Some(executed.response),
            session_id: Some(intake.session_id.clone()),
            run_id: Some(intake.run_id.clone()),
            usage: executed.usage,
            error: None,
            stages,
        }
    }

    /// Release the lock and turn a stage failure into a result.
    fn abandon(
        &self,
        intake: &IntakeOutput,
        f: StageFailure,
        usage: Usage,
        stages: &mut Vec<StageReport>,
    ) -> PipelineResult {
        if !self.locks.release(&intake.session_id, &intake.run_id) {
            warn!("Session lock was no longer held when abandoning the run");
        }
        warn!(code = %f.code, error = %f.message, "Run failed");
        failure(f.into(), Some(intake), None, usage, std::mem::take(stages))
    }

    fn stage_done(
        &self,
        intake: &IntakeOutput,
        stage: Stage,
        started: Instant,
        ok: bool,
        stages: &mut Vec<StageReport>,
    ) {
        let duration_ms = elapsed_ms(started);
        stages.push(report(stage, duration_ms, ok));
        self.events.publish(PipelineEvent::StageCompleted {
            run_id: intake.run_id.clone(),
            stage: stage.as_str().to_string(),
            ok,
            duration_ms,
        });
    }

    fn publish_finished(&self, run_id: &str, result: &PipelineResult) {
        self.events.publish(PipelineEvent::RunFinished {
            run_id: run_id.to_string(),
            success: result.success,
            error_code: result.error_code().map(|c| c.as_str().to_string()),
            timestamp: Utc::now(),
        });
    }
}

fn report(stage: Stage, duration_ms: u64, ok: bool) -> StageReport {
    StageReport {
        stage,
        duration_ms,
        ok,
    }
}

fn failure(
    error: PipelineError,
    intake: Option<&IntakeOutput>,
    response: Option<String>,
    usage: Usage,
    stages: Vec<StageReport>,
) -> PipelineResult {
    PipelineResult {
        success: false,
        response,
        session_id: intake.map(|i| i.session_id.clone()),
        run_id: intake.map(|i| i.run_id.clone()),
        usage,
        error: Some(error),
        stages,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
