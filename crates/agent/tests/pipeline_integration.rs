//! End-to-end tests for the turn pipeline.
//!
//! Every test builds a throwaway vault on disk, wires the real agent
//! registry and session store to a scripted LLM handler, and drives
//! `Orchestrator::run` the way an embedding application would.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use vaultmind_agent::{ErrorCode, Orchestrator, PipelineRequest, SessionLockManager, Stage};
use vaultmind_config::VaultConfig;
use vaultmind_core::error::{ProviderError, StoreError, ToolError};
use vaultmind_core::{
    FsAgentRegistry, LlmHandler, LlmRequest, LlmResponse, PipelineEvent, Role, Session,
    SessionStatus, SessionStore, Tool, ToolCall, ToolRegistry, TranscriptMessage, Usage,
};
use vaultmind_memory::{InMemorySessionStore, VaultAgentMemory};

// ── Mock LLM handlers ──────────────────────────────────────────────────

/// Returns pre-configured responses in order and records every request.
struct ScriptedLlm {
    responses: Mutex<Vec<LlmResponse>>,
    requests: Mutex<Vec<LlmRequest>>,
    call_count: AtomicUsize,
}

impl ScriptedLlm {
    fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    fn replying(text: &str) -> Self {
        Self::new(vec![LlmResponse::text(text, Usage::new(20, 5))])
    }

    fn calls(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    fn request(&self, index: usize) -> LlmRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl LlmHandler for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        request: LlmRequest,
        _cancel: CancellationToken,
    ) -> Result<LlmResponse, ProviderError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            panic!("ScriptedLlm: no more responses");
        }
        Ok(responses.remove(0))
    }
}

/// Always fails, like a provider returning 500.
struct FailingLlm;

#[async_trait]
impl LlmHandler for FailingLlm {
    fn name(&self) -> &str {
        "failing"
    }

    async fn complete(
        &self,
        _request: LlmRequest,
        _cancel: CancellationToken,
    ) -> Result<LlmResponse, ProviderError> {
        Err(ProviderError::ApiError {
            status_code: 500,
            message: "upstream exploded".into(),
        })
    }
}

/// Panics inside the call.
struct PanickingLlm;

#[async_trait]
impl LlmHandler for PanickingLlm {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn complete(
        &self,
        _request: LlmRequest,
        _cancel: CancellationToken,
    ) -> Result<LlmResponse, ProviderError> {
        panic!("handler bug");
    }
}

/// Takes `delay` to answer unless cancelled first.
struct SlowLlm {
    delay: Duration,
}

#[async_trait]
impl LlmHandler for SlowLlm {
    fn name(&self) -> &str {
        "slow"
    }

    async fn complete(
        &self,
        _request: LlmRequest,
        cancel: CancellationToken,
    ) -> Result<LlmResponse, ProviderError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ProviderError::Timeout("cancelled".into())),
            _ = tokio::time::sleep(self.delay) => {
                Ok(LlmResponse::text("finally", Usage::new(10, 2)))
            }
        }
    }
}

/// Records how many session locks are held while the call runs.
struct LockProbeLlm {
    locks: Arc<SessionLockManager>,
    held: AtomicUsize,
}

#[async_trait]
impl LlmHandler for LockProbeLlm {
    fn name(&self) -> &str {
        "probe"
    }

    async fn complete(
        &self,
        _request: LlmRequest,
        _cancel: CancellationToken,
    ) -> Result<LlmResponse, ProviderError> {
        self.held
            .store(self.locks.get_active_locks().len(), Ordering::SeqCst);
        Ok(LlmResponse::text("Hi there!", Usage::new(12, 3)))
    }
}

/// Honours cancellation by handing back what it generated so far.
struct InterruptibleLlm;

#[async_trait]
impl LlmHandler for InterruptibleLlm {
    fn name(&self) -> &str {
        "interruptible"
    }

    async fn complete(
        &self,
        _request: LlmRequest,
        cancel: CancellationToken,
    ) -> Result<LlmResponse, ProviderError> {
        cancel.cancelled().await;
        Ok(LlmResponse::text("partial answer so far", Usage::new(7, 3)))
    }
}

/// Ends the running session from outside, then makes session reads fail.
struct SessionEndingLlm {
    store: Arc<FlakyStore>,
}

#[async_trait]
impl LlmHandler for SessionEndingLlm {
    fn name(&self) -> &str {
        "session_ending"
    }

    async fn complete(
        &self,
        _request: LlmRequest,
        _cancel: CancellationToken,
    ) -> Result<LlmResponse, ProviderError> {
        let session = self.store.inner.get_or_create_session("assistant").await.unwrap();
        self.store
            .inner
            .end_session(&session.id, SessionStatus::Completed)
            .await
            .unwrap();
        self.store.fail_get.store(true, Ordering::SeqCst);
        Ok(LlmResponse::text("Goodbye", Usage::new(4, 1)))
    }
}

// ── Mock store ─────────────────────────────────────────────────────────

/// Wraps the in-memory store and fails selected operations on demand.
#[derive(Default)]
struct FlakyStore {
    inner: InMemorySessionStore,
    fail_append: AtomicBool,
    fail_read: AtomicBool,
    fail_get: AtomicBool,
}

#[async_trait]
impl SessionStore for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn create_session(&self, agent_id: &str) -> Result<Session, StoreError> {
        self.inner.create_session(agent_id).await
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("session index unavailable".into()));
        }
        self.inner.get_session(id).await
    }

    async fn get_or_create_session(&self, agent_id: &str) -> Result<Session, StoreError> {
        self.inner.get_or_create_session(agent_id).await
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        self.inner.update_session(session).await
    }

    async fn end_session(&self, id: &str, status: SessionStatus) -> Result<Session, StoreError> {
        self.inner.end_session(id, status).await
    }

    async fn append_to_transcript(
        &self,
        session_id: &str,
        message: &TranscriptMessage,
    ) -> Result<(), StoreError> {
        if self.fail_append.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("disk full".into()));
        }
        self.inner.append_to_transcript(session_id, message).await
    }

    async fn read_transcript(&self, session_id: &str) -> Result<Vec<TranscriptMessage>, StoreError> {
        if self.fail_read.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupted("transcript unreadable".into()));
        }
        self.inner.read_transcript(session_id).await
    }
}

// ── Mock tool ──────────────────────────────────────────────────────────

struct LookupTool;

#[async_trait]
impl Tool for LookupTool {
    fn name(&self) -> &str {
        "note_lookup"
    }

    fn description(&self) -> &str {
        "Look up a note in the vault by title"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "title": { "type": "string" } },
            "required": ["title"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let title = arguments["title"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("missing `title`".into()))?;
        Ok(format!("Contents of {title}: meeting moved to Friday"))
    }
}

// ── Fixtures ───────────────────────────────────────────────────────────

const ASSISTANT: &str =
    "---\nid: assistant\nname: Default Assistant\nscope: vault\n---\n\nYou are the default assistant.\n";

const RESEARCHER: &str =
    "---\nid: researcher\nname: Research Assistant\nscope: projects/thesis\n---\n\nYou track reading notes.\n";

const BROKEN: &str = "---\nid: broken\n---\n\nNo name or scope.\n";

fn write_agent(dir: &Path, content: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("AGENT.md"), content).unwrap();
}

/// A vault with the default assistant, a second agent, a broken agent and a project agent.
fn vault() -> (TempDir, VaultConfig) {
    let tmp = TempDir::new().unwrap();
    let agents = tmp.path().join("agents");
    write_agent(&agents.join("assistant"), ASSISTANT);
    write_agent(&agents.join("researcher"), RESEARCHER);
    write_agent(&agents.join("broken"), BROKEN);
    write_agent(
        &tmp.path().join("projects").join("thesis"),
        "---\nid: thesis\nname: Thesis Helper\nscope: projects/thesis\n---\n\nHelp with the thesis.\n",
    );

    let mut config = VaultConfig::default();
    config.vault.root = tmp.path().to_path_buf();
    (tmp, config)
}

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<FlakyStore>,
    locks: Arc<SessionLockManager>,
}

fn harness(config: VaultConfig, llm: Arc<dyn LlmHandler>) -> Harness {
    let locks = Arc::new(SessionLockManager::new(config.locks.clone()));
    harness_with_locks(config, llm, locks)
}

fn harness_with_locks(
    config: VaultConfig,
    llm: Arc<dyn LlmHandler>,
    locks: Arc<SessionLockManager>,
) -> Harness {
    let store = Arc::new(FlakyStore::default());
    let orchestrator = Orchestrator::new(
        config,
        locks.clone(),
        Arc::new(FsAgentRegistry::new()),
        store.clone(),
        llm,
    );
    Harness {
        orchestrator,
        store,
        locks,
    }
}

fn assert_uuid(id: Option<&String>) {
    let id = id.expect("id present");
    assert!(uuid::Uuid::parse_str(id).is_ok(), "not a uuid: {id}");
}

// ── Happy path ─────────────────────────────────────────────────────────

#[tokio::test]
async fn hello_runs_against_default_agent() {
    let (_tmp, config) = vault();
    let locks = Arc::new(SessionLockManager::new(config.locks.clone()));
    let llm = Arc::new(LockProbeLlm {
        locks: locks.clone(),
        held: AtomicUsize::new(0),
    });
    let h = harness_with_locks(config, llm.clone(), locks);

    let result = h.orchestrator.run(PipelineRequest::new("Hello")).await;

    assert!(result.success, "unexpected error: {:?}", result.error);
    assert_eq!(result.response.as_deref(), Some("Hi there!"));
    assert_eq!(result.http_status(), 200);
    assert_uuid(result.run_id.as_ref());
    assert_uuid(result.session_id.as_ref());
    assert_eq!(result.usage, Usage::new(12, 3));

    // Held during EXECUTE, released afterwards
    assert_eq!(llm.held.load(Ordering::SeqCst), 1);
    assert!(h.locks.get_active_locks().is_empty());

    let stages: Vec<Stage> = result.stages.iter().map(|s| s.stage).collect();
    assert_eq!(
        stages,
        vec![Stage::Intake, Stage::Context, Stage::Execute, Stage::Persist]
    );
    assert!(result.stages.iter().all(|s| s.ok));

    let session_id = result.session_id.unwrap();
    let transcript = h.store.read_transcript(&session_id).await.unwrap();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[0].content, "Hello");
    assert_eq!(transcript[1].role, Role::Assistant);
    assert_eq!(transcript[1].content, "Hi there!");

    let session = h.store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.agent_id, "assistant");
    assert_eq!(session.message_count, 2);
}

#[tokio::test]
async fn second_run_resumes_session_and_sees_history() {
    let (_tmp, config) = vault();
    let llm = Arc::new(ScriptedLlm::new(vec![
        LlmResponse::text("First answer", Usage::new(5, 2)),
        LlmResponse::text("Second answer", Usage::new(9, 2)),
    ]));
    let h = harness(config, llm.clone());

    let first = h.orchestrator.run(PipelineRequest::new("First question")).await;
    let second = h.orchestrator.run(PipelineRequest::new("Follow up")).await;

    assert!(first.success && second.success);
    assert_eq!(first.session_id, second.session_id);
    assert_ne!(first.run_id, second.run_id);

    let request = llm.request(1);
    let contents: Vec<&str> = request.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["First question", "First answer", "Follow up"]);
    assert!(request.system_prompt.contains("You are the default assistant."));
    assert_eq!(request.agent_id, "assistant");
}

#[tokio::test]
async fn force_new_session_starts_fresh() {
    let (_tmp, config) = vault();
    let llm = Arc::new(ScriptedLlm::new(vec![
        LlmResponse::text("one", Usage::default()),
        LlmResponse::text("two", Usage::default()),
    ]));
    let h = harness(config, llm.clone());

    let first = h.orchestrator.run(PipelineRequest::new("Hi")).await;
    let second = h
        .orchestrator
        .run(PipelineRequest::new("Hi again").force_new_session())
        .await;

    assert!(first.success && second.success);
    assert_ne!(first.session_id, second.session_id);
    assert!(llm.request(1).messages.len() == 1);
}

#[tokio::test]
async fn explicit_session_id_is_resumed() {
    let (_tmp, config) = vault();
    let h = harness(config, Arc::new(ScriptedLlm::replying("ok")));
    let session = h.store.create_session("assistant").await.unwrap();

    let result = h
        .orchestrator
        .run(PipelineRequest::new("Continue").with_session_id(&session.id))
        .await;

    assert!(result.success);
    assert_eq!(result.session_id.as_deref(), Some(session.id.as_str()));
}

// ── Agent resolution ───────────────────────────────────────────────────

#[tokio::test]
async fn agent_resolved_by_id() {
    let (_tmp, config) = vault();
    let llm = Arc::new(ScriptedLlm::replying("noted"));
    let h = harness(config, llm.clone());

    let result = h
        .orchestrator
        .run(PipelineRequest::new("Summarize my notes").with_agent_id("researcher"))
        .await;

    assert!(result.success);
    let request = llm.request(0);
    assert_eq!(request.agent_id, "researcher");
    assert!(request.system_prompt.contains("You track reading notes."));
}

#[tokio::test]
async fn agent_resolved_by_project_and_path() {
    let (tmp, config) = vault();
    let llm = Arc::new(ScriptedLlm::new(vec![
        LlmResponse::text("a", Usage::default()),
        LlmResponse::text("b", Usage::default()),
    ]));
    let h = harness(config, llm.clone());

    let by_project = h
        .orchestrator
        .run(PipelineRequest::new("Outline chapter 2").with_project("thesis"))
        .await;
    assert!(by_project.success);
    assert_eq!(llm.request(0).agent_id, "thesis");

    let by_path = h
        .orchestrator
        .run(
            PipelineRequest::new("Find the paper")
                .with_agent_path(tmp.path().join("agents").join("researcher")),
        )
        .await;
    assert!(by_path.success);
    assert_eq!(llm.request(1).agent_id, "researcher");
}

#[tokio::test]
async fn unknown_agent_is_not_found() {
    let (_tmp, config) = vault();
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let h = harness(config, llm.clone());

    let result = h
        .orchestrator
        .run(PipelineRequest::new("Hello").with_agent_id("ghost"))
        .await;

    assert!(!result.success);
    assert_eq!(result.error_code(), Some(ErrorCode::AgentNotFound));
    assert_eq!(result.http_status(), 404);
    assert!(result.session_id.is_none());
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn invalid_agent_is_rejected() {
    let (_tmp, config) = vault();
    let h = harness(config, Arc::new(ScriptedLlm::new(vec![])));

    let result = h
        .orchestrator
        .run(PipelineRequest::new("Hello").with_agent_id("broken"))
        .await;

    assert_eq!(result.error_code(), Some(ErrorCode::AgentInvalid));
    assert_eq!(result.http_status(), 400);
    let message = &result.error.unwrap().message;
    assert!(message.contains("name"), "{message}");
    assert!(h.locks.get_active_locks().is_empty());
}

// ── Intake rejections ──────────────────────────────────────────────────

#[tokio::test]
async fn completed_session_is_terminated() {
    let (_tmp, config) = vault();
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let h = harness(config, llm.clone());
    let session = h.store.create_session("assistant").await.unwrap();
    h.store
        .end_session(&session.id, SessionStatus::Completed)
        .await
        .unwrap();

    let result = h
        .orchestrator
        .run(PipelineRequest::new("Anyone there?").with_session_id(&session.id))
        .await;

    assert!(!result.success);
    assert_eq!(result.error_code(), Some(ErrorCode::SessionTerminated));
    assert_eq!(result.http_status(), 410);
    assert!(h.locks.get_active_locks().is_empty());
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn missing_session_is_not_found() {
    let (_tmp, config) = vault();
    let h = harness(config, Arc::new(ScriptedLlm::new(vec![])));

    let result = h
        .orchestrator
        .run(PipelineRequest::new("Hello").with_session_id("does-not-exist"))
        .await;

    assert_eq!(result.error_code(), Some(ErrorCode::SessionNotFound));
    assert_eq!(result.http_status(), 404);
}

#[tokio::test]
async fn oversized_message_fails_validation_without_locking() {
    let (_tmp, config) = vault();
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let h = harness(config, llm.clone());

    let result = h
        .orchestrator
        .run(PipelineRequest::new("a".repeat(100_001)))
        .await;

    assert_eq!(result.error_code(), Some(ErrorCode::ValidationError));
    assert_eq!(result.http_status(), 400);
    assert!(result.run_id.is_none());
    assert!(h.locks.get_active_locks().is_empty());
    assert_eq!(h.store.inner.session_count().await, 0);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn blank_message_fails_validation() {
    let (_tmp, config) = vault();
    let h = harness(config, Arc::new(ScriptedLlm::new(vec![])));

    let result = h.orchestrator.run(PipelineRequest::new("   \n\t")).await;

    assert_eq!(result.error_code(), Some(ErrorCode::ValidationError));
}

#[tokio::test]
async fn message_at_the_limit_is_accepted() {
    let (_tmp, mut config) = vault();
    config.intake.max_length = 10;
    let h = harness(config, Arc::new(ScriptedLlm::replying("ok")));

    let result = h.orchestrator.run(PipelineRequest::new("  abcdefghij  ")).await;

    assert!(result.success, "{:?}", result.error);
}

#[tokio::test]
async fn concurrent_run_on_busy_session_times_out() {
    let (_tmp, mut config) = vault();
    config.locks.acquire_timeout_ms = 50;
    let h = harness(
        config,
        Arc::new(SlowLlm {
            delay: Duration::from_millis(300),
        }),
    );

    let first = h.orchestrator.run(PipelineRequest::new("Long task"));
    let second = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.orchestrator.run(PipelineRequest::new("Impatient")).await
    };
    let (first, second) = tokio::join!(first, second);

    assert!(first.success, "{:?}", first.error);
    assert_eq!(second.error_code(), Some(ErrorCode::LockTimeout));
    assert_eq!(second.http_status(), 503);
    assert!(h.locks.get_active_locks().is_empty());

    let transcript = h
        .store
        .read_transcript(first.session_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(transcript.len(), 2);
}

// ── Failures after the lock is taken ───────────────────────────────────

#[tokio::test]
async fn transcript_read_failure_releases_lock() {
    let (_tmp, config) = vault();
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let h = harness(config, llm.clone());
    h.store.fail_read.store(true, Ordering::SeqCst);

    let result = h.orchestrator.run(PipelineRequest::new("Hello")).await;

    assert_eq!(result.error_code(), Some(ErrorCode::InternalError));
    assert_eq!(result.http_status(), 500);
    assert!(result.session_id.is_some());
    assert!(h.locks.get_active_locks().is_empty());
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn context_overflow_releases_lock() {
    let (_tmp, mut config) = vault();
    config.context.context_window = 50;
    config.context.reserve_tokens = 10;
    let llm = Arc::new(ScriptedLlm::new(vec![]));
    let h = harness(config, llm.clone());

    let message = "please summarize everything I wrote this week ".repeat(10);
    let result = h.orchestrator.run(PipelineRequest::new(message)).await;

    assert_eq!(result.error_code(), Some(ErrorCode::ContextOverflow));
    assert_eq!(result.http_status(), 413);
    assert!(h.locks.get_active_locks().is_empty());
    assert_eq!(llm.calls(), 0);

    let failed = result.stages.iter().find(|s| s.stage == Stage::Context).unwrap();
    assert!(!failed.ok);
}

#[tokio::test]
async fn llm_failure_releases_lock_and_persists_nothing() {
    let (_tmp, config) = vault();
    let h = harness(config, Arc::new(FailingLlm));

    let result = h.orchestrator.run(PipelineRequest::new("Hello")).await;

    assert_eq!(result.error_code(), Some(ErrorCode::ExecutionFailed));
    assert_eq!(result.http_status(), 502);
    assert!(result.error.as_ref().unwrap().message.contains("upstream exploded"));
    assert!(h.locks.get_active_locks().is_empty());

    let transcript = h
        .store
        .read_transcript(result.session_id.as_deref().unwrap())
        .await
        .unwrap();
    assert!(transcript.is_empty());
}

#[tokio::test]
async fn transcript_write_failure_still_returns_response() {
    let (_tmp, config) = vault();
    let h = harness(config, Arc::new(ScriptedLlm::replying("Here you go")));
    h.store.fail_append.store(true, Ordering::SeqCst);

    let result = h.orchestrator.run(PipelineRequest::new("Hello")).await;

    assert!(!result.success);
    assert_eq!(result.error_code(), Some(ErrorCode::PersistFailed));
    assert_eq!(result.http_status(), 500);
    assert_eq!(result.response.as_deref(), Some("Here you go"));
    assert!(h.locks.get_active_locks().is_empty());
}

#[tokio::test]
async fn panic_in_handler_becomes_internal_error() {
    let (_tmp, config) = vault();
    let h = harness(config, Arc::new(PanickingLlm));

    let result = h.orchestrator.run(PipelineRequest::new("Hello")).await;

    assert_eq!(result.error_code(), Some(ErrorCode::InternalError));
    assert!(result.error.as_ref().unwrap().message.contains("handler bug"));
    assert!(result.run_id.is_some());
    assert!(h.locks.get_active_locks().is_empty());
}

#[tokio::test]
async fn cancellation_aborts_and_keeps_user_message() {
    let (_tmp, config) = vault();
    let h = harness(
        config,
        Arc::new(SlowLlm {
            delay: Duration::from_secs(5),
        }),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let result = h
        .orchestrator
        .run(PipelineRequest::new("Write me an essay").with_cancel(cancel))
        .await;

    assert_eq!(result.error_code(), Some(ErrorCode::Aborted));
    assert_eq!(result.http_status(), 499);
    assert!(result.response.is_none());
    assert!(h.locks.get_active_locks().is_empty());

    let transcript = h
        .store
        .read_transcript(result.session_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].content, "Write me an essay");
}

#[tokio::test]
async fn lock_is_free_for_the_next_run_after_a_failure() {
    let (_tmp, config) = vault();
    let locks = Arc::new(SessionLockManager::new(config.locks.clone()));
    let failing = harness_with_locks(config.clone(), Arc::new(FailingLlm), locks.clone());
    let failed = failing.orchestrator.run(PipelineRequest::new("Hello")).await;
    assert!(!failed.success);

    let session_id = failed.session_id.unwrap();
    let outcome = locks.acquire(&session_id, None).await;
    assert!(outcome.success);
    assert!(outcome.waited_ms < 1000);
}

#[tokio::test]
async fn cancelled_handler_output_is_kept() {
    let (_tmp, config) = vault();
    let h = harness(config, Arc::new(InterruptibleLlm));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let result = h
        .orchestrator
        .run(PipelineRequest::new("Write me an essay").with_cancel(cancel))
        .await;

    assert_eq!(result.error_code(), Some(ErrorCode::Aborted));
    assert_eq!(result.usage, Usage::new(7, 3));
    assert!(h.locks.get_active_locks().is_empty());

    let transcript = h
        .store
        .read_transcript(result.session_id.as_deref().unwrap())
        .await
        .unwrap();
    let contents: Vec<&str> = transcript.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["Write me an essay", "partial answer so far"]);
}

#[tokio::test]
async fn dropping_the_run_releases_the_lock() {
    let (_tmp, config) = vault();
    let h = harness(
        config,
        Arc::new(SlowLlm {
            delay: Duration::from_secs(5),
        }),
    );

    let timed_out = tokio::time::timeout(
        Duration::from_millis(100),
        h.orchestrator.run(PipelineRequest::new("Hello")),
    )
    .await;
    assert!(timed_out.is_err());
    assert!(h.locks.get_active_locks().is_empty());

    let session = h.store.get_or_create_session("assistant").await.unwrap();
    let outcome = h.locks.acquire(&session.id, None).await;
    assert!(outcome.success);
    assert_eq!(outcome.waited_ms, 0);
}

#[tokio::test]
async fn session_ended_mid_run_stays_ended() {
    let (_tmp, config) = vault();
    let locks = Arc::new(SessionLockManager::new(config.locks.clone()));
    let store = Arc::new(FlakyStore::default());
    let orchestrator = Orchestrator::new(
        config,
        locks.clone(),
        Arc::new(FsAgentRegistry::new()),
        store.clone(),
        Arc::new(SessionEndingLlm {
            store: store.clone(),
        }),
    );

    let result = orchestrator.run(PipelineRequest::new("Bye")).await;

    assert!(result.success, "{:?}", result.error);
    assert!(locks.get_active_locks().is_empty());

    store.fail_get.store(false, Ordering::SeqCst);
    let session = store
        .get_session(result.session_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
}

// ── Tools ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn tool_calls_are_executed_between_llm_calls() {
    let (_tmp, config) = vault();
    let llm = Arc::new(ScriptedLlm::new(vec![
        LlmResponse {
            response_text: String::new(),
            usage: Usage::new(30, 8),
            tool_calls: vec![
                ToolCall {
                    id: "call_1".into(),
                    name: "note_lookup".into(),
                    arguments: serde_json::json!({"title": "Standup"}),
                },
                ToolCall {
                    id: "call_2".into(),
                    name: "calendar".into(),
                    arguments: serde_json::json!({}),
                },
            ],
        },
        LlmResponse::text("The meeting moved to Friday.", Usage::new(50, 7)),
    ]));
    let mut tools = ToolRegistry::new();
    tools.register(Box::new(LookupTool));
    let h = harness(config, llm.clone());
    let orchestrator = h.orchestrator.with_tools(Arc::new(tools));

    let result = orchestrator
        .run(PipelineRequest::new("When is standup?"))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.response.as_deref(), Some("The meeting moved to Friday."));
    assert_eq!(result.usage, Usage::new(80, 15));
    assert_eq!(llm.calls(), 2);

    let first = llm.request(0);
    assert_eq!(first.tools.len(), 1);
    assert_eq!(first.tools[0].name, "note_lookup");

    let second = llm.request(1);
    assert_eq!(second.tool_results.len(), 2);
    assert!(second.tool_results[0].success);
    assert!(second.tool_results[0].output.contains("Friday"));
    assert!(!second.tool_results[1].success);
    assert!(second.tool_results[1].output.contains("calendar"));
}

fn looping(id: &str) -> LlmResponse {
    LlmResponse {
        response_text: "checking".into(),
        usage: Usage::new(1, 1),
        tool_calls: vec![ToolCall {
            id: id.into(),
            name: "note_lookup".into(),
            arguments: serde_json::json!({"title": "Inbox"}),
        }],
    }
}

#[tokio::test]
async fn tool_loop_limit_asks_for_answer_without_tools() {
    let (_tmp, mut config) = vault();
    config.execute.max_tool_iterations = 2;
    let llm = Arc::new(ScriptedLlm::new(vec![
        looping("a"),
        looping("b"),
        LlmResponse::text("Your inbox is empty.", Usage::new(1, 4)),
    ]));
    let mut tools = ToolRegistry::new();
    tools.register(Box::new(LookupTool));
    let h = harness(config, llm.clone());
    let orchestrator = h.orchestrator.with_tools(Arc::new(tools));

    let result = orchestrator.run(PipelineRequest::new("Check my inbox")).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.response.as_deref(), Some("Your inbox is empty."));
    assert_eq!(result.usage, Usage::new(3, 6));
    assert_eq!(llm.calls(), 3);

    let last = llm.request(2);
    assert!(last.tools.is_empty());
    assert_eq!(last.tool_results.len(), 2);
}

#[tokio::test]
async fn tool_loop_without_final_answer_fails() {
    let (_tmp, mut config) = vault();
    config.execute.max_tool_iterations = 1;
    let llm = Arc::new(ScriptedLlm::new(vec![
        looping("a"),
        LlmResponse::text("", Usage::new(1, 0)),
    ]));
    let mut tools = ToolRegistry::new();
    tools.register(Box::new(LookupTool));
    let h = harness(config, llm.clone());
    let orchestrator = h.orchestrator.with_tools(Arc::new(tools));

    let result = orchestrator.run(PipelineRequest::new("Check my inbox")).await;

    assert_eq!(result.error_code(), Some(ErrorCode::ExecutionFailed));
    assert_eq!(result.http_status(), 502);
    assert!(h.locks.get_active_locks().is_empty());
    assert_eq!(llm.calls(), 2);
}

// ── Context window management ──────────────────────────────────────────

#[tokio::test]
async fn long_history_is_compacted_and_memory_flushed() {
    let (_tmp, mut config) = vault();
    config.context.context_window = 900;
    config.context.reserve_tokens = 200;
    let llm = Arc::new(ScriptedLlm::replying("Compact answer"));
    let h = harness(config, llm.clone());
    let orchestrator = h.orchestrator.with_memory(Arc::new(VaultAgentMemory::new()));
    let mut events = orchestrator.events().subscribe();

    let session = h.store.create_session("assistant").await.unwrap();
    for i in 0..50 {
        let msg = if i % 2 == 0 {
            TranscriptMessage::user(format!("Message number {i:02} with some padding text here"))
        } else {
            TranscriptMessage::assistant(format!("Message number {i:02} with some padding text here"))
        };
        h.store.append_to_transcript(&session.id, &msg).await.unwrap();
    }

    let result = orchestrator
        .run(PipelineRequest::new("Hello").with_session_id(&session.id))
        .await;
    assert!(result.success, "{:?}", result.error);

    let request = llm.request(0);
    assert_eq!(request.messages[0].role, Role::System);
    assert!(request.messages[0].content.starts_with("[Session Summary]"));
    assert!(request.messages.len() < 51);
    assert_eq!(request.messages.last().unwrap().content, "Hello");

    // The stored transcript is never rewritten
    let transcript = h.store.read_transcript(&session.id).await.unwrap();
    assert_eq!(transcript.len(), 52);

    let mut compacted = false;
    let mut guarded = false;
    while let Ok(event) = events.try_recv() {
        match event.as_ref() {
            PipelineEvent::HistoryCompacted { original_count, .. } => {
                assert_eq!(*original_count, 50);
                compacted = true;
            }
            PipelineEvent::GuardTriggered { .. } => guarded = true,
            _ => {}
        }
    }
    assert!(guarded);
    assert!(compacted);

    let agents = orchestrator.config().vault.agents_root();
    let working = std::fs::read_to_string(agents.join("assistant/memory/working.md")).unwrap();
    assert!(working.contains(&format!("(session {})", session.id)));
    assert!(working.contains("- Last request: Hello"));
}

#[tokio::test]
async fn working_memory_is_part_of_the_prompt() {
    let (tmp, config) = vault();
    let memory_dir = tmp.path().join("agents/assistant/memory");
    std::fs::create_dir_all(&memory_dir).unwrap();
    std::fs::write(memory_dir.join("working.md"), "User prefers metric units.\n").unwrap();

    let llm = Arc::new(ScriptedLlm::replying("20 km"));
    let h = harness(config, llm.clone());
    let orchestrator = h.orchestrator.with_memory(Arc::new(VaultAgentMemory::new()));

    let result = orchestrator.run(PipelineRequest::new("How far is it?")).await;

    assert!(result.success);
    let prompt = llm.request(0).system_prompt;
    assert!(prompt.contains("[Working Memory]"));
    assert!(prompt.contains("User prefers metric units."));

    // Well under the flush threshold, so nothing was appended
    let working = std::fs::read_to_string(memory_dir.join("working.md")).unwrap();
    assert_eq!(working, "User prefers metric units.\n");
}

// ── Events ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn run_publishes_lifecycle_events() {
    let (_tmp, config) = vault();
    let h = harness(config, Arc::new(ScriptedLlm::replying("ok")));
    let mut events = h.orchestrator.events().subscribe();

    let result = h.orchestrator.run(PipelineRequest::new("Hello")).await;
    let run_id = result.run_id.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event.as_ref() {
            PipelineEvent::RunStarted { run_id: id, agent_id, .. } => {
                assert_eq!(id, &run_id);
                assert_eq!(agent_id, "assistant");
                kinds.push("started".to_string());
            }
            PipelineEvent::StageCompleted { stage, ok, .. } => {
                assert!(ok);
                kinds.push(stage.clone());
            }
            PipelineEvent::RunFinished { success, error_code, .. } => {
                assert!(success);
                assert!(error_code.is_none());
                kinds.push("finished".to_string());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(
        kinds,
        vec!["started", "context", "execute", "persist", "finished"]
    );
}

#[tokio::test]
async fn rejected_run_still_reports_finish() {
    let (_tmp, config) = vault();
    let h = harness(config, Arc::new(ScriptedLlm::new(vec![])));
    let mut events = h.orchestrator.events().subscribe();

    let result = h.orchestrator.run(PipelineRequest::new("")).await;
    assert!(!result.success);

    let event = events.try_recv().unwrap();
    match event.as_ref() {
        PipelineEvent::RunFinished { success, error_code, .. } => {
            assert!(!success);
            assert_eq!(error_code.as_deref(), Some("VALIDATION_ERROR"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(events.try_recv().is_err());
}
