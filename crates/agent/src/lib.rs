//! The agent session execution engine.
//!
//! Each user turn runs through a strict pipeline:
//!
//! 1. **INTAKE**: validate the message, resolve agent and session, take the session lock
//! 2. **CONTEXT**: assemble the prompt under token sub-budgets and consult the window guard,
//!    compacting history when it asks
//! 3. **EXECUTE**: call the LLM, running requested tools until it answers in text
//! 4. **PERSIST**: append the turn, update the session, flush memory, release the lock
//!
//! Only one run per session executes at a time; runs on different sessions
//! proceed concurrently. The orchestrator always returns a structured
//! [`PipelineResult`] and never leaves a session locked behind it.

pub mod context;
pub mod lock;
pub mod pipeline;

pub use context::{
    CompactionResult, ContextGuard, GuardAction, GuardResult, PromptAssembler,
    StreamingTokenCounter, TokenEstimate, TokenEstimator,
};
pub use lock::{AcquireOutcome, LockError, SessionLock, SessionLockGuard, SessionLockManager};
pub use pipeline::{
    ErrorCode, Orchestrator, PipelineError, PipelineRequest, PipelineResult, Stage, StageReport,
};
