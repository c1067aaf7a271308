//! Agent memory trait: the persistent working memory each agent carries
//! across sessions.
//!
//! The context stage reads working memory into the prompt; the persist stage
//! flushes a note into it when the context window guard asks for a flush.

use async_trait::async_trait;

use crate::agent::AgentDef;
use crate::error::MemoryError;
use crate::session::Session;

/// The core AgentMemory trait.
///
/// Implementations: vault files (working.md per agent), no-op.
#[async_trait]
pub trait AgentMemory: Send + Sync {
    /// The backend name (e.g., "vault", "none").
    fn name(&self) -> &str;

    /// The agent's current working memory as prompt-ready text.
    /// Empty when the agent has none.
    async fn working_memory(&self, agent: &AgentDef) -> std::result::Result<String, MemoryError>;

    /// Persist a note distilled from `session` into the agent's working memory.
    async fn flush(
        &self,
        agent: &AgentDef,
        session: &Session,
        note: &str,
    ) -> std::result::Result<(), MemoryError>;
}
