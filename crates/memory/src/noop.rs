//! No-op backends that disable working memory and knowledge injection.

use async_trait::async_trait;
use vaultmind_core::agent::AgentDef;
use vaultmind_core::error::MemoryError;
use vaultmind_core::knowledge::{KnowledgeChunk, KnowledgeSource};
use vaultmind_core::memory::AgentMemory;
use vaultmind_core::session::Session;

/// Agent memory that stores nothing.
pub struct NoopMemory;

#[async_trait]
impl AgentMemory for NoopMemory {
    fn name(&self) -> &str {
        "none"
    }

    async fn working_memory(&self, _agent: &AgentDef) -> Result<String, MemoryError> {
        Ok(String::new())
    }

    async fn flush(
        &self,
        _agent: &AgentDef,
        _session: &Session,
        _note: &str,
    ) -> Result<(), MemoryError> {
        Ok(())
    }
}

/// Knowledge source with an empty scope.
pub struct NoopKnowledge;

#[async_trait]
impl KnowledgeSource for NoopKnowledge {
    async fn scoped_knowledge(
        &self,
        _agent: &AgentDef,
        _query: &str,
    ) -> Result<Vec<KnowledgeChunk>, MemoryError> {
        Ok(Vec::new())
    }
}
