//! Scoped knowledge: vault content generated for an agent's scope.
//!
//! The search/indexing engine that produces this content is external; the
//! engine only asks for the chunks relevant to the current turn.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::AgentDef;
use crate::error::MemoryError;

/// A piece of knowledge injected into the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    /// Human-readable source label (note path, export name, ...).
    pub source: String,
    /// The text content of this chunk.
    pub content: String,
    /// Relevance score (0.0–1.0); chunks are handed over highest first.
    #[serde(default)]
    pub relevance: f32,
}

#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// Chunks from the agent's scope relevant to `query`, most relevant first.
    async fn scoped_knowledge(
        &self,
        agent: &AgentDef,
        query: &str,
    ) -> std::result::Result<Vec<KnowledgeChunk>, MemoryError>;
}
