//! Vault-backed agent memory and knowledge.
//!
//! Both live beside the agent definition:
//!
//! ```text
//! agents/<id>/AGENT.md
//! agents/<id>/memory/working.md     working memory, flushed notes appended
//! agents/<id>/knowledge/*.md        scoped knowledge exported by the vault indexer
//! ```

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use vaultmind_core::agent::AgentDef;
use vaultmind_core::error::MemoryError;
use vaultmind_core::knowledge::{KnowledgeChunk, KnowledgeSource};
use vaultmind_core::memory::AgentMemory;
use vaultmind_core::session::Session;

const MEMORY_DIR: &str = "memory";
const WORKING_FILE: &str = "working.md";
const KNOWLEDGE_DIR: &str = "knowledge";

/// Working memory stored as a markdown file per agent.
#[derive(Debug, Default)]
pub struct VaultAgentMemory;

impl VaultAgentMemory {
    pub fn new() -> Self {
        Self
    }

    pub fn working_path(agent: &AgentDef) -> PathBuf {
        agent.dir().join(MEMORY_DIR).join(WORKING_FILE)
    }
}

#[async_trait]
impl AgentMemory for VaultAgentMemory {
    fn name(&self) -> &str {
        "vault"
    }

    async fn working_memory(&self, agent: &AgentDef) -> Result<String, MemoryError> {
        let path = Self::working_path(agent);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(MemoryError::Storage(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn flush(&self, agent: &AgentDef, session: &Session, note: &str) -> Result<(), MemoryError> {
        let note = note.trim();
        if note.is_empty() {
            return Ok(());
        }

        let path = Self::working_path(agent);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                MemoryError::Storage(format!("Failed to create memory directory: {e}"))
            })?;
        }

        let section = format!(
            "\n## {} (session {})\n\n{}\n",
            Utc::now().format("%Y-%m-%d %H:%M UTC"),
            session.id,
            note
        );

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to open working memory: {e}")))?;
        file.write_all(section.as_bytes())
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to write working memory: {e}")))?;
        file.flush()
            .await
            .map_err(|e| MemoryError::Storage(format!("Failed to flush working memory: {e}")))?;

        debug!(agent_id = %agent.id, session_id = %session.id, "Working memory flushed");
        Ok(())
    }
}

/// Knowledge read from markdown exports under the agent's `knowledge/` directory.
#[derive(Debug, Default)]
pub struct VaultKnowledge;

impl VaultKnowledge {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl KnowledgeSource for VaultKnowledge {
    async fn scoped_knowledge(
        &self,
        agent: &AgentDef,
        query: &str,
    ) -> Result<Vec<KnowledgeChunk>, MemoryError> {
        let dir = agent.dir().join(KNOWLEDGE_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MemoryError::QueryFailed(e.to_string())),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MemoryError::QueryFailed(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "md") {
                files.push(path);
            }
        }
        files.sort();

        let terms = query_terms(query);
        let mut chunks = Vec::with_capacity(files.len());
        for path in files {
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable knowledge file");
                    continue;
                }
            };
            if content.trim().is_empty() {
                continue;
            }
            let source = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            chunks.push(KnowledgeChunk {
                relevance: relevance(&terms, &content),
                source,
                content: content.trim().to_string(),
            });
        }

        // Stable sort keeps file-name order among equal scores.
        chunks.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(chunks)
    }
}

fn query_terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Share of query terms present in the content. An empty query matches fully.
fn relevance(terms: &[String], content: &str) -> f32 {
    if terms.is_empty() {
        return 1.0;
    }
    let lower = content.to_lowercase();
    let hits = terms.iter().filter(|t| lower.contains(t.as_str())).count();
    hits as f32 / terms.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vaultmind_core::agent::AgentValidation;

    fn agent_in(dir: &std::path::Path) -> AgentDef {
        let raw = "---\nid: researcher\nname: Researcher\nscope: papers\n---\nYou research.\n";
        let path = dir.join("AGENT.md");
        std::fs::write(&path, raw).unwrap();
        match AgentDef::parse(raw, path) {
            AgentValidation::Valid(def) => def,
            other => panic!("expected valid agent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_working_memory_is_empty() {
        let tmp = TempDir::new().unwrap();
        let agent = agent_in(tmp.path());
        let memory = VaultAgentMemory::new();
        assert_eq!(memory.working_memory(&agent).await.unwrap(), "");
    }

    #[tokio::test]
    async fn flush_appends_dated_sections() {
        let tmp = TempDir::new().unwrap();
        let agent = agent_in(tmp.path());
        let memory = VaultAgentMemory::new();
        let session = Session::new("researcher");

        memory.flush(&agent, &session, "- decision: use arXiv").await.unwrap();
        memory.flush(&agent, &session, "- todo: read survey").await.unwrap();
        memory.flush(&agent, &session, "   ").await.unwrap();

        let content = memory.working_memory(&agent).await.unwrap();
        assert_eq!(content.matches(&session.id).count(), 2);
        assert!(content.contains("decision: use arXiv"));
        assert!(content.find("arXiv").unwrap() < content.find("survey").unwrap());
    }

    #[tokio::test]
    async fn knowledge_ranked_by_query_overlap() {
        let tmp = TempDir::new().unwrap();
        let agent = agent_in(tmp.path());
        let dir = tmp.path().join("knowledge");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.md"), "Notes about gardening").unwrap();
        std::fs::write(dir.join("b.md"), "Transformer attention papers").unwrap();
        std::fs::write(dir.join("c.txt"), "ignored").unwrap();

        let chunks = VaultKnowledge::new()
            .scoped_knowledge(&agent, "attention papers?")
            .await
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].source, "b.md");
        assert!(chunks[0].relevance > chunks[1].relevance);
    }

    #[tokio::test]
    async fn no_knowledge_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let agent = agent_in(tmp.path());
        let chunks = VaultKnowledge::new().scoped_knowledge(&agent, "x").await.unwrap();
        assert!(chunks.is_empty());
    }
}
