//! Agent definitions and the agent registry.
//!
//! An agent is a markdown file in the vault with YAML frontmatter:
//!
//! ```markdown
//! ---
//! id: researcher
//! name: Research Assistant
//! scope: projects/thesis
//! model: claude-sonnet
//! ---
//!
//! You help the user keep track of their thesis reading notes.
//! ```
//!
//! Frontmatter is parsed into a loose [`AgentFrontmatter`] and then validated
//! into an [`AgentValidation`]: either a fully-typed [`AgentDef`] or the list
//! of reasons it was rejected. The engine never sees a half-valid agent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::AgentError;

/// Default file name of an agent definition inside its directory.
pub const AGENT_FILE: &str = "AGENT.md";

/// Raw frontmatter as written by the user. Every field is optional here;
/// [`AgentDef::validate`] decides what is required.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentFrontmatter {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

/// A validated agent definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDef {
    /// Stable identifier (`[A-Za-z0-9_-]+`)
    pub id: String,
    /// Display name
    pub name: String,
    /// Part of the vault the agent's knowledge is scoped to
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Preferred model, passed through to the LLM handler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Names of tools this agent may call; empty means all registered tools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    /// Markdown body below the frontmatter (the agent's instructions)
    pub body: String,
    /// Where the definition was loaded from
    pub path: PathBuf,
}

/// Result of validating an agent definition at load time.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentValidation {
    Valid(AgentDef),
    Invalid {
        path: PathBuf,
        /// The id the file claims, if it declared one
        declared_id: Option<String>,
        reasons: Vec<String>,
    },
}

impl AgentValidation {
    /// The id this entry answers to during id lookup.
    pub fn id(&self) -> Option<&str> {
        match self {
            AgentValidation::Valid(def) => Some(&def.id),
            AgentValidation::Invalid { declared_id, .. } => declared_id.as_deref(),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, AgentValidation::Valid(_))
    }

    pub fn path(&self) -> &Path {
        match self {
            AgentValidation::Valid(def) => &def.path,
            AgentValidation::Invalid { path, .. } => path,
        }
    }
}

impl AgentDef {
    /// Directory holding the definition file; memory and knowledge live beneath it.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Parse raw markdown (frontmatter + body) and validate it.
    pub fn parse(raw: &str, path: impl Into<PathBuf>) -> AgentValidation {
        let path = path.into();
        match split_frontmatter(raw, &path) {
            Ok((frontmatter, body)) => Self::validate(frontmatter, body, path),
            Err(e) => AgentValidation::Invalid {
                path,
                declared_id: None,
                reasons: vec![e.to_string()],
            },
        }
    }

    /// Check the required identity fields and build a typed definition.
    pub fn validate(frontmatter: AgentFrontmatter, body: String, path: PathBuf) -> AgentValidation {
        let mut reasons = Vec::new();

        let id = non_blank(frontmatter.id.as_deref());
        match id {
            None => reasons.push("missing required field `id`".to_string()),
            Some(id) if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') => {
                reasons.push(format!("`id` contains invalid characters: {id:?}"));
            }
            Some(_) => {}
        }
        let name = non_blank(frontmatter.name.as_deref());
        if name.is_none() {
            reasons.push("missing required field `name`".to_string());
        }
        let scope = non_blank(frontmatter.scope.as_deref());
        if scope.is_none() {
            reasons.push("missing required field `scope`".to_string());
        }

        match (id, name, scope) {
            (Some(id), Some(name), Some(scope)) if reasons.is_empty() => {
                AgentValidation::Valid(AgentDef {
                    id: id.to_string(),
                    name: name.to_string(),
                    scope: scope.to_string(),
                    description: frontmatter.description,
                    model: frontmatter.model,
                    tools: frontmatter.tools,
                    body,
                    path,
                })
            }
            _ => AgentValidation::Invalid {
                path,
                declared_id: id.map(str::to_string),
                reasons,
            },
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Split raw markdown into parsed frontmatter and the trimmed body.
fn split_frontmatter(raw: &str, path: &Path) -> Result<(AgentFrontmatter, String), AgentError> {
    let trimmed = raw.trim_start();
    let frontmatter_err = |reason: &str| AgentError::Frontmatter {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    let after_open = trimmed
        .strip_prefix("---")
        .ok_or_else(|| frontmatter_err("definition must start with YAML frontmatter (---)"))?;

    let close_pos = after_open
        .find("\n---")
        .ok_or_else(|| frontmatter_err("missing closing frontmatter delimiter (---)"))?;

    let yaml = &after_open[..close_pos];
    let body = after_open[close_pos + 4..].trim().to_string();

    let frontmatter: AgentFrontmatter = if yaml.trim().is_empty() {
        AgentFrontmatter::default()
    } else {
        serde_yaml_ng::from_str(yaml).map_err(|e| frontmatter_err(&e.to_string()))?
    };

    Ok((frontmatter, body))
}

/// Resolves agent definitions for the execution pipeline.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    /// Load a single definition. `path` may be the definition file or the
    /// directory containing it. `None` means nothing exists there.
    async fn load_agent_definition(&self, path: &Path) -> Option<AgentValidation>;

    /// Discover every agent directory directly below `root`.
    async fn discover_agents(&self, root: &Path) -> Vec<AgentValidation>;
}

/// Registry reading agent definitions from the vault directory tree.
#[derive(Debug, Clone)]
pub struct FsAgentRegistry {
    agent_file: String,
}

impl FsAgentRegistry {
    pub fn new() -> Self {
        Self::with_agent_file(AGENT_FILE)
    }

    /// Use a non-default definition file name (e.g. `agent.md`).
    pub fn with_agent_file(agent_file: impl Into<String>) -> Self {
        Self {
            agent_file: agent_file.into(),
        }
    }

    fn definition_path(&self, path: &Path) -> PathBuf {
        if path.is_dir() {
            path.join(&self.agent_file)
        } else {
            path.to_path_buf()
        }
    }
}

impl Default for FsAgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRegistry for FsAgentRegistry {
    async fn load_agent_definition(&self, path: &Path) -> Option<AgentValidation> {
        let file = self.definition_path(path);
        let raw = match tokio::fs::read_to_string(&file).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %file.display(), error = %e, "Agent definition not readable");
                return None;
            }
        };
        let validation = AgentDef::parse(&raw, file.clone());
        if let AgentValidation::Invalid { reasons, .. } = &validation {
            warn!(path = %file.display(), ?reasons, "Agent definition failed validation");
        }
        Some(validation)
    }

    async fn discover_agents(&self, root: &Path) -> Vec<AgentValidation> {
        let mut dirs = Vec::new();
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(rd) => rd,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Failed to read agents directory");
                return Vec::new();
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.join(&self.agent_file).is_file() {
                dirs.push(path);
            }
        }

        // Sort for deterministic ordering
        dirs.sort();

        let mut agents = Vec::with_capacity(dirs.len());
        for dir in dirs {
            if let Some(validation) = self.load_agent_definition(&dir).await {
                agents.push(validation);
            }
        }
        debug!(root = %root.display(), count = agents.len(), "Discovered agents");
        agents
    }
}
