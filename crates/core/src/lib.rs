//! # VaultMind Core
//!
//! Domain types, collaborator traits, and error definitions for the VaultMind
//! agent session engine. The engine crate drives these traits; concrete
//! backends live in `vaultmind-memory` or in the embedding application.
//!
//! ## Design Philosophy
//!
//! Every external collaborator of the execution pipeline is a trait here:
//! - [`AgentRegistry`] resolves agent definitions from the vault
//! - [`SessionStore`] owns sessions and append-only transcripts
//! - [`AgentMemory`] and [`KnowledgeSource`] feed the assembled prompt
//! - [`LlmHandler`] and [`ToolExecutor`] perform the actual turn
//!
//! Swapping a backend never touches the engine, and tests run against
//! in-memory or scripted implementations.

pub mod agent;
pub mod error;
pub mod event;
pub mod knowledge;
pub mod memory;
pub mod message;
pub mod provider;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use agent::{AgentDef, AgentRegistry, AgentValidation, FsAgentRegistry};
pub use error::{Error, Result};
pub use event::{EventBus, PipelineEvent};
pub use knowledge::{KnowledgeChunk, KnowledgeSource};
pub use memory::AgentMemory;
pub use message::{Role, TranscriptMessage};
pub use provider::{LlmHandler, LlmRequest, LlmResponse, ToolDefinition, Usage};
pub use session::{Session, SessionStatus, SessionStore};
pub use tool::{Tool, ToolCall, ToolExecutor, ToolRegistry, ToolResult};
