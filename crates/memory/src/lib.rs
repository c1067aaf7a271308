//! Storage backends for VaultMind.
//!
//! Session stores keep session metadata and append-only transcripts.
//! Vault backends read and write the per-agent working memory and scoped
//! knowledge that live next to each agent definition.

pub mod file_backend;
pub mod in_memory;
pub mod noop;
pub mod vault;

pub use file_backend::FileSessionStore;
pub use in_memory::InMemorySessionStore;
pub use noop::{NoopKnowledge, NoopMemory};
pub use vault::{VaultAgentMemory, VaultKnowledge};
