//! LLM handler trait: the seam between the engine and a concrete model backend.
//!
//! The engine hands the handler a fully assembled prompt and a cancellation
//! token; the handler returns the reply text, token usage, and any tool calls
//! the model wants executed. The network protocol behind it is not the
//! engine's concern.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::message::TranscriptMessage;
use crate::tool::{ToolCall, ToolResult};

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Accumulate usage across tool-loop iterations.
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// The assembled prompt for one LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Agent the call is made on behalf of
    pub agent_id: String,

    /// Preferred model from the agent definition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// System prompt (agent definition + memory + knowledge)
    pub system_prompt: String,

    /// History followed by the current user message
    pub messages: Vec<TranscriptMessage>,

    /// Tools the model may call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Results of the tool calls requested by the previous iteration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
}

/// A complete response from the handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmResponse {
    /// The generated text (may be empty when only tool calls are returned)
    pub response_text: String,

    /// Token usage for this call
    #[serde(default)]
    pub usage: Usage,

    /// Tool calls the model wants executed before it answers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl LlmResponse {
    /// A plain text answer with no tool calls.
    pub fn text(response_text: impl Into<String>, usage: Usage) -> Self {
        Self {
            response_text: response_text.into(),
            usage,
            tool_calls: Vec::new(),
        }
    }
}

/// The LLM collaborator.
///
/// Implementations should observe `cancel` and return early; the engine
/// also races the call against the token, so a handler that ignores it is
/// abandoned rather than awaited.
#[async_trait]
pub trait LlmHandler: Send + Sync {
    /// A human-readable name for this handler (e.g., "anthropic", "scripted").
    fn name(&self) -> &str;

    /// Run one completion.
    async fn complete(
        &self,
        request: LlmRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<LlmResponse, ProviderError>;
}
