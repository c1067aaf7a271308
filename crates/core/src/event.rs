//! Pipeline event system: lets observers follow runs without coupling to the engine.
//!
//! The orchestrator publishes an event at every stage boundary. Other
//! components (UI bridges, audit logs, tests) subscribe and filter for what
//! they care about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All events emitted by the execution pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// INTAKE succeeded and the session lock is held
    RunStarted {
        run_id: String,
        session_id: String,
        agent_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A stage finished, successfully or not
    StageCompleted {
        run_id: String,
        stage: String,
        ok: bool,
        duration_ms: u64,
    },

    /// The context window guard returned something other than `none`
    GuardTriggered {
        run_id: String,
        action: String,
        token_estimate: usize,
        usage_ratio: f64,
    },

    /// History was compacted before EXECUTE
    HistoryCompacted {
        run_id: String,
        original_count: usize,
        compacted_count: usize,
        tokens_used: usize,
    },

    /// The pipeline returned
    RunFinished {
        run_id: String,
        success: bool,
        error_code: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for pipeline events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<PipelineEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PipelineEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
