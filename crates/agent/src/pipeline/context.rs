//! CONTEXT: assemble the prompt, estimate it, and act on the guard verdict.

use tracing::{debug, info, warn};
use vaultmind_config::CompactionConfig;
use vaultmind_core::event::PipelineEvent;
use vaultmind_core::message::TranscriptMessage;
use vaultmind_core::provider::ToolDefinition;

use super::intake::IntakeOutput;
use super::orchestrator::Orchestrator;
use super::{ErrorCode, StageFailure, StageResult};
use crate::context::{
    AssemblyInput, CompactionResult, GuardAction, GuardResult, compact_messages,
};

#[derive(Debug, Clone)]
pub struct ContextOutput {
    pub system_prompt: String,
    /// History handed to the LLM, compacted when the guard asked for it.
    pub history: Vec<TranscriptMessage>,
    pub tools: Vec<ToolDefinition>,
    pub token_estimate: usize,
    pub guard: GuardResult,
    /// Consumed by PERSIST.
    pub needs_flush: bool,
    pub compaction: Option<CompactionResult>,
}

impl Orchestrator {
    pub(super) async fn context(
        &self,
        intake: &IntakeOutput,
        message: &str,
    ) -> StageResult<ContextOutput> {
        let agent = &intake.agent;

        let working_memory = match self.memory.working_memory(agent).await {
            Ok(text) => text,
            Err(e) => {
                warn!(agent_id = %agent.id, error = %e, "Working memory unavailable");
                String::new()
            }
        };

        let knowledge = match self.knowledge.scoped_knowledge(agent, message).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(agent_id = %agent.id, error = %e, "Scoped knowledge unavailable");
                Vec::new()
            }
        };

        let recent = self
            .store
            .get_recent_messages(&intake.session_id, self.config.context.recent_message_limit)
            .await
            .map_err(|e| {
                StageFailure::new(
                    ErrorCode::InternalError,
                    format!("Failed to read transcript: {e}"),
                )
            })?;

        let tools: Vec<ToolDefinition> = self
            .tools
            .definitions()
            .into_iter()
            .filter(|t| agent.tools.is_empty() || agent.tools.contains(&t.name))
            .collect();

        let prompt = self.assembler.assemble(&AssemblyInput {
            agent_body: &agent.body,
            working_memory: &working_memory,
            knowledge: &knowledge,
            history: &recent,
        });
        let history_tokens = prompt.history_tokens();
        let mut history = prompt.history;

        let mut token_estimate =
            self.estimator
                .estimate_context(&prompt.system_prompt, &history, message, &tools);
        let mut guard = self.guard.check(token_estimate);
        let mut needs_flush = false;
        let mut compaction = None;

        if guard.action != GuardAction::None {
            info!(
                run_id = %intake.run_id,
                action = %guard.action,
                token_estimate,
                usage_ratio = guard.usage_ratio,
                "Context window guard triggered"
            );
            self.events.publish(PipelineEvent::GuardTriggered {
                run_id: intake.run_id.clone(),
                action: guard.action.to_string(),
                token_estimate,
                usage_ratio: guard.usage_ratio,
            });
        }

        match guard.action {
            GuardAction::None => {}
            GuardAction::Flush => needs_flush = true,
            GuardAction::Compact | GuardAction::Reject => {
                needs_flush = true;
                let result = self.compact_history(&history, history_tokens, token_estimate);
                if result.was_compacted {
                    self.events.publish(PipelineEvent::HistoryCompacted {
                        run_id: intake.run_id.clone(),
                        original_count: result.original_count,
                        compacted_count: result.compacted_count,
                        tokens_used: result.tokens_used,
                    });
                    history = result.messages.clone();
                    token_estimate = self.estimator.estimate_context(
                        &prompt.system_prompt,
                        &history,
                        message,
                        &tools,
                    );
                    guard = self.guard.check(token_estimate);
                }
                compaction = Some(result);

                if guard.action == GuardAction::Reject {
                    return Err(StageFailure::new(
                        ErrorCode::ContextOverflow,
                        guard
                            .reason
                            .clone()
                            .unwrap_or_else(|| "Context exceeds the usable window".into()),
                    ));
                }
            }
        }

        debug!(
            run_id = %intake.run_id,
            token_estimate,
            history = history.len(),
            tools = tools.len(),
            needs_flush,
            "Context assembled"
        );

        Ok(ContextOutput {
            system_prompt: prompt.system_prompt,
            history,
            tools,
            token_estimate,
            guard,
            needs_flush,
            compaction,
        })
    }

    /// Compact history by as many tokens as it takes to reach the target ratio.
    fn compact_history(
        &self,
        history: &[TranscriptMessage],
        history_tokens: usize,
        token_estimate: usize,
    ) -> CompactionResult {
        let to_remove = self
            .guard
            .get_compaction_target(token_estimate, self.config.context.compaction_target_ratio);
        let config = CompactionConfig {
            max_tokens: history_tokens.saturating_sub(to_remove),
            ..self.config.compaction.clone()
        };
        compact_messages(history, &config, &self.estimator)
    }
}
