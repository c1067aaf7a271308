//! EXECUTE: drive the LLM handler and tool executor for one turn.
//!
//! The only stage that suspends on external work, and the only one that
//! observes cancellation. While a call is in flight the session lock is
//! extended on a heartbeat so long generations don't outlive it.

use tokio::time::Interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vaultmind_core::message::TranscriptMessage;
use vaultmind_core::provider::{LlmRequest, LlmResponse, ToolDefinition, Usage};
use vaultmind_core::tool::ToolResult;

use super::context::ContextOutput;
use super::intake::IntakeOutput;
use super::orchestrator::Orchestrator;
use super::{ErrorCode, StageFailure, StageResult};

#[derive(Debug, Clone, Default)]
pub struct ExecuteOutput {
    /// Final text, or whatever was produced before an abort.
    pub response: String,
    pub usage: Usage,
    /// Number of LLM calls made.
    pub iterations: u32,
    pub tool_calls: usize,
    pub aborted: bool,
}

impl ExecuteOutput {
    fn abort(mut self) -> StageResult<Self> {
        self.aborted = true;
        Ok(self)
    }
}

impl Orchestrator {
    pub(super) async fn execute(
        &self,
        intake: &IntakeOutput,
        context: &ContextOutput,
        message: &str,
        cancel: &CancellationToken,
    ) -> StageResult<ExecuteOutput> {
        let mut output = ExecuteOutput::default();
        let mut messages = context.history.clone();
        messages.push(TranscriptMessage::user(message));
        let mut tool_results: Vec<ToolResult> = Vec::new();

        let mut heartbeat = tokio::time::interval(self.config.execute.heartbeat_interval());
        heartbeat.tick().await;

        let max_iterations = self.config.execute.max_tool_iterations.max(1);
        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                return output.abort();
            }

            let request = self.llm_request(intake, context, &messages, &context.tools, &tool_results);
            let Some(response) = self
                .call_llm(intake, request, cancel, &mut heartbeat, &mut output)
                .await?
            else {
                return output.abort();
            };
            output.response = response.response_text;

            if response.tool_calls.is_empty() {
                debug!(run_id = %intake.run_id, iteration, "LLM returned final response");
                return Ok(output);
            }

            if !output.response.is_empty() {
                messages.push(TranscriptMessage::assistant(output.response.clone()));
            }

            for call in &response.tool_calls {
                if cancel.is_cancelled() {
                    return output.abort();
                }
                debug!(run_id = %intake.run_id, tool = %call.name, "Executing tool");
                let result = match self.tools.execute(call).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "Tool call failed");
                        ToolResult::failure(&call.id, &e)
                    }
                };
                tool_results.push(result);
                output.tool_calls += 1;
            }
        }

        warn!(
            run_id = %intake.run_id,
            max_iterations,
            "Tool loop hit the iteration limit, asking for an answer without tools"
        );
        if cancel.is_cancelled() {
            return output.abort();
        }
        let request = self.llm_request(intake, context, &messages, &[], &tool_results);
        let Some(response) = self
            .call_llm(intake, request, cancel, &mut heartbeat, &mut output)
            .await?
        else {
            return output.abort();
        };
        if !response.tool_calls.is_empty() {
            warn!(
                run_id = %intake.run_id,
                ignored = response.tool_calls.len(),
                "Final answer still requested tools"
            );
        }
        if response.response_text.trim().is_empty() {
            return Err(StageFailure::new(
                ErrorCode::ExecutionFailed,
                format!("No answer after {max_iterations} tool iterations"),
            ));
        }
        output.response = response.response_text;
        Ok(output)
    }

    fn llm_request(
        &self,
        intake: &IntakeOutput,
        context: &ContextOutput,
        messages: &[TranscriptMessage],
        tools: &[ToolDefinition],
        tool_results: &[ToolResult],
    ) -> LlmRequest {
        LlmRequest {
            agent_id: intake.agent.id.clone(),
            model: intake.agent.model.clone(),
            system_prompt: context.system_prompt.clone(),
            messages: messages.to_vec(),
            tools: tools.to_vec(),
            tool_results: tool_results.to_vec(),
        }
    }

    /// One LLM call, racing cancellation and extending the lock meanwhile.
    ///
    /// Returns `None` when cancelled. The handler then gets `abort_grace`
    /// to hand back what it has; that partial text and usage land in
    /// `output`.
    async fn call_llm(
        &self,
        intake: &IntakeOutput,
        request: LlmRequest,
        cancel: &CancellationToken,
        heartbeat: &mut Interval,
        output: &mut ExecuteOutput,
    ) -> StageResult<Option<LlmResponse>> {
        output.iterations += 1;
        let call = self.llm.complete(request, cancel.child_token());
        tokio::pin!(call);

        let reply = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                reply = &mut call => break Some(reply),
                _ = heartbeat.tick() => {
                    if !self.locks.extend(&intake.session_id, &intake.run_id, None) {
                        warn!(run_id = %intake.run_id, "Heartbeat could not extend session lock");
                    }
                }
            }
        };

        let Some(reply) = reply else {
            info!(run_id = %intake.run_id, iteration = output.iterations, "Execution cancelled");
            match tokio::time::timeout(self.config.execute.abort_grace(), &mut call).await {
                Ok(Ok(partial)) => {
                    output.usage.add(partial.usage);
                    if !partial.response_text.is_empty() {
                        output.response = partial.response_text;
                    }
                }
                Ok(Err(e)) => debug!(run_id = %intake.run_id, error = %e, "Cancelled call ended with an error"),
                Err(_) => warn!(run_id = %intake.run_id, "LLM handler ignored cancellation, call abandoned"),
            }
            return Ok(None);
        };

        let response = reply.map_err(|e| {
            StageFailure::new(ErrorCode::ExecutionFailed, format!("LLM call failed: {e}"))
        })?;
        output.usage.add(response.usage);
        Ok(Some(response))
    }
}
