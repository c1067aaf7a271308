//! PERSIST: write the turn, update the session, flush memory, release the lock.
//!
//! Every step runs even if an earlier one failed. Only a transcript write
//! failure is critical; it turns the run into PERSIST_FAILED while the
//! response is still returned.

use tracing::{debug, error, warn};
use vaultmind_core::message::TranscriptMessage;

use super::intake::IntakeOutput;
use super::orchestrator::Orchestrator;
use crate::context::extract_key_points;

/// Longest user-message excerpt used when no key points were found.
const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistIssue {
    pub step: &'static str,
    pub message: String,
    pub critical: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PersistOutput {
    pub messages_appended: usize,
    pub memory_flushed: bool,
    pub lock_released: bool,
    pub issues: Vec<PersistIssue>,
}

impl PersistOutput {
    pub fn has_critical(&self) -> bool {
        self.issues.iter().any(|i| i.critical)
    }

    fn record(&mut self, step: &'static str, message: String, critical: bool) {
        if critical {
            error!(step, %message, "Persist step failed");
        } else {
            warn!(step, %message, "Persist step failed");
        }
        self.issues.push(PersistIssue {
            step,
            message,
            critical,
        });
    }

    /// Messages of all critical issues, joined.
    pub fn critical_message(&self) -> String {
        self.issues
            .iter()
            .filter(|i| i.critical)
            .map(|i| i.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl Orchestrator {
    pub(super) async fn persist(
        &self,
        intake: &IntakeOutput,
        history: &[TranscriptMessage],
        message: &str,
        response: &str,
        needs_flush: bool,
    ) -> PersistOutput {
        let mut output = PersistOutput::default();

        let mut turn = vec![TranscriptMessage::user(message)];
        if !response.is_empty() {
            turn.push(TranscriptMessage::assistant(response));
        }
        for msg in &turn {
            match self.store.append_to_transcript(&intake.session_id, msg).await {
                Ok(()) => output.messages_appended += 1,
                Err(e) => {
                    output.record("transcript", format!("Failed to append {} message: {e}", msg.role), true);
                    break;
                }
            }
        }

        if output.messages_appended > 0 {
            match self.store.get_session(&intake.session_id).await {
                Ok(Some(mut session)) => {
                    session.record_messages(output.messages_appended);
                    if let Err(e) = self.store.update_session(&session).await {
                        output.record("session", format!("Failed to update session metadata: {e}"), false);
                    }
                }
                Ok(None) => output.record(
                    "session",
                    format!("Session {} disappeared before its metadata was updated", intake.session_id),
                    false,
                ),
                Err(e) => output.record("session", format!("Failed to reload session: {e}"), false),
            }
        }

        if needs_flush {
            let note = flush_note(history, &turn);
            match self.memory.flush(&intake.agent, &intake.session, &note).await {
                Ok(()) => output.memory_flushed = true,
                Err(e) => output.record("memory", format!("Failed to flush working memory: {e}"), false),
            }
        }

        output.lock_released = self.locks.release(&intake.session_id, &intake.run_id);
        if !output.lock_released {
            output.record(
                "lock",
                format!(
                    "Session lock for {} was not held by run {}",
                    intake.session_id, intake.run_id
                ),
                false,
            );
        }

        debug!(
            run_id = %intake.run_id,
            appended = output.messages_appended,
            flushed = output.memory_flushed,
            issues = output.issues.len(),
            "Persist complete"
        );
        output
    }
}

/// Key points of the conversation, or an excerpt of the request when none.
fn flush_note(history: &[TranscriptMessage], turn: &[TranscriptMessage]) -> String {
    let points = extract_key_points(history.iter().chain(turn));
    if !points.is_empty() {
        return points
            .iter()
            .map(|p| format!("- {p}"))
            .collect::<Vec<_>>()
            .join("\n");
    }

    let request = turn.first().map_or("", |m| m.content.trim());
    let excerpt: String = request.chars().take(EXCERPT_CHARS).collect();
    if excerpt.chars().count() < request.chars().count() {
        format!("- Last request: {excerpt}...")
    } else {
        format!("- Last request: {excerpt}")
    }
}
