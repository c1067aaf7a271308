//! Prompt assembly from the four context layers of an agent turn.
//!
//! 1. **Agent definition** (the AGENT.md body): truncated to its budget
//! 2. **Working memory** (memory/working.md): truncated, newest text kept
//! 3. **Scoped knowledge** (vault exports): lowest-relevance chunks dropped
//! 4. **Conversation history** (recent transcript): oldest turns dropped
//!
//! Layers 1-3 are joined into the system prompt; layer 4 becomes the message
//! list. Each layer is bounded by its own sub-budget, so one oversized layer
//! can't starve the others.
//!
//! # Determinism
//!
//! Identical inputs always produce identical outputs. No random or
//! time-dependent logic is used during assembly.

use serde::{Deserialize, Serialize};
use vaultmind_config::ContextBudgets;
use vaultmind_core::knowledge::KnowledgeChunk;
use vaultmind_core::message::TranscriptMessage;

use crate::context::compaction::get_history_within_budget;
use crate::context::token::TokenEstimator;

// ── Types ─────────────────────────────────────────────────────────────────

/// All inputs for one assembly.
pub struct AssemblyInput<'a> {
    /// The agent's instructions (definition body).
    pub agent_body: &'a str,
    /// Working memory text; empty when the agent has none.
    pub working_memory: &'a str,
    /// Knowledge chunks, pre-sorted by relevance (descending).
    pub knowledge: &'a [KnowledgeChunk],
    /// Recent transcript in chronological order.
    pub history: &'a [TranscriptMessage],
}

/// The assembled prompt, ready for token estimation and the LLM call.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub system_prompt: String,
    pub history: Vec<TranscriptMessage>,
    pub per_layer: Vec<LayerStats>,
    pub drops: Vec<DropInfo>,
}

impl AssembledPrompt {
    /// Tokens spent on the history layer.
    pub fn history_tokens(&self) -> usize {
        self.per_layer
            .iter()
            .find(|s| s.name == LAYER_HISTORY)
            .map_or(0, |s| s.tokens)
    }
}

/// Statistics for a single context layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerStats {
    pub name: String,
    /// Tokens consumed by this layer.
    pub tokens: usize,
    /// Items included after budget trimming.
    pub items_included: usize,
    /// Total items available before trimming.
    pub items_total: usize,
}

/// Information about items dropped from a layer during budget enforcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropInfo {
    pub layer: String,
    pub items_dropped: usize,
    pub tokens_dropped: usize,
    pub reason: String,
}

const LAYER_AGENT: &str = "agent_definition";
const LAYER_WORKING_MEMORY: &str = "working_memory";
const LAYER_KNOWLEDGE: &str = "knowledge";
const LAYER_HISTORY: &str = "history";

// ── Assembler ─────────────────────────────────────────────────────────────

/// The prompt assembler. Stateless; create one and reuse it.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    budgets: ContextBudgets,
    estimator: TokenEstimator,
}

impl PromptAssembler {
    pub fn new(budgets: ContextBudgets, estimator: TokenEstimator) -> Self {
        Self { budgets, estimator }
    }

    pub fn assemble(&self, input: &AssemblyInput<'_>) -> AssembledPrompt {
        let mut per_layer = Vec::with_capacity(4);
        let mut drops = Vec::new();
        let mut sections = Vec::new();

        // ── Layer 1: Agent definition ───────────────────────────────────
        let (body, stats, drop) = self.render_text_layer(
            LAYER_AGENT,
            "",
            input.agent_body,
            self.budgets.agent_definition,
            Keep::Head,
        );
        if !body.is_empty() {
            sections.push(body);
        }
        per_layer.push(stats);
        drops.extend(drop);

        // ── Layer 2: Working memory ─────────────────────────────────────
        let (wm, stats, drop) = self.render_text_layer(
            LAYER_WORKING_MEMORY,
            "[Working Memory]\n",
            input.working_memory,
            self.budgets.working_memory,
            Keep::Tail,
        );
        if !wm.is_empty() {
            sections.push(wm);
        }
        per_layer.push(stats);
        drops.extend(drop);

        // ── Layer 3: Scoped knowledge ───────────────────────────────────
        let (knowledge, stats, drop) = self.render_knowledge_layer(input.knowledge);
        if !knowledge.is_empty() {
            sections.push(knowledge);
        }
        per_layer.push(stats);
        drops.extend(drop);

        // ── Layer 4: History ────────────────────────────────────────────
        let history =
            get_history_within_budget(input.history, self.budgets.history, &self.estimator);
        let history_tokens = self.estimator.estimate_messages(&history);
        let dropped = input.history.len() - history.len();
        if dropped > 0 {
            drops.push(DropInfo {
                layer: LAYER_HISTORY.into(),
                items_dropped: dropped,
                tokens_dropped: self
                    .estimator
                    .estimate_messages(&input.history[..dropped]),
                reason: "Oldest turns dropped".into(),
            });
        }
        per_layer.push(LayerStats {
            name: LAYER_HISTORY.into(),
            tokens: history_tokens,
            items_included: history.len(),
            items_total: input.history.len(),
        });

        AssembledPrompt {
            system_prompt: sections.join("\n\n"),
            history,
            per_layer,
            drops,
        }
    }

    // ── Private layer renderers ───────────────────────────────────────────

    fn render_text_layer(
        &self,
        layer: &str,
        header: &str,
        text: &str,
        budget: usize,
        keep: Keep,
    ) -> (String, LayerStats, Option<DropInfo>) {
        let text = text.trim();
        if text.is_empty() {
            return (String::new(), empty_stats(layer, 0), None);
        }

        let full = format!("{header}{text}");
        let full_tokens = self.estimator.tokens(&full);
        if full_tokens <= budget {
            return (
                full,
                LayerStats {
                    name: layer.into(),
                    tokens: full_tokens,
                    items_included: 1,
                    items_total: 1,
                },
                None,
            );
        }

        let kept = truncate_to_tokens(header, text, budget, &self.estimator, keep);
        let rendered = if kept.is_empty() {
            String::new()
        } else {
            format!("{header}{kept}")
        };
        let used = self.estimator.tokens(&rendered);
        (
            rendered,
            LayerStats {
                name: layer.into(),
                tokens: used,
                items_included: usize::from(!kept.is_empty()),
                items_total: 1,
            },
            Some(DropInfo {
                layer: layer.into(),
                items_dropped: 0,
                tokens_dropped: full_tokens.saturating_sub(used),
                reason: "Truncated to layer budget".into(),
            }),
        )
    }

    fn render_knowledge_layer(
        &self,
        chunks: &[KnowledgeChunk],
    ) -> (String, LayerStats, Option<DropInfo>) {
        let budget = self.budgets.knowledge;
        if chunks.is_empty() {
            return (String::new(), empty_stats(LAYER_KNOWLEDGE, 0), None);
        }

        let header = "[Knowledge]\n";
        let header_tokens = self.estimator.tokens(header);
        let mut used = header_tokens;
        let mut entries = Vec::new();
        let mut dropped = 0;
        let mut dropped_tokens = 0;

        // Chunks arrive sorted by relevance (highest first)
        for chunk in chunks {
            let entry = format!("[Source: {}]\n{}\n", chunk.source, chunk.content.trim());
            let entry_tokens = self.estimator.tokens(&entry);
            if used + entry_tokens <= budget {
                entries.push(entry);
                used += entry_tokens;
            } else {
                dropped += 1;
                dropped_tokens += entry_tokens;
            }
        }

        let (section, used) = if entries.is_empty() {
            (String::new(), 0)
        } else {
            (format!("{header}{}", entries.join("\n")), used)
        };

        let drop = (dropped > 0).then(|| DropInfo {
            layer: LAYER_KNOWLEDGE.into(),
            items_dropped: dropped,
            tokens_dropped: dropped_tokens,
            reason: "Lowest-relevance chunks dropped".into(),
        });

        (
            section,
            LayerStats {
                name: LAYER_KNOWLEDGE.into(),
                tokens: used,
                items_included: entries.len(),
                items_total: chunks.len(),
            },
            drop,
        )
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Keep {
    Head,
    Tail,
}

fn empty_stats(layer: &str, total: usize) -> LayerStats {
    LayerStats {
        name: layer.into(),
        tokens: 0,
        items_included: 0,
        items_total: total,
    }
}

/// Longest head or tail of `text` that, rendered after `header`, fits `budget`.
fn truncate_to_tokens(
    header: &str,
    text: &str,
    budget: usize,
    estimator: &TokenEstimator,
    keep: Keep,
) -> String {
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let fits = |n: usize| {
        let part = slice_chars(text, &boundaries, n, keep).trim();
        part.is_empty() || estimator.tokens(&format!("{header}{part}")) <= budget
    };

    // Binary search on char count; the estimate grows with length.
    let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        if fits(mid) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    // Code-density flips can make the estimate non-monotonic near the edge.
    while lo > 0 && !fits(lo) {
        lo -= 1;
    }
    slice_chars(text, &boundaries, lo, keep).trim().to_string()
}

fn slice_chars<'a>(text: &'a str, boundaries: &[usize], n: usize, keep: Keep) -> &'a str {
    let total = boundaries.len() - 1;
    match keep {
        Keep::Head => &text[..boundaries[n]],
        Keep::Tail => &text[boundaries[total - n]..],
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
