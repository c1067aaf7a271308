//! Token estimation utilities.
//!
//! Blends a character heuristic (~4 characters per token) with a word
//! heuristic (~0.75 words per token). Text dense in code punctuation is
//! estimated from characters alone with a 10% uplift, since word counts
//! undercount code badly. No tokenizer is loaded; estimates are within
//! ~10-15% for BPE tokenizers on English text.

use serde::{Deserialize, Serialize};
use vaultmind_config::TokenConfig;
use vaultmind_core::message::TranscriptMessage;
use vaultmind_core::provider::ToolDefinition;

/// Fixed formatting cost of one tool definition in the API wire format.
const TOOL_OVERHEAD: usize = 10;

/// Share of code punctuation above which text is treated as code.
const CODE_DENSITY: f64 = 0.02;

const CODE_CHARS: &[char] = &['{', '}', '[', ']', '(', ')', ';', '=', '<', '>'];

/// Which heuristic produced an estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    /// Average of the character and word estimates
    Blended,
    /// Character estimate with a code uplift
    Code,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEstimate {
    pub tokens: usize,
    pub characters: usize,
    pub method: EstimationMethod,
}

/// Outcome of [`context_fits_window`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowFit {
    pub fits: bool,
    /// Tokens over the usable window; 0 when it fits.
    pub overage: usize,
}

/// Stateless estimator parameterized by the token heuristics.
#[derive(Debug, Clone, Default)]
pub struct TokenEstimator {
    config: TokenConfig,
}

impl TokenEstimator {
    pub fn new(config: TokenConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Estimate one string.
    pub fn estimate(&self, text: &str) -> TokenEstimate {
        let characters = text.chars().count();
        if characters == 0 {
            return TokenEstimate {
                tokens: 0,
                characters: 0,
                method: EstimationMethod::Blended,
            };
        }

        let char_estimate = (characters as f64 / self.config.chars_per_token).ceil();
        let code_chars = text.chars().filter(|c| CODE_CHARS.contains(c)).count();

        if code_chars as f64 / characters as f64 > CODE_DENSITY {
            return TokenEstimate {
                tokens: (char_estimate * 1.1).round() as usize,
                characters,
                method: EstimationMethod::Code,
            };
        }

        let words = text.split_whitespace().count();
        let word_estimate = (words as f64 / self.config.words_per_token).ceil();
        TokenEstimate {
            tokens: ((char_estimate + word_estimate) / 2.0).round() as usize,
            characters,
            method: EstimationMethod::Blended,
        }
    }

    /// Shorthand for `estimate(text).tokens`.
    pub fn tokens(&self, text: &str) -> usize {
        self.estimate(text).tokens
    }

    /// One message including the per-message overhead for role and formatting.
    pub fn estimate_message(&self, message: &TranscriptMessage) -> usize {
        self.config.message_overhead
            + self.tokens(&message.content)
            + message.name.as_deref().map_or(0, |n| self.tokens(n))
    }

    pub fn estimate_messages(&self, messages: &[TranscriptMessage]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }

    pub fn estimate_tools(&self, tools: &[ToolDefinition]) -> usize {
        tools
            .iter()
            .map(|t| {
                let params = serde_json::to_string(&t.parameters).unwrap_or_default();
                self.tokens(&t.name) + self.tokens(&t.description) + self.tokens(&params) + TOOL_OVERHEAD
            })
            .sum()
    }

    /// The total the context window guard consumes.
    pub fn estimate_context(
        &self,
        system_prompt: &str,
        messages: &[TranscriptMessage],
        user_message: &str,
        tools: &[ToolDefinition],
    ) -> usize {
        self.tokens(system_prompt)
            + self.estimate_messages(messages)
            + self.tokens(user_message)
            + self.estimate_tools(tools)
    }

    /// A fresh streaming counter sharing this estimator's heuristics.
    pub fn streaming(&self) -> StreamingTokenCounter {
        StreamingTokenCounter::new(self.clone())
    }
}

/// Whether `estimate` fits into `window` minus `reserve`.
pub fn context_fits_window(estimate: usize, window: usize, reserve: usize) -> WindowFit {
    let usable = window.saturating_sub(reserve);
    WindowFit {
        fits: estimate <= usable,
        overage: estimate.saturating_sub(usable),
    }
}

/// Incremental counter for streamed output.
///
/// Chunks are buffered and folded into the running total once the buffer
/// reaches `stream_flush_chars`, so a long stream isn't re-estimated from
/// scratch on every chunk. [`estimate`](Self::estimate) includes the
/// unfolded remainder.
#[derive(Debug, Clone)]
pub struct StreamingTokenCounter {
    estimator: TokenEstimator,
    buffer: String,
    folded_tokens: usize,
    folded_chars: usize,
}

impl StreamingTokenCounter {
    pub fn new(estimator: TokenEstimator) -> Self {
        Self {
            estimator,
            buffer: String::new(),
            folded_tokens: 0,
            folded_chars: 0,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
        if self.buffer.chars().count() >= self.estimator.config.stream_flush_chars {
            let est = self.estimator.estimate(&self.buffer);
            self.folded_tokens += est.tokens;
            self.folded_chars += est.characters;
            self.buffer.clear();
        }
    }

    pub fn estimate(&self) -> usize {
        self.folded_tokens + self.estimator.tokens(&self.buffer)
    }

    pub fn total_characters(&self) -> usize {
        self.folded_chars + self.buffer.chars().count()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.folded_tokens = 0;
        self.folded_chars = 0;
    }
}
