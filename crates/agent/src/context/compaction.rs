//! History compaction.
//!
//! Reduces an over-budget history to a preserved tail (plus any earlier
//! messages carrying importance markers) and a generated summary of the
//! rest. Summaries are extractive: marked lines are kept verbatim and open
//! questions are listed, so no LLM call is needed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use vaultmind_config::CompactionConfig;
use vaultmind_core::message::TranscriptMessage;

use crate::context::token::TokenEstimator;

/// Case-insensitive markers that make a message or line worth keeping.
const IMPORTANCE_MARKERS: &[&str] = &["important", "remember", "note:", "decision:", "todo"];

const SUMMARY_HEADER: &str = "[Session Summary]";

/// A line boundary past this share of the limit is a clean cut.
const LINE_CUT_RATIO: f64 = 0.8;

const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionResult {
    /// Chronological output; starts with the summary when compacted.
    pub messages: Vec<TranscriptMessage>,
    pub summary: Option<String>,
    pub original_count: usize,
    pub compacted_count: usize,
    pub tokens_used: usize,
    pub was_compacted: bool,
}

impl CompactionResult {
    fn unchanged(messages: &[TranscriptMessage], tokens_used: usize) -> Self {
        Self {
            messages: messages.to_vec(),
            summary: None,
            original_count: messages.len(),
            compacted_count: messages.len(),
            tokens_used,
            was_compacted: false,
        }
    }
}

pub fn is_important(text: &str) -> bool {
    let lower = text.to_lowercase();
    IMPORTANCE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Compact `messages` so they fit `config.max_tokens` as well as possible.
pub fn compact_messages(
    messages: &[TranscriptMessage],
    config: &CompactionConfig,
    estimator: &TokenEstimator,
) -> CompactionResult {
    let original_tokens = estimator.estimate_messages(messages);
    if original_tokens <= config.max_tokens {
        return CompactionResult::unchanged(messages, original_tokens);
    }

    let tail_start = messages.len().saturating_sub(config.preserve_recent);
    let mut preserved: BTreeSet<usize> = (tail_start..messages.len()).collect();
    if config.preserve_important {
        preserved.extend(
            messages[..tail_start]
                .iter()
                .enumerate()
                .filter(|(_, m)| is_important(&m.content))
                .map(|(i, _)| i),
        );
    }

    let summarized: Vec<&TranscriptMessage> = messages
        .iter()
        .enumerate()
        .filter(|(i, _)| !preserved.contains(i))
        .map(|(_, m)| m)
        .collect();

    // Nothing left to summarize: every message is preserved.
    if summarized.is_empty() {
        return CompactionResult::unchanged(messages, original_tokens);
    }

    let summary = build_summary(&summarized, config, estimator);
    let mut output = Vec::with_capacity(preserved.len() + 1);
    // Dated at the start of the input so the summary sorts first.
    output.push(TranscriptMessage::system(summary.clone()).at(messages[0].timestamp));
    output.extend(preserved.iter().map(|&i| messages[i].clone()));

    let tokens_used = estimator.estimate_messages(&output);
    tracing::debug!(
        original = messages.len(),
        compacted = output.len(),
        original_tokens,
        tokens_used,
        "History compacted"
    );

    CompactionResult {
        compacted_count: output.len(),
        original_count: messages.len(),
        messages: output,
        summary: Some(summary),
        tokens_used,
        was_compacted: true,
    }
}

/// Importance-marked lines verbatim, then questions as `Q: ...`, in order.
pub fn extract_key_points<'a, I>(messages: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a TranscriptMessage>,
{
    let mut points = Vec::new();
    for message in messages {
        for line in message.content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if is_important(line) {
                points.push(line.to_string());
                continue;
            }
            points.extend(questions(line).map(|q| format!("Q: {q}")));
        }
    }
    points
}

/// Sentences in `line` that end with a question mark.
fn questions(line: &str) -> impl Iterator<Item = &str> {
    let mut start = 0;
    let mut found = Vec::new();
    for (idx, c) in line.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            let end = idx + c.len_utf8();
            if c == '?' {
                let sentence = line[start..end].trim();
                if sentence.len() > 1 {
                    found.push(sentence);
                }
            }
            start = end;
        }
    }
    found.into_iter()
}

fn build_summary(
    summarized: &[&TranscriptMessage],
    config: &CompactionConfig,
    estimator: &TokenEstimator,
) -> String {
    let mut text = format!(
        "{SUMMARY_HEADER} {} earlier messages condensed.",
        summarized.len()
    );
    for point in extract_key_points(summarized.iter().copied()) {
        text.push_str("\n- ");
        text.push_str(&point);
    }

    let max_chars =
        (config.summary_tokens as f64 * estimator.config().chars_per_token).floor() as usize;
    truncate_summary(&text, max_chars)
}

/// Hard-truncate to `max_chars`, preferring a late line boundary.
fn truncate_summary(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let cut = prefix_chars(text, max_chars);
    if let Some(nl) = cut.rfind('\n') {
        let line_end = cut[..nl].chars().count();
        if line_end as f64 > max_chars as f64 * LINE_CUT_RATIO {
            return cut[..nl].to_string();
        }
    }

    let keep = max_chars.saturating_sub(ELLIPSIS.len());
    format!("{}{ELLIPSIS}", prefix_chars(text, keep))
}

fn prefix_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Keep messages from most recent backward while they fit `max_tokens`.
pub fn get_history_within_budget(
    messages: &[TranscriptMessage],
    max_tokens: usize,
    estimator: &TokenEstimator,
) -> Vec<TranscriptMessage> {
    let mut used = 0;
    let mut start = messages.len();
    for (i, message) in messages.iter().enumerate().rev() {
        let cost = estimator.estimate_message(message);
        if used + cost > max_tokens {
            break;
        }
        used += cost;
        start = i;
    }
    messages[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use vaultmind_core::message::Role;

    fn history(n: usize) -> Vec<TranscriptMessage> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    TranscriptMessage::user(format!("Message number {i}"))
                } else {
                    TranscriptMessage::assistant(format!("Reply number {i}"))
                }
            })
            .collect()
    }

    fn config(max_tokens: usize, preserve_recent: usize) -> CompactionConfig {
        CompactionConfig {
            max_tokens,
            summary_tokens: 200,
            preserve_recent,
            preserve_important: true,
        }
    }

    #[test]
    fn within_budget_is_unchanged() {
        let msgs = history(4);
        let result = compact_messages(&msgs, &config(10_000, 2), &TokenEstimator::default());
        assert!(!result.was_compacted);
        assert_eq!(result.messages, msgs);
        assert!(result.summary.is_none());
    }

    #[test]
    fn hundred_messages_keep_last_three() {
        let msgs = history(100);
        let result = compact_messages(&msgs, &config(500, 3), &TokenEstimator::default());
        assert!(result.was_compacted);
        assert!(result.compacted_count < result.original_count);
        assert_eq!(result.original_count, 100);

        let tail = &result.messages[result.messages.len() - 3..];
        assert_eq!(tail, &msgs[97..]);

        let summary = &result.messages[0];
        assert_eq!(summary.role, Role::System);
        assert!(summary.content.starts_with("[Session Summary] 97 earlier messages"));
    }

    #[test]
    fn important_messages_survive() {
        let mut msgs = history(40);
        msgs[5] = TranscriptMessage::user("Decision: we go with Postgres");
        let result = compact_messages(&msgs, &config(50, 2), &TokenEstimator::default());
        assert!(result.was_compacted);
        assert!(result.messages.iter().any(|m| m.content.contains("Postgres")));
        // Preserved messages stay in input order after the summary.
        assert_eq!(result.messages[1].content, "Decision: we go with Postgres");
    }

    #[test]
    fn everything_preserved_means_no_compaction() {
        let msgs = history(10);
        let result = compact_messages(&msgs, &config(1, 10), &TokenEstimator::default());
        assert!(!result.was_compacted);
        assert_eq!(result.messages.len(), 10);
    }

    #[test]
    fn rerunning_on_fitting_result_is_noop() {
        let msgs = history(100);
        let est = TokenEstimator::default();
        let cfg = config(500, 3);
        let first = compact_messages(&msgs, &cfg, &est);
        assert!(first.tokens_used <= cfg.max_tokens);

        let second = compact_messages(&first.messages, &cfg, &est);
        assert!(!second.was_compacted);
        assert_eq!(second.messages, first.messages);
    }

    #[test]
    fn key_points_capture_markers_and_questions() {
        let msgs = vec![
            TranscriptMessage::user("Remember to cite sources.\nWhat about recall? Fine."),
            TranscriptMessage::assistant("Sure. Is arXiv ok? Yes it is!"),
        ];
        let points = extract_key_points(&msgs);
        assert_eq!(
            points,
            vec![
                "Remember to cite sources.".to_string(),
                "Q: What about recall?".to_string(),
                "Q: Is arXiv ok?".to_string(),
            ]
        );
    }

    #[test]
    fn truncation_prefers_late_line_boundary() {
        let text = format!("{}\n{}", "a".repeat(90), "b".repeat(50));
        let out = truncate_summary(&text, 100);
        assert_eq!(out, "a".repeat(90));

        let early = format!("{}\n{}", "a".repeat(10), "b".repeat(200));
        let out = truncate_summary(&early, 100);
        assert!(out.ends_with("..."));
        assert_eq!(out.chars().count(), 100);
    }

    #[test]
    fn truncation_is_char_boundary_safe() {
        let text = "é".repeat(300);
        let out = truncate_summary(&text, 50);
        assert_eq!(out.chars().count(), 50);
    }

    #[test]
    fn budget_window_keeps_most_recent() {
        let msgs = history(20);
        let est = TokenEstimator::default();
        let kept = get_history_within_budget(&msgs, 30, &est);
        assert!(!kept.is_empty());
        assert_eq!(kept.last(), msgs.last());
        assert!(est.estimate_messages(&kept) <= 30);
        assert!(get_history_within_budget(&msgs, 0, &est).is_empty());
    }

    proptest! {
        #[test]
        fn tail_is_always_preserved(n in 1usize..80, k in 0usize..12, max in 0usize..400) {
            let msgs = history(n);
            let result = compact_messages(&msgs, &config(max, k), &TokenEstimator::default());
            let k = k.min(n);
            let out_tail = &result.messages[result.messages.len() - k..];
            prop_assert_eq!(out_tail, &msgs[n - k..]);
        }
    }
}
