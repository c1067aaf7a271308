//! Context window guard.
//!
//! Maps a token estimate to an escalating remediation action against the
//! configured usage-ratio thresholds. Pure: nothing here mutates state.

use serde::{Deserialize, Serialize};
use vaultmind_config::{ContextConfig, GuardThresholds};

/// Remediation actions, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardAction {
    None,
    Flush,
    Compact,
    Reject,
}

impl GuardAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardAction::None => "none",
            GuardAction::Flush => "flush",
            GuardAction::Compact => "compact",
            GuardAction::Reject => "reject",
        }
    }
}

impl std::fmt::Display for GuardAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardResult {
    pub action: GuardAction,
    pub token_estimate: usize,
    pub usable_window: usize,
    pub usage_ratio: f64,
    /// Tokens left before the next more severe threshold; 0 once rejecting.
    pub tokens_until_threshold: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Classify `token_estimate` against the usable window.
///
/// Thresholds are checked from most to least severe and are inclusive at
/// their boundary. A window fully eaten by the reserve always rejects.
pub fn check_thresholds(
    token_estimate: usize,
    context_window: usize,
    reserve_tokens: usize,
    thresholds: &GuardThresholds,
) -> GuardResult {
    let usable_window = context_window.saturating_sub(reserve_tokens);
    if usable_window == 0 {
        return GuardResult {
            action: GuardAction::Reject,
            token_estimate,
            usable_window,
            usage_ratio: f64::INFINITY,
            tokens_until_threshold: 0,
            reason: Some(format!(
                "Reserve of {reserve_tokens} tokens leaves no usable space in a {context_window}-token window"
            )),
        };
    }

    let usage_ratio = token_estimate as f64 / usable_window as f64;
    let pct = usage_ratio * 100.0;

    let (action, next, reason) = if usage_ratio >= thresholds.critical {
        (
            GuardAction::Reject,
            None,
            Some(format!(
                "Context at {pct:.1}% of usable window, at or above critical threshold {:.0}%",
                thresholds.critical * 100.0
            )),
        )
    } else if usage_ratio >= thresholds.compact {
        (
            GuardAction::Compact,
            Some(thresholds.critical),
            Some(format!(
                "Context at {pct:.1}% of usable window, history should be compacted"
            )),
        )
    } else if usage_ratio >= thresholds.flush {
        (
            GuardAction::Flush,
            Some(thresholds.compact),
            Some(format!(
                "Context at {pct:.1}% of usable window, working memory should be flushed"
            )),
        )
    } else {
        (GuardAction::None, Some(thresholds.flush), None)
    };

    let tokens_until_threshold = next
        .map(|ratio| ((ratio * usable_window as f64).ceil() as usize).saturating_sub(token_estimate))
        .unwrap_or(0);

    GuardResult {
        action,
        token_estimate,
        usable_window,
        usage_ratio,
        tokens_until_threshold,
        reason,
    }
}

/// The guard bound to one context configuration.
#[derive(Debug, Clone)]
pub struct ContextGuard {
    context_window: usize,
    reserve_tokens: usize,
    thresholds: GuardThresholds,
}

impl ContextGuard {
    pub fn new(context_window: usize, reserve_tokens: usize, thresholds: GuardThresholds) -> Self {
        Self {
            context_window,
            reserve_tokens,
            thresholds,
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.context_window, config.reserve_tokens, config.thresholds())
    }

    pub fn usable_window(&self) -> usize {
        self.context_window.saturating_sub(self.reserve_tokens)
    }

    pub fn check(&self, token_estimate: usize) -> GuardResult {
        check_thresholds(
            token_estimate,
            self.context_window,
            self.reserve_tokens,
            &self.thresholds,
        )
    }

    /// Dry-run classification of `current + additional`.
    pub fn can_accommodate(&self, current: usize, additional: usize) -> GuardResult {
        self.check(current.saturating_add(additional))
    }

    /// Tokens to remove so usage drops to `target_ratio` of the usable window.
    pub fn get_compaction_target(&self, current: usize, target_ratio: f64) -> usize {
        let target = (target_ratio * self.usable_window() as f64).floor() as usize;
        current.saturating_sub(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn guard() -> ContextGuard {
        ContextGuard::new(100_000, 4_000, GuardThresholds::default())
    }

    #[test]
    fn full_usable_window_rejects() {
        let result = check_thresholds(96_000, 100_000, 4_000, &GuardThresholds::default());
        assert_eq!(result.action, GuardAction::Reject);
        assert_eq!(result.usable_window, 96_000);
        assert!((result.usage_ratio - 1.0).abs() < f64::EPSILON);
        assert_eq!(result.tokens_until_threshold, 0);
        assert!(result.reason.is_some());
    }

    #[test]
    fn boundaries_are_inclusive() {
        let g = guard();
        // 0.70 * 96_000 = 67_200
        assert_eq!(g.check(67_199).action, GuardAction::None);
        assert_eq!(g.check(67_200).action, GuardAction::Flush);
        // 0.85 * 96_000 = 81_600
        assert_eq!(g.check(81_600).action, GuardAction::Compact);
        // 0.95 * 96_000 = 91_200
        assert_eq!(g.check(91_200).action, GuardAction::Reject);
    }

    #[test]
    fn tokens_until_next_threshold() {
        let g = guard();
        let none = g.check(60_000);
        assert_eq!(none.tokens_until_threshold, 7_200);
        assert!(none.reason.is_none());

        let flush = g.check(70_000);
        assert_eq!(flush.action, GuardAction::Flush);
        assert_eq!(flush.tokens_until_threshold, 11_600);

        let compact = g.check(90_000);
        assert_eq!(compact.tokens_until_threshold, 1_200);
    }

    #[test]
    fn reserve_eating_the_window_rejects() {
        let result = check_thresholds(1, 4_000, 4_000, &GuardThresholds::default());
        assert_eq!(result.action, GuardAction::Reject);
        assert_eq!(result.usable_window, 0);
    }

    #[test]
    fn can_accommodate_is_a_dry_run() {
        let g = guard();
        assert_eq!(g.can_accommodate(60_000, 5_000).action, GuardAction::None);
        assert_eq!(g.can_accommodate(60_000, 40_000).action, GuardAction::Reject);
        assert_eq!(g.check(60_000).action, GuardAction::None);
    }

    #[test]
    fn compaction_target_halves_usage() {
        let g = guard();
        assert_eq!(g.get_compaction_target(85_000, 0.5), 85_000 - 48_000);
        assert_eq!(g.get_compaction_target(10_000, 0.5), 0);
    }

    proptest! {
        #[test]
        fn severity_is_monotonic_in_usage(a in 0usize..200_000, b in 0usize..200_000) {
            let g = guard();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(g.check(lo).action <= g.check(hi).action);
        }
    }
}
