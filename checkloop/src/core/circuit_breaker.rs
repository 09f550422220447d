//! Consecutive-failure circuit breaker derived from session history.
//!
//! The breaker holds no state of its own: the streak is recomputed from the
//! validation summaries recorded by `next`, plus the pass being evaluated now.
//! History entries without a summary are skipped, they neither extend nor reset
//! the streak.

use serde::{Deserialize, Serialize};

use crate::core::checkpoint::HistoryEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerState {
    pub consecutive_failures: u32,
    pub threshold: Option<u32>,
    pub tripped: bool,
}

/// Count trailing failed validations, ending with the current pass.
pub fn consecutive_failures(history: &[HistoryEntry], current_passed: bool) -> u32 {
    if current_passed {
        return 0;
    }
    let prior = history
        .iter()
        .rev()
        .filter_map(|entry| entry.validation_summary.as_ref())
        .take_while(|summary| !summary.passed)
        .count() as u32;
    prior + 1
}

/// Evaluate the breaker for the current pass. A `None` threshold never trips.
pub fn evaluate(
    history: &[HistoryEntry],
    current_passed: bool,
    threshold: Option<u32>,
) -> BreakerState {
    let failures = consecutive_failures(history, current_passed);
    BreakerState {
        consecutive_failures: failures,
        threshold,
        tripped: threshold.is_some_and(|limit| limit > 0 && failures >= limit),
    }
}
