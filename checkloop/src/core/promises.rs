//! Completion-promise detection and completion-signal derivation.

use crate::core::types::{CompletionSignal, HookAction, HookDecision, PromiseKind};

/// Promise marker for a successful close.
pub const COMPLETE_PROMISE: &str = "<promise>COMPLETE</promise>";
/// Promise marker for a blocked close.
pub const BLOCKED_PROMISE: &str = "<promise>BLOCKED</promise>";

const BLOCKED_TOKEN: &str = "BLOCKED";

/// Promises used when a driver does not configure any.
pub fn default_promises() -> Vec<String> {
    vec![COMPLETE_PROMISE.to_string(), BLOCKED_PROMISE.to_string()]
}

/// Return every configured promise present verbatim in `output`, in configured order.
///
/// Matching is exact and case-sensitive. Strings that are not configured are never
/// reported, whatever the output contains.
pub fn detect_promises(output: &str, promises: &[String]) -> Vec<String> {
    promises
        .iter()
        .filter(|promise| !promise.is_empty() && output.contains(promise.as_str()))
        .cloned()
        .collect()
}

/// A promise carrying the `BLOCKED` token closes the loop as blocked.
pub fn classify_promise(promise: &str) -> PromiseKind {
    if promise.contains(BLOCKED_TOKEN) {
        PromiseKind::Blocked
    } else {
        PromiseKind::Complete
    }
}

/// Derive the loop signal. COMPLETE outranks BLOCKED, BLOCKED outranks CONTINUE.
pub fn derive_completion_signal(
    detected: &[String],
    decision: Option<&HookDecision>,
) -> CompletionSignal {
    let action = decision.map(|decision| decision.action);
    let promise_kind = |kind: PromiseKind| {
        detected
            .iter()
            .any(|promise| classify_promise(promise) == kind)
    };

    if promise_kind(PromiseKind::Complete) || action == Some(HookAction::Complete) {
        return CompletionSignal::Complete;
    }
    if promise_kind(PromiseKind::Blocked) || action == Some(HookAction::Blocked) {
        return CompletionSignal::Blocked;
    }
    CompletionSignal::Continue
}
