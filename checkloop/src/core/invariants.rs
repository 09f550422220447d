//! Start-parameter invariants checked before anything is persisted.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::checkpoint::SessionConfig;

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

/// True if `id` is safe as a task id, gate name or path component.
pub fn is_valid_id(id: &str) -> bool {
    ID_RE.is_match(id)
}

/// Check a session config and task id:
/// - task id is a safe identifier
/// - `max_iterations >= 1`
/// - at least one completion promise, none empty, no duplicates
/// - rule names unique and non-empty, commands non-empty
/// - breaker threshold, when set, is at least 1
pub fn validate_session_config(task_id: &str, config: &SessionConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if !is_valid_id(task_id) {
        errors.push(format!(
            "task id '{task_id}' must match [A-Za-z0-9][A-Za-z0-9._-]*"
        ));
    }

    if config.max_iterations < 1 {
        errors.push("maxIterations must be >= 1".to_string());
    }

    if config.completion_promises.is_empty() {
        errors.push("completionPromises must contain at least one promise".to_string());
    }
    let mut seen_promises = HashSet::new();
    for promise in &config.completion_promises {
        if promise.trim().is_empty() {
            errors.push("completionPromises must not contain empty strings".to_string());
        } else if !seen_promises.insert(promise.as_str()) {
            errors.push(format!("duplicate completion promise '{promise}'"));
        }
    }

    let mut seen_rules = HashSet::new();
    for rule in &config.validation_rules {
        if rule.name.trim().is_empty() {
            errors.push("validation rule name must not be empty".to_string());
        } else if !seen_rules.insert(rule.name.as_str()) {
            errors.push(format!("duplicate validation rule '{}'", rule.name));
        }
        if rule.command.trim().is_empty() {
            errors.push(format!("validation rule '{}' has an empty command", rule.name));
        }
        if rule.timeout_ms == Some(0) {
            errors.push(format!("validation rule '{}' timeout must be > 0", rule.name));
        }
    }

    if config.circuit_breaker_threshold == Some(0) {
        errors.push("circuitBreakerThreshold must be >= 1".to_string());
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::promises::default_promises;
    use crate::core::types::ValidationRule;

    fn config(max_iterations: u32, promises: Vec<String>) -> SessionConfig {
        SessionConfig {
            max_iterations,
            completion_promises: promises,
            validation_rules: Vec::new(),
            circuit_breaker_threshold: None,
        }
    }

    #[test]
    fn accepts_minimal_config() {
        let errors = validate_session_config("task-1", &config(1, default_promises()));
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn rejects_zero_iterations_and_missing_promises() {
        let errors = validate_session_config("task-1", &config(0, Vec::new()));
        assert!(errors.iter().any(|err| err.contains("maxIterations")));
        assert!(errors.iter().any(|err| err.contains("completionPromises")));
    }

    #[test]
    fn rejects_duplicate_rules_and_zero_threshold() {
        let mut cfg = config(3, default_promises());
        cfg.validation_rules = vec![
            ValidationRule::command("tests", "true"),
            ValidationRule::command("tests", "false"),
            ValidationRule::command("empty", " "),
        ];
        cfg.circuit_breaker_threshold = Some(0);

        let errors = validate_session_config("task-1", &cfg);
        assert!(errors.iter().any(|err| err.contains("duplicate validation rule")));
        assert!(errors.iter().any(|err| err.contains("empty command")));
        assert!(errors.iter().any(|err| err.contains("circuitBreakerThreshold")));
    }

    #[test]
    fn ids_reject_path_separators() {
        assert!(is_valid_id("TASK-12.a_b"));
        assert!(!is_valid_id("../etc"));
        assert!(!is_valid_id("a/b"));
        assert!(!is_valid_id(""));
    }
}
