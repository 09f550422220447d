//! Shared deterministic types for the iteration engine.
//!
//! These types are the stable contracts between the engine, its drivers and the
//! on-disk formats. They carry no I/O and serialize with camelCase keys so the
//! JSON surface matches the operation contracts exposed by the CLI.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default per-rule timeout when a rule does not set one.
pub const DEFAULT_RULE_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Kind of validation rule. Only command rules exist today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    #[default]
    Command,
}

/// A single validation rule evaluated on every `validate` pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRule {
    #[serde(rename = "type", default)]
    pub kind: RuleKind,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub expected_exit_code: i32,
    /// Timeout in milliseconds; the engine default applies when unset.
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl ValidationRule {
    /// Build an enabled command rule expecting exit code 0.
    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            kind: RuleKind::Command,
            name: name.into(),
            command: command.into(),
            expected_exit_code: 0,
            timeout_ms: None,
            working_directory: None,
            env: BTreeMap::new(),
            enabled: true,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_expected_exit_code(mut self, code: i32) -> Self {
        self.expected_exit_code = code;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Observed execution details for a rule that actually ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDetails {
    pub exit_code: Option<i32>,
    pub expected_exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// Outcome of one rule. Failures and execution errors are data, never panics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub rule_name: String,
    pub passed: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<RuleDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated outcome of a rule list, in configured rule order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub passed: bool,
    pub results: Vec<ValidationResult>,
}

impl ValidationReport {
    /// Aggregate results; an empty list passes vacuously.
    pub fn from_results(results: Vec<ValidationResult>) -> Self {
        let passed = results.iter().all(|result| result.passed);
        Self { passed, results }
    }

    pub fn summary(&self) -> ValidationSummary {
        let failed_rules: Vec<String> = self
            .results
            .iter()
            .filter(|result| !result.passed)
            .map(|result| result.rule_name.clone())
            .collect();
        ValidationSummary {
            passed: self.passed,
            total: self.results.len() as u32,
            failed: failed_rules.len() as u32,
            failed_rules,
        }
    }
}

/// Compact validation outcome recorded in session history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSummary {
    pub passed: bool,
    pub total: u32,
    pub failed: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_rules: Vec<String>,
}

/// Action requested by a stop hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookAction {
    Continue,
    Complete,
    Blocked,
}

/// Structured decision returned by a stop hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookDecision {
    pub action: HookAction,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl HookDecision {
    pub fn continue_with(reason: impl Into<String>) -> Self {
        Self::new(HookAction::Continue, reason)
    }

    pub fn complete(reason: impl Into<String>) -> Self {
        Self::new(HookAction::Complete, reason)
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self::new(HookAction::Blocked, reason)
    }

    fn new(action: HookAction, reason: impl Into<String>) -> Self {
        Self {
            action,
            reason: reason.into(),
            next_prompt: None,
            metadata: None,
        }
    }

    pub fn with_next_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.next_prompt = Some(prompt.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Loop-level signal derived from promises, hooks and the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionSignal {
    Continue,
    Complete,
    Blocked,
}

/// Whether a completion promise closes the loop successfully or as blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromiseKind {
    Complete,
    Blocked,
}

/// Status of an externally owned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
        }
    }
}

/// Point-in-time state of one subtask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskState {
    pub id: String,
    pub status: TaskStatus,
}

/// What the engine reads from the task collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<SubtaskState>,
    /// Gate names from task metadata; `None` falls back to project defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_gates: Option<Vec<String>>,
}

impl TaskSnapshot {
    pub fn new(id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            id: id.into(),
            status,
            notes: None,
            subtasks: Vec::new(),
            quality_gates: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_defaults_apply_when_fields_missing() {
        let rule: ValidationRule =
            serde_json::from_str(r#"{"type":"command","name":"tests","command":"cargo test"}"#)
                .expect("parse rule");
        assert_eq!(rule, ValidationRule::command("tests", "cargo test"));
    }

    #[test]
    fn empty_report_passes_vacuously() {
        let report = ValidationReport::from_results(Vec::new());
        assert!(report.passed);
        assert_eq!(report.summary().total, 0);
    }

    #[test]
    fn summary_lists_failed_rules_in_order() {
        let report = ValidationReport::from_results(vec![
            result("lint", false),
            result("build", true),
            result("tests", false),
        ]);
        let summary = report.summary();
        assert!(!summary.passed);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.failed_rules, vec!["lint", "tests"]);
    }

    #[test]
    fn completion_signal_serializes_upper_case() {
        let json = serde_json::to_string(&CompletionSignal::Blocked).expect("serialize");
        assert_eq!(json, "\"BLOCKED\"");
    }

    fn result(name: &str, passed: bool) -> ValidationResult {
        ValidationResult {
            rule_name: name.to_string(),
            passed,
            message: String::new(),
            details: None,
            error: None,
        }
    }
}
