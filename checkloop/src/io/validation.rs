//! Sequential execution of validation rules.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::runner::{CommandOutcome, CommandRunner, CommandSpec};
use crate::core::types::{RuleDetails, ValidationReport, ValidationResult, ValidationRule};

/// Environment variables exported to every rule command.
pub const ENV_TASK_ID: &str = "CHECKLOOP_TASK_ID";
pub const ENV_ITERATION: &str = "CHECKLOOP_ITERATION";

/// Per-pass context handed to rule commands.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    pub working_dir: &'a Path,
    pub task_id: &'a str,
    pub iteration: Option<u32>,
}

pub struct ValidationEngine<'a> {
    runner: &'a dyn CommandRunner,
    default_timeout: Duration,
    output_limit_bytes: usize,
}

impl<'a> ValidationEngine<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        default_timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            runner,
            default_timeout,
            output_limit_bytes,
        }
    }

    /// Run enabled rules in configured order; one rule's failure never stops the next.
    #[instrument(skip_all, fields(task_id = ctx.task_id, rules = rules.len()))]
    pub fn run(&self, rules: &[ValidationRule], ctx: &ValidationContext<'_>) -> ValidationReport {
        let results = rules
            .iter()
            .filter(|rule| rule.enabled)
            .map(|rule| self.run_rule(rule, ctx))
            .collect();
        ValidationReport::from_results(results)
    }

    pub fn run_rule(&self, rule: &ValidationRule, ctx: &ValidationContext<'_>) -> ValidationResult {
        let spec = self.spec_for(rule, ctx);
        let result = match self.runner.run(&spec) {
            Ok(outcome) => judge(rule, outcome, spec.timeout),
            Err(err) => {
                warn!(rule = %rule.name, err = %err, "rule command failed to start");
                ValidationResult {
                    rule_name: rule.name.clone(),
                    passed: false,
                    message: format!("'{}' could not be executed", rule.name),
                    details: None,
                    error: Some(format!("{err:#}")),
                }
            }
        };
        debug!(rule = %rule.name, passed = result.passed, "rule evaluated");
        result
    }

    fn spec_for(&self, rule: &ValidationRule, ctx: &ValidationContext<'_>) -> CommandSpec {
        let working_dir = match &rule.working_directory {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => ctx.working_dir.join(dir),
            None => ctx.working_dir.to_path_buf(),
        };
        let mut env = rule.env.clone();
        env.insert(ENV_TASK_ID.to_string(), ctx.task_id.to_string());
        if let Some(iteration) = ctx.iteration {
            env.insert(ENV_ITERATION.to_string(), iteration.to_string());
        }
        CommandSpec {
            command: rule.command.clone(),
            working_dir,
            env,
            timeout: rule
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.default_timeout),
            output_limit_bytes: self.output_limit_bytes,
        }
    }
}

fn judge(rule: &ValidationRule, outcome: CommandOutcome, timeout: Duration) -> ValidationResult {
    let details = RuleDetails {
        exit_code: outcome.exit_code,
        expected_exit_code: rule.expected_exit_code,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        duration_ms: outcome.duration.as_millis() as u64,
        timed_out: outcome.timed_out,
    };

    if outcome.timed_out {
        let timeout_ms = timeout.as_millis();
        return ValidationResult {
            rule_name: rule.name.clone(),
            passed: false,
            message: format!("'{}' timed out after {timeout_ms}ms", rule.name),
            details: Some(details),
            error: Some(format!("command timed out after {timeout_ms}ms")),
        };
    }

    match outcome.exit_code {
        Some(code) if code == rule.expected_exit_code => ValidationResult {
            rule_name: rule.name.clone(),
            passed: true,
            message: format!("'{}' passed", rule.name),
            details: Some(details),
            error: None,
        },
        Some(code) => ValidationResult {
            rule_name: rule.name.clone(),
            passed: false,
            message: format!(
                "'{}' exited with code {code}, expected {}",
                rule.name, rule.expected_exit_code
            ),
            details: Some(details),
            error: None,
        },
        None => ValidationResult {
            rule_name: rule.name.clone(),
            passed: false,
            message: format!("'{}' was terminated by a signal", rule.name),
            details: Some(details),
            error: Some("terminated by signal".to_string()),
        },
    }
}
