//! Stop hook that always continues and hands the driver a rendered next prompt.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::warn;

use crate::core::hooks::{HookContext, StopHook};
use crate::core::types::HookDecision;

const CONTINUATION_TEMPLATE: &str = include_str!("prompts/continuation.md");

#[derive(Debug, Serialize)]
struct FailedRule<'a> {
    name: &'a str,
    message: &'a str,
}

pub struct ContinuationPromptHook {
    env: Environment<'static>,
}

impl ContinuationPromptHook {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("continuation", CONTINUATION_TEMPLATE)
            .context("load continuation template")?;
        Ok(Self { env })
    }

    fn render(&self, ctx: &HookContext<'_>) -> Result<String> {
        let failed_rules: Vec<FailedRule<'_>> = ctx
            .validation_results
            .iter()
            .filter(|result| !result.passed)
            .map(|result| FailedRule {
                name: &result.rule_name,
                message: &result.message,
            })
            .collect();
        let template = self.env.get_template("continuation")?;
        let rendered = template.render(context! {
            iteration => ctx.iteration,
            max_iterations => ctx.max_iterations,
            remaining => ctx.max_iterations.saturating_sub(ctx.iteration),
            failed_rules => failed_rules,
            consecutive_failures => ctx.consecutive_failures,
            promises => ctx.completion_promises,
        })?;
        Ok(rendered.trim().to_string())
    }
}

impl StopHook for ContinuationPromptHook {
    fn decide(&self, ctx: &HookContext<'_>) -> HookDecision {
        let reason = format!("iteration {} of {}", ctx.iteration, ctx.max_iterations);
        match self.render(ctx) {
            Ok(prompt) => HookDecision::continue_with(reason).with_next_prompt(prompt),
            Err(err) => {
                warn!(err = %err, "failed to render continuation prompt");
                HookDecision::continue_with(reason)
            }
        }
    }
}

impl std::fmt::Debug for ContinuationPromptHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuationPromptHook").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::promises::default_promises;
    use crate::core::types::{HookAction, ValidationResult};

    fn failed(name: &str, message: &str) -> ValidationResult {
        ValidationResult {
            rule_name: name.to_string(),
            passed: false,
            message: message.to_string(),
            details: None,
            error: None,
        }
    }

    #[test]
    fn prompt_lists_failed_rules_and_promises() {
        let hook = ContinuationPromptHook::new().expect("hook");
        let results = vec![failed("tests", "exit code 1, expected 0")];
        let promises = default_promises();
        let ctx = HookContext {
            task_id: "task-1",
            iteration: 2,
            max_iterations: 5,
            agent_output: "",
            validation_results: &results,
            completion_promises: &promises,
            consecutive_failures: 2,
            metadata: None,
        };

        let decision = hook.decide(&ctx);
        assert_eq!(decision.action, HookAction::Continue);
        let prompt = decision.next_prompt.expect("prompt");
        assert!(prompt.starts_with("Iteration 2 of 5 finished; 3 remaining."));
        assert!(prompt.contains("- tests: exit code 1, expected 0"));
        assert!(prompt.contains("failure 2 in a row"));
        assert!(prompt.contains("<promise>COMPLETE</promise>"));
    }

    #[test]
    fn prompt_reports_clean_pass() {
        let hook = ContinuationPromptHook::new().expect("hook");
        let promises = vec!["DONE".to_string()];
        let ctx = HookContext {
            task_id: "task-1",
            iteration: 3,
            max_iterations: 3,
            agent_output: "",
            validation_results: &[],
            completion_promises: &promises,
            consecutive_failures: 0,
            metadata: None,
        };

        let prompt = hook.decide(&ctx).next_prompt.expect("prompt");
        assert!(prompt.starts_with("Iteration 3 of 3 finished."));
        assert!(prompt.contains("All validation rules passed."));
        assert!(prompt.contains("- DONE"));
    }
}
