//! Quality gates and the completion check built on them.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, instrument};

use crate::core::types::{TaskSnapshot, ValidationResult, ValidationRule};
use crate::io::gate_catalog::{GateCatalog, load_gate_catalog};
use crate::io::runner::CommandRunner;
use crate::io::validation::{ValidationContext, ValidationEngine};
use crate::session::IterationEngine;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityGateReport {
    pub total_gates: usize,
    pub passed_gates: usize,
    pub failed_gates: usize,
    pub all_passed: bool,
    pub results: Vec<ValidationResult>,
}

impl QualityGateReport {
    fn from_results(results: Vec<ValidationResult>) -> Self {
        let passed_gates = results.iter().filter(|result| result.passed).count();
        Self {
            total_gates: results.len(),
            passed_gates,
            failed_gates: results.len() - passed_gates,
            all_passed: passed_gates == results.len(),
            results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionVerdict {
    pub allowed: bool,
    pub reasons: Vec<String>,
    pub gate_report: QualityGateReport,
}

pub struct QualityGateRunner<'a> {
    validation: ValidationEngine<'a>,
    working_dir: &'a Path,
}

impl<'a> QualityGateRunner<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        working_dir: &'a Path,
        default_timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            validation: ValidationEngine::new(runner, default_timeout, output_limit_bytes),
            working_dir,
        }
    }

    /// Gate names for a task: its own list when it has one (even empty), else
    /// the catalog defaults.
    pub fn gate_names(task: Option<&TaskSnapshot>, catalog: &GateCatalog) -> Vec<String> {
        task.and_then(|task| task.quality_gates.clone())
            .unwrap_or_else(|| catalog.default_gates.clone())
    }

    /// Resolve and run the task's gates. Unknown gate names fail before any gate runs.
    #[instrument(skip_all, fields(task_id))]
    pub fn execute(
        &self,
        task_id: &str,
        task: Option<&TaskSnapshot>,
        catalog: &GateCatalog,
    ) -> Result<QualityGateReport> {
        let names = Self::gate_names(task, catalog);
        let rules: Vec<ValidationRule> = catalog
            .resolve(&names)?
            .into_iter()
            .map(|gate| gate.to_rule())
            .collect();
        let report = self.validation.run(
            &rules,
            &ValidationContext {
                working_dir: self.working_dir,
                task_id,
                iteration: None,
            },
        );
        Ok(QualityGateReport::from_results(report.results))
    }
}

impl IterationEngine {
    /// Run the task's gates against the configured project catalog.
    pub fn run_quality_gates(&self, task_id: &str) -> Result<QualityGateReport> {
        let catalog = self.load_catalog()?;
        self.run_quality_gates_with(task_id, &catalog)
    }

    pub fn run_quality_gates_with(
        &self,
        task_id: &str,
        catalog: &GateCatalog,
    ) -> Result<QualityGateReport> {
        let task = self.tasks.snapshot(task_id)?;
        let report = self.gate_runner().execute(task_id, task.as_ref(), catalog)?;
        info!(
            task_id,
            total = report.total_gates,
            failed = report.failed_gates,
            "quality gates finished"
        );
        Ok(report)
    }

    /// Decide whether a task may be marked complete: every gate passes and,
    /// when `require_proof` is set, at least one work product is recorded.
    pub fn check_completion(&self, task_id: &str, require_proof: bool) -> Result<CompletionVerdict> {
        let catalog = self.load_catalog()?;
        self.check_completion_with(task_id, &catalog, require_proof)
    }

    pub fn check_completion_with(
        &self,
        task_id: &str,
        catalog: &GateCatalog,
        require_proof: bool,
    ) -> Result<CompletionVerdict> {
        let gate_report = self.run_quality_gates_with(task_id, catalog)?;
        let mut reasons: Vec<String> = gate_report
            .results
            .iter()
            .filter(|result| !result.passed)
            .map(|result| {
                format!(
                    "quality gate '{}' failed: {}; fix it or disable this gate in the catalog",
                    result.rule_name, result.message
                )
            })
            .collect();
        if require_proof && self.tasks.artifact_count(task_id)? == 0 {
            reasons.push(format!(
                "task {task_id} has no recorded work product; attach one before completing"
            ));
        }
        Ok(CompletionVerdict {
            allowed: reasons.is_empty(),
            reasons,
            gate_report,
        })
    }

    fn gate_runner(&self) -> QualityGateRunner<'_> {
        QualityGateRunner::new(
            self.runner.as_ref(),
            &self.paths.root,
            self.config.default_rule_timeout(),
            self.config.output_limit_bytes,
        )
    }

    fn load_catalog(&self) -> Result<GateCatalog> {
        load_gate_catalog(&self.paths.resolve(&self.config.gate_catalog))
    }
}
