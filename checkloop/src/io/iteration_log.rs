//! Per-iteration validation logs under `.checkloop/iterations/`.
//!
//! These are product artifacts, written on every `validate` call regardless of
//! `RUST_LOG`. `next` reads the latest one back when the driver does not pass a
//! validation summary.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::write_atomic;
use crate::core::types::{CompletionSignal, HookDecision, ValidationResult, ValidationSummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationLog {
    pub iteration_id: String,
    pub iteration: u32,
    pub recorded_at: DateTime<Utc>,
    pub summary: ValidationSummary,
    pub completion_promises_detected: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_decision: Option<HookDecision>,
    pub completion_signal: CompletionSignal,
    pub consecutive_failures: u32,
    pub circuit_breaker_tripped: bool,
    pub results: Vec<ValidationResult>,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub validation_path: PathBuf,
}

impl IterationPaths {
    pub fn new(iterations_dir: &Path, iteration_id: &str, iteration: u32) -> Self {
        let dir = iterations_dir
            .join(iteration_id)
            .join(iteration.to_string());
        Self {
            validation_path: dir.join("validation.json"),
            dir,
        }
    }
}

pub fn write_validation_log(iterations_dir: &Path, log: &ValidationLog) -> Result<IterationPaths> {
    let paths = IterationPaths::new(iterations_dir, &log.iteration_id, log.iteration);
    let mut buf = serde_json::to_string_pretty(log)?;
    buf.push('\n');
    write_atomic(&paths.validation_path, &buf)
        .with_context(|| format!("write validation log for iteration {}", log.iteration))?;
    debug!(path = %paths.validation_path.display(), "validation log written");
    Ok(paths)
}

/// Read the validation log of one iteration, if `validate` ran for it.
pub fn read_validation_log(
    iterations_dir: &Path,
    iteration_id: &str,
    iteration: u32,
) -> Result<Option<ValidationLog>> {
    let paths = IterationPaths::new(iterations_dir, iteration_id, iteration);
    if !paths.validation_path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&paths.validation_path)
        .with_context(|| format!("read {}", paths.validation_path.display()))?;
    let log = serde_json::from_str(&contents)
        .with_context(|| format!("parse {}", paths.validation_path.display()))?;
    Ok(Some(log))
}
