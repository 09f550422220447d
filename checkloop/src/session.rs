//! Iteration sessions: start, validate, advance, close.
//!
//! A session is a series of checkpoints sharing one `iterationId`. Every
//! transition reads the series head, derives the next checkpoint, and appends it
//! fenced on the head's sequence. `validate` is read-only apart from its
//! validation log.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::checkpoint::{Checkpoint, HistoryEntry, Phase, SessionConfig, Trigger};
use crate::core::circuit_breaker;
use crate::core::hooks::{HookContext, StopHookRegistry};
use crate::core::invariants::validate_session_config;
use crate::core::promises::{classify_promise, derive_completion_signal, detect_promises};
use crate::core::types::{
    CompletionSignal, HookDecision, PromiseKind, TaskSnapshot, TaskStatus, ValidationResult,
    ValidationRule, ValidationSummary,
};
use crate::error::EngineError;
use crate::io::checkpoint_store::{CheckpointStore, FileCheckpointStore};
use crate::io::clock::{Clock, SystemClock};
use crate::io::config::{EngineConfig, load_config};
use crate::io::init::EnginePaths;
use crate::io::iteration_log::{ValidationLog, read_validation_log, write_validation_log};
use crate::io::runner::{CommandRunner, ShellCommandRunner};
use crate::io::task_store::{FileTaskStore, TaskStore};
use crate::io::validation::{ValidationContext, ValidationEngine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub task_id: String,
    /// Falls back to `default_max_iterations`.
    #[serde(default)]
    pub max_iterations: Option<u32>,
    pub completion_promises: Vec<String>,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    /// Falls back to `default_circuit_breaker_threshold`.
    #[serde(default)]
    pub circuit_breaker_threshold: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub iteration_id: String,
    pub iteration_number: u32,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub iteration_number: u32,
    pub validation_passed: bool,
    pub completion_promises_detected: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_decision: Option<HookDecision>,
    pub completion_signal: CompletionSignal,
    pub consecutive_failures: u32,
    pub circuit_breaker_tripped: bool,
    pub results: Vec<ValidationResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NextResponse {
    pub iteration_number: u32,
    pub remaining_iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub total_iterations: u32,
    pub task_id: String,
    pub completion_promise: String,
    pub task_status: TaskStatus,
    pub checkpoint_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbandonResponse {
    pub iteration_id: String,
    pub checkpoint_id: String,
    pub total_iterations: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Paused,
    Completed,
    Blocked,
    Abandoned,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub iteration_id: String,
    pub task_id: String,
    pub state: SessionState,
    pub iteration_number: u32,
    pub max_iterations: u32,
    pub remaining_iterations: u32,
    pub history: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_promise: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
    pub checkpoint_id: String,
    pub expires_at: DateTime<Utc>,
}

/// The engine instance. Owns its stores, its command runner and its hooks.
pub struct IterationEngine {
    pub(crate) config: EngineConfig,
    pub(crate) paths: EnginePaths,
    pub(crate) checkpoints: Box<dyn CheckpointStore>,
    pub(crate) tasks: Box<dyn TaskStore>,
    pub(crate) runner: Box<dyn CommandRunner>,
    pub(crate) clock: Box<dyn Clock>,
    hooks: StopHookRegistry,
}

impl IterationEngine {
    pub fn new(
        paths: EnginePaths,
        config: EngineConfig,
        checkpoints: Box<dyn CheckpointStore>,
        tasks: Box<dyn TaskStore>,
        runner: Box<dyn CommandRunner>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            config,
            paths,
            checkpoints,
            tasks,
            runner,
            clock,
            hooks: StopHookRegistry::new(),
        }
    }

    /// File-backed engine rooted at `root`, running rules through `sh -c`.
    pub fn open(root: &Path) -> Result<Self> {
        let paths = EnginePaths::new(root);
        let config = load_config(&paths.config_path)?;
        Ok(Self::new(
            paths.clone(),
            config,
            Box::new(FileCheckpointStore::new(&paths.checkpoints_path)),
            Box::new(FileTaskStore::new(&paths.tasks_path)),
            Box::new(ShellCommandRunner),
            Box::new(SystemClock),
        ))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn paths(&self) -> &EnginePaths {
        &self.paths
    }

    pub fn hooks(&self) -> &StopHookRegistry {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut StopHookRegistry {
        &mut self.hooks
    }

    /// Open a session. Nothing is written when the request is invalid.
    #[instrument(skip_all, fields(task_id = %request.task_id))]
    pub fn start(&self, request: StartRequest) -> Result<StartResponse> {
        let session = SessionConfig {
            max_iterations: request
                .max_iterations
                .unwrap_or(self.config.default_max_iterations),
            completion_promises: request.completion_promises,
            validation_rules: request.validation_rules,
            circuit_breaker_threshold: request
                .circuit_breaker_threshold
                .or(Some(self.config.default_circuit_breaker_threshold)),
        };
        let errors = validate_session_config(&request.task_id, &session);
        if !errors.is_empty() {
            warn!(errors = errors.len(), "rejected session start");
            return Err(EngineError::InvalidConfig(errors.join("; ")).into());
        }

        let now = self.clock.now();
        if let Some(active) = self.active_session(&request.task_id, now)? {
            return Err(EngineError::InvalidState(format!(
                "task {} already has an open session {} (iteration {}); call checkpoint_resume to continue it or iteration_abandon to close it",
                request.task_id,
                active.iteration_id.as_deref().unwrap_or_default(),
                active.step.unwrap_or(1)
            ))
            .into());
        }

        let max_iterations = session.max_iterations;
        let mut checkpoint = Checkpoint {
            id: new_id("cp"),
            sequence: 0,
            iteration_id: Some(new_id("iter")),
            task_id: request.task_id.clone(),
            phase: Phase::Implementation,
            step: Some(1),
            trigger: Trigger::Iteration,
            config: Some(session),
            history: Vec::new(),
            agent_context: None,
            draft_content: None,
            draft_type: None,
            task_status: None,
            task_notes: None,
            subtask_states: Vec::new(),
            completion_promise: None,
            work_product_id: None,
            close_reason: None,
            created_at: now,
            expires_at: expiry(now, self.config.checkpoint_ttl()),
        };
        self.apply_task_snapshot(&mut checkpoint)?;
        checkpoint.task_status = Some(TaskStatus::InProgress);

        let stored = self.checkpoints.append(checkpoint, None)?;
        self.tasks
            .set_status(&stored.task_id, TaskStatus::InProgress)
            .context("mark task in progress")?;

        let iteration_id = stored.iteration_id.unwrap_or_default();
        info!(iteration_id = %iteration_id, max_iterations, "session started");
        Ok(StartResponse {
            iteration_id,
            iteration_number: 1,
            max_iterations,
        })
    }

    pub fn validate(&self, iteration_id: &str, agent_output: &str) -> Result<ValidateResponse> {
        self.validate_with_metadata(iteration_id, agent_output, None)
    }

    /// Run the session's rules against the current iteration and derive a signal.
    ///
    /// Rule failures, timeouts and a tripped circuit breaker are all reported in
    /// the response; only an unusable session is an error.
    #[instrument(skip(self, agent_output, metadata))]
    pub fn validate_with_metadata(
        &self,
        iteration_id: &str,
        agent_output: &str,
        metadata: Option<&Value>,
    ) -> Result<ValidateResponse> {
        let now = self.clock.now();
        let head = self.open_head(iteration_id, now)?;
        let (session, step) = session_parts(&head)?;

        let engine = ValidationEngine::new(
            self.runner.as_ref(),
            self.config.default_rule_timeout(),
            self.config.output_limit_bytes,
        );
        let report = engine.run(
            &session.validation_rules,
            &ValidationContext {
                working_dir: &self.paths.root,
                task_id: &head.task_id,
                iteration: Some(step),
            },
        );
        let detected = detect_promises(agent_output, &session.completion_promises);
        let breaker = circuit_breaker::evaluate(
            &head.history,
            report.passed,
            session.circuit_breaker_threshold,
        );

        let mut hook_decision = self.hooks.evaluate(&HookContext {
            task_id: &head.task_id,
            iteration: step,
            max_iterations: session.max_iterations,
            agent_output,
            validation_results: &report.results,
            completion_promises: &session.completion_promises,
            consecutive_failures: breaker.consecutive_failures,
            metadata,
        });
        let mut completion_signal = derive_completion_signal(&detected, hook_decision.as_ref());

        if breaker.tripped && completion_signal != CompletionSignal::Complete {
            warn!(
                consecutive_failures = breaker.consecutive_failures,
                threshold = ?breaker.threshold,
                "circuit breaker tripped"
            );
            hook_decision = Some(
                HookDecision::blocked(format!(
                    "circuit breaker: {} consecutive validation failures (threshold {}); fix the failing rules or close the session as blocked",
                    breaker.consecutive_failures,
                    breaker.threshold.unwrap_or_default()
                ))
                .with_metadata(json!({
                    "consecutiveFailures": breaker.consecutive_failures,
                    "threshold": breaker.threshold,
                })),
            );
            completion_signal = CompletionSignal::Blocked;
        }

        write_validation_log(
            &self.paths.iterations_dir,
            &ValidationLog {
                iteration_id: iteration_id.to_string(),
                iteration: step,
                recorded_at: now,
                summary: report.summary(),
                completion_promises_detected: detected.clone(),
                hook_decision: hook_decision.clone(),
                completion_signal,
                consecutive_failures: breaker.consecutive_failures,
                circuit_breaker_tripped: breaker.tripped,
                results: report.results.clone(),
            },
        )?;

        info!(
            iteration = step,
            passed = report.passed,
            signal = ?completion_signal,
            "iteration validated"
        );
        Ok(ValidateResponse {
            iteration_number: step,
            validation_passed: report.passed,
            completion_promises_detected: detected,
            hook_decision,
            completion_signal,
            consecutive_failures: breaker.consecutive_failures,
            circuit_breaker_tripped: breaker.tripped,
            results: report.results,
        })
    }

    /// Close the current iteration into history and open the next one.
    ///
    /// Without an explicit summary, the one recorded by this iteration's
    /// `validate` is used, if any.
    #[instrument(skip(self, summary))]
    pub fn next(
        &self,
        iteration_id: &str,
        summary: Option<ValidationSummary>,
    ) -> Result<NextResponse> {
        let now = self.clock.now();
        let head = self.open_head(iteration_id, now)?;
        let (session, step) = session_parts(&head)?;
        if step >= session.max_iterations {
            warn!(step, max_iterations = session.max_iterations, "iteration limit reached");
            return Err(EngineError::IterationLimitExceeded {
                max_iterations: session.max_iterations,
            }
            .into());
        }

        let summary = match summary {
            Some(summary) => Some(summary),
            None => read_validation_log(&self.paths.iterations_dir, iteration_id, step)?
                .map(|log| log.summary),
        };
        let max_iterations = session.max_iterations;

        let mut next = head.successor(
            new_id("cp"),
            Phase::Implementation,
            Trigger::Iteration,
            now,
            expiry(now, self.config.checkpoint_ttl()),
        );
        next.history.push(HistoryEntry {
            iteration: step,
            timestamp: now,
            checkpoint_id: head.id.clone(),
            validation_summary: summary,
        });
        next.step = Some(step + 1);
        self.apply_task_snapshot(&mut next)?;
        self.checkpoints.append(next, Some(head.sequence))?;

        info!(iteration = step + 1, "session advanced");
        Ok(NextResponse {
            iteration_number: step + 1,
            remaining_iterations: max_iterations - (step + 1),
        })
    }

    /// Close the session with one of its configured promises.
    ///
    /// A BLOCKED-type promise closes the session as blocked and marks the task
    /// blocked; any other promise completes both.
    #[instrument(skip(self, work_product_id))]
    pub fn complete(
        &self,
        iteration_id: &str,
        completion_promise: &str,
        work_product_id: Option<&str>,
    ) -> Result<CompleteResponse> {
        let now = self.clock.now();
        let head = self.open_head(iteration_id, now)?;
        let (session, step) = session_parts(&head)?;
        if !session
            .completion_promises
            .iter()
            .any(|promise| promise == completion_promise)
        {
            return Err(EngineError::InvalidConfig(format!(
                "completion promise '{completion_promise}' is not configured for session {iteration_id}; use one of: {}",
                session.completion_promises.join(", ")
            ))
            .into());
        }

        let (phase, task_status) = match classify_promise(completion_promise) {
            PromiseKind::Complete => (Phase::Completed, TaskStatus::Completed),
            PromiseKind::Blocked => (Phase::Blocked, TaskStatus::Blocked),
        };
        let mut closing = head.successor(
            new_id("cp"),
            phase,
            Trigger::Iteration,
            now,
            expiry(now, self.config.checkpoint_ttl()),
        );
        closing.completion_promise = Some(completion_promise.to_string());
        closing.work_product_id = work_product_id.map(str::to_string);
        self.apply_task_snapshot(&mut closing)?;
        closing.task_status = Some(task_status);
        let stored = self.checkpoints.append(closing, Some(head.sequence))?;

        self.tasks
            .set_status(&stored.task_id, task_status)
            .with_context(|| format!("mark task {} {}", stored.task_id, task_status.as_str()))?;

        info!(phase = phase.as_str(), total_iterations = step, "session closed");
        Ok(CompleteResponse {
            total_iterations: step,
            task_id: stored.task_id,
            completion_promise: completion_promise.to_string(),
            task_status,
            checkpoint_id: stored.id,
        })
    }

    /// Close the session without touching the task.
    #[instrument(skip(self))]
    pub fn abandon(&self, iteration_id: &str, reason: &str) -> Result<AbandonResponse> {
        let now = self.clock.now();
        let head = self.open_head(iteration_id, now)?;
        let (_, step) = session_parts(&head)?;
        let mut closing = head.successor(
            new_id("cp"),
            Phase::Abandoned,
            Trigger::Iteration,
            now,
            expiry(now, self.config.checkpoint_ttl()),
        );
        closing.close_reason = Some(reason.to_string());
        let stored = self.checkpoints.append(closing, Some(head.sequence))?;

        info!(total_iterations = step, "session abandoned");
        Ok(AbandonResponse {
            iteration_id: iteration_id.to_string(),
            checkpoint_id: stored.id,
            total_iterations: step,
        })
    }

    /// Current view of a session, whatever its state.
    pub fn status(&self, iteration_id: &str) -> Result<SessionView> {
        let now = self.clock.now();
        let head = self
            .checkpoints
            .latest_for_iteration(iteration_id)?
            .ok_or_else(|| unknown_session(iteration_id))?;
        let (session, step) = session_parts(&head)?;
        let state = match head.phase {
            Phase::Completed => SessionState::Completed,
            Phase::Blocked => SessionState::Blocked,
            Phase::Abandoned => SessionState::Abandoned,
            _ if head.is_expired(now) => SessionState::Expired,
            Phase::Paused => SessionState::Paused,
            Phase::Implementation => SessionState::Running,
        };
        Ok(SessionView {
            iteration_id: iteration_id.to_string(),
            task_id: head.task_id.clone(),
            state,
            iteration_number: step,
            max_iterations: session.max_iterations,
            remaining_iterations: session.max_iterations.saturating_sub(step),
            history: head.history.clone(),
            completion_promise: head.completion_promise.clone(),
            close_reason: head.close_reason.clone(),
            checkpoint_id: head.id.clone(),
            expires_at: head.expires_at,
        })
    }

    /// Latest head of a session that may still advance: known, unexpired, not closed.
    pub(crate) fn open_head(&self, iteration_id: &str, now: DateTime<Utc>) -> Result<Checkpoint> {
        let head = self
            .checkpoints
            .latest_for_iteration(iteration_id)?
            .ok_or_else(|| unknown_session(iteration_id))?;
        if head.phase.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "session {iteration_id} is already {}; start a new session with iteration_start",
                head.phase.as_str()
            ))
            .into());
        }
        if head.is_expired(now) {
            return Err(EngineError::InvalidState(format!(
                "session {iteration_id} expired at {}; start a new session with iteration_start",
                head.expires_at.to_rfc3339()
            ))
            .into());
        }
        Ok(head)
    }

    /// The task's open session head, if any. Standalone checkpoints are ignored.
    pub(crate) fn active_session(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Checkpoint>> {
        let mut heads: Vec<Checkpoint> = Vec::new();
        for checkpoint in self.checkpoints.list_for_task(task_id)? {
            if checkpoint.iteration_id.is_none() {
                continue;
            }
            match heads
                .iter_mut()
                .find(|head| head.iteration_id == checkpoint.iteration_id)
            {
                Some(head) => *head = checkpoint,
                None => heads.push(checkpoint),
            }
        }
        Ok(heads
            .into_iter()
            .filter(|head| !head.phase.is_terminal() && !head.is_expired(now))
            .max_by_key(|head| head.sequence))
    }

    /// Copy the task's current status, notes and subtasks onto a checkpoint.
    pub(crate) fn apply_task_snapshot(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        if let Some(TaskSnapshot {
            status,
            notes,
            subtasks,
            ..
        }) = self
            .tasks
            .snapshot(&checkpoint.task_id)
            .with_context(|| format!("snapshot task {}", checkpoint.task_id))?
        {
            checkpoint.task_status = Some(status);
            checkpoint.task_notes = notes;
            checkpoint.subtask_states = subtasks;
        }
        Ok(())
    }
}

impl std::fmt::Debug for IterationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IterationEngine")
            .field("root", &self.paths.root)
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

fn session_parts(head: &Checkpoint) -> Result<(&SessionConfig, u32)> {
    let session = head.config.as_ref().ok_or_else(|| {
        EngineError::InvalidState(format!("checkpoint {} carries no session config", head.id))
    })?;
    let step = head.step.ok_or_else(|| {
        EngineError::InvalidState(format!("checkpoint {} carries no iteration number", head.id))
    })?;
    Ok((session, step))
}

fn unknown_session(iteration_id: &str) -> anyhow::Error {
    EngineError::InvalidState(format!(
        "unknown session {iteration_id}; start one with iteration_start"
    ))
    .into()
}

pub(crate) fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

pub(crate) fn expiry(now: DateTime<Utc>, ttl: chrono::Duration) -> DateTime<Utc> {
    now.checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
