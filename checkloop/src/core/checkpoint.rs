//! Checkpoint domain model.
//!
//! A checkpoint is one immutable "session moment". Sessions never edit a stored
//! checkpoint: every transition derives a fresh one from the previous head and
//! appends it, so the latest checkpoint of a series is the session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{SubtaskState, TaskStatus, ValidationRule, ValidationSummary};

/// Session configuration captured once at `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub max_iterations: u32,
    pub completion_promises: Vec<String>,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_threshold: Option<u32>,
}

/// One closed iteration, appended by `next`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub checkpoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_summary: Option<ValidationSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Implementation,
    Paused,
    Completed,
    Blocked,
    Abandoned,
}

impl Phase {
    /// Terminal phases close the series for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Blocked | Phase::Abandoned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Implementation => "implementation",
            Phase::Paused => "paused",
            Phase::Completed => "completed",
            Phase::Blocked => "blocked",
            Phase::Abandoned => "abandoned",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "implementation" => Some(Phase::Implementation),
            "paused" => Some(Phase::Paused),
            "completed" => Some(Phase::Completed),
            "blocked" => Some(Phase::Blocked),
            "abandoned" => Some(Phase::Abandoned),
            _ => None,
        }
    }
}

/// What caused a checkpoint to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Written by a session transition (`start`, `next`, `complete`, `abandon`).
    Iteration,
    /// User-initiated pause.
    Manual,
    /// System-generated on a task status change.
    AutoStatus,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Iteration => "iteration",
            Trigger::Manual => "manual",
            Trigger::AutoStatus => "auto_status",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "iteration" => Some(Trigger::Iteration),
            "manual" => Some(Trigger::Manual),
            "auto_status" => Some(Trigger::AutoStatus),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PausedBy {
    User,
    System,
}

/// Structured pause metadata preserved for `resume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    pub pause_reason: String,
    pub paused_by: PausedBy,
    pub paused_at: DateTime<Utc>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub key_files: Vec<String>,
}

/// A persisted session moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub id: String,
    /// Store-wide sequence; zero until the store assigns one on append.
    pub sequence: u64,
    pub iteration_id: Option<String>,
    pub task_id: String,
    pub phase: Phase,
    /// Current iteration number for session checkpoints.
    pub step: Option<u32>,
    pub trigger: Trigger,
    pub config: Option<SessionConfig>,
    pub history: Vec<HistoryEntry>,
    pub agent_context: Option<AgentContext>,
    pub draft_content: Option<String>,
    pub draft_type: Option<String>,
    pub task_status: Option<TaskStatus>,
    pub task_notes: Option<String>,
    pub subtask_states: Vec<SubtaskState>,
    pub completion_promise: Option<String>,
    pub work_product_id: Option<String>,
    /// Why an abandoned session was closed.
    pub close_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_pause(&self) -> bool {
        self.trigger == Trigger::Manual && self.phase == Phase::Paused
    }

    /// Derive the next checkpoint in the same series, keeping config and history.
    ///
    /// Pause payload (agent context, draft) and completion fields are not carried
    /// over; callers set what the new moment needs.
    pub fn successor(
        &self,
        id: String,
        phase: Phase,
        trigger: Trigger,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Checkpoint {
        Checkpoint {
            id,
            sequence: 0,
            iteration_id: self.iteration_id.clone(),
            task_id: self.task_id.clone(),
            phase,
            step: self.step,
            trigger,
            config: self.config.clone(),
            history: self.history.clone(),
            agent_context: None,
            draft_content: None,
            draft_type: None,
            task_status: self.task_status,
            task_notes: self.task_notes.clone(),
            subtask_states: self.subtask_states.clone(),
            completion_promise: None,
            work_product_id: None,
            close_reason: None,
            created_at: now,
            expires_at,
        }
    }
}
