//! Pause, resume and the checkpoint housekeeping operations.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::core::checkpoint::{AgentContext, Checkpoint, PausedBy, Phase, Trigger};
use crate::core::resume::select_resume_checkpoint;
use crate::core::types::{SubtaskState, TaskStatus};
use crate::session::{IterationEngine, expiry, new_id};

/// Draft type recorded when a pause carries a draft without naming its type.
pub const DEFAULT_DRAFT_TYPE: &str = "implementation";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseRequest {
    pub task_id: String,
    pub pause_reason: String,
    pub paused_by: PausedBy,
    #[serde(default)]
    pub draft_content: Option<String>,
    #[serde(default)]
    pub draft_type: Option<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub key_files: Vec<String>,
}

impl PauseRequest {
    pub fn new(
        task_id: impl Into<String>,
        pause_reason: impl Into<String>,
        paused_by: PausedBy,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            pause_reason: pause_reason.into(),
            paused_by,
            draft_content: None,
            draft_type: None,
            next_steps: Vec::new(),
            blockers: Vec::new(),
            key_files: Vec::new(),
        }
    }

    pub fn with_draft(mut self, content: impl Into<String>) -> Self {
        self.draft_content = Some(content.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseResponse {
    pub checkpoint_id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_id: Option<String>,
}

/// Everything needed to pick work back up without re-deriving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeState {
    pub checkpoint_id: String,
    pub trigger: Trigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_id: Option<String>,
    pub restored_phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restored_step: Option<u32>,
    pub has_draft: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_context: Option<AgentContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_notes: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subtask_states: Vec<SubtaskState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_id: Option<String>,
    pub phase: Phase,
    pub trigger: Trigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    pub has_draft: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&Checkpoint> for CheckpointSummary {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            checkpoint_id: checkpoint.id.clone(),
            sequence: checkpoint.sequence,
            iteration_id: checkpoint.iteration_id.clone(),
            phase: checkpoint.phase,
            trigger: checkpoint.trigger,
            step: checkpoint.step,
            has_draft: checkpoint.draft_content.is_some(),
            created_at: checkpoint.created_at,
            expires_at: checkpoint.expires_at,
        }
    }
}

impl IterationEngine {
    /// Record a manual pause with an extended lifetime.
    ///
    /// With an open session the pause joins its series; otherwise it stands alone.
    #[instrument(skip_all, fields(task_id = %request.task_id))]
    pub fn pause(&self, request: PauseRequest) -> Result<PauseResponse> {
        let now = self.clock.now();
        let expires_at = expiry(now, self.config.pause_ttl());
        let active = self.active_session(&request.task_id, now)?;

        let mut checkpoint = match &active {
            Some(head) => head.successor(new_id("cp"), Phase::Paused, Trigger::Manual, now, expires_at),
            None => standalone(&request.task_id, Phase::Paused, Trigger::Manual, now, expires_at),
        };
        checkpoint.draft_type = request
            .draft_content
            .as_ref()
            .map(|_| request.draft_type.clone().unwrap_or_else(|| DEFAULT_DRAFT_TYPE.to_string()));
        checkpoint.draft_content = request.draft_content;
        checkpoint.agent_context = Some(AgentContext {
            pause_reason: request.pause_reason,
            paused_by: request.paused_by,
            paused_at: now,
            next_steps: request.next_steps,
            blockers: request.blockers,
            key_files: request.key_files,
        });
        self.apply_task_snapshot(&mut checkpoint)?;

        let stored = self
            .checkpoints
            .append(checkpoint, active.as_ref().map(|head| head.sequence))?;
        info!(checkpoint_id = %stored.id, in_session = stored.iteration_id.is_some(), "paused");
        Ok(PauseResponse {
            checkpoint_id: stored.id,
            expires_at: stored.expires_at,
            iteration_id: stored.iteration_id,
        })
    }

    /// Restore from the task's most relevant unexpired checkpoint.
    #[instrument(skip(self))]
    pub fn resume(&self, task_id: &str) -> Result<Option<ResumeState>> {
        let now = self.clock.now();
        let checkpoints = self.checkpoints.list_for_task(task_id)?;
        let Some(chosen) = select_resume_checkpoint(&checkpoints, now) else {
            return Ok(None);
        };
        let iteration_id = match &chosen.iteration_id {
            Some(id) => Some(id.clone()),
            None => self
                .active_session(task_id, now)?
                .and_then(|head| head.iteration_id),
        };
        info!(checkpoint_id = %chosen.id, phase = chosen.phase.as_str(), "resumed");
        Ok(Some(ResumeState {
            checkpoint_id: chosen.id.clone(),
            trigger: chosen.trigger,
            iteration_id,
            restored_phase: chosen.phase,
            restored_step: chosen.step,
            has_draft: chosen.draft_content.is_some(),
            draft_type: chosen.draft_type.clone(),
            draft_content: chosen.draft_content.clone(),
            agent_context: chosen.agent_context.clone(),
            task_status: chosen.task_status,
            task_notes: chosen.task_notes.clone(),
            subtask_states: chosen.subtask_states.clone(),
        }))
    }

    /// Snapshot the task as a short-lived auto checkpoint.
    ///
    /// Auto checkpoints never join a session series; they carry the open
    /// session's phase and iteration number for context.
    #[instrument(skip(self))]
    pub fn create_auto_checkpoint(&self, task_id: &str) -> Result<CheckpointSummary> {
        let now = self.clock.now();
        let active = self.active_session(task_id, now)?;
        let phase = active.as_ref().map_or(Phase::Implementation, |head| head.phase);
        let mut checkpoint = standalone(
            task_id,
            phase,
            Trigger::AutoStatus,
            now,
            expiry(now, self.config.checkpoint_ttl()),
        );
        checkpoint.step = active.as_ref().and_then(|head| head.step);
        self.apply_task_snapshot(&mut checkpoint)?;
        let stored = self.checkpoints.append(checkpoint, None)?;
        Ok(CheckpointSummary::from(&stored))
    }

    /// Change a task's status and record the change as an auto checkpoint.
    pub fn set_task_status(&self, task_id: &str, status: TaskStatus) -> Result<CheckpointSummary> {
        self.tasks
            .set_status(task_id, status)
            .with_context(|| format!("set task {task_id} {}", status.as_str()))?;
        self.create_auto_checkpoint(task_id)
    }

    /// Unexpired checkpoints of a task, newest first.
    pub fn list_checkpoints(&self, task_id: &str) -> Result<Vec<CheckpointSummary>> {
        let now = self.clock.now();
        let mut listed: Vec<CheckpointSummary> = self
            .checkpoints
            .list_for_task(task_id)?
            .iter()
            .filter(|checkpoint| !checkpoint.is_expired(now))
            .map(CheckpointSummary::from)
            .collect();
        listed.reverse();
        Ok(listed)
    }

    /// Delete expired checkpoints. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let removed = self.checkpoints.purge_expired(self.clock.now())?;
        if removed > 0 {
            info!(removed, "purged expired checkpoints");
        }
        Ok(removed)
    }
}

fn standalone(
    task_id: &str,
    phase: Phase,
    trigger: Trigger,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Checkpoint {
    Checkpoint {
        id: new_id("cp"),
        sequence: 0,
        iteration_id: None,
        task_id: task_id.to_string(),
        phase,
        step: None,
        trigger,
        config: None,
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
        expires_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskSnapshot;
    use crate::io::checkpoint_store::CheckpointStore;
    use crate::session::SessionState;
    use crate::test_support::{TestEngine, start_request};
    use chrono::Duration;

    #[test]
    fn pause_outside_session_restores_draft() {
        let harness = TestEngine::new();
        harness.insert_task(TaskSnapshot {
            notes: Some("parser half done".to_string()),
            ..TaskSnapshot::new("task-1", TaskStatus::InProgress)
        });

        let paused = harness
            .engine
            .pause(PauseRequest {
                next_steps: vec!["wire the lexer".to_string()],
                ..PauseRequest::new("task-1", "end of day", PausedBy::User).with_draft("partial impl")
            })
            .expect("pause");
        assert_eq!(paused.iteration_id, None);
        assert_eq!(paused.expires_at, harness.clock.now() + Duration::days(7));

        let resumed = harness.engine.resume("task-1").expect("resume").expect("state");
        assert!(resumed.has_draft);
        assert_eq!(resumed.draft_type.as_deref(), Some(DEFAULT_DRAFT_TYPE));
        assert_eq!(resumed.draft_content.as_deref(), Some("partial impl"));
        assert_eq!(resumed.restored_phase, Phase::Paused);
        assert_eq!(resumed.task_notes.as_deref(), Some("parser half done"));
        let context = resumed.agent_context.expect("context");
        assert_eq!(context.pause_reason, "end of day");
        assert_eq!(context.next_steps, vec!["wire the lexer"]);
    }

    #[test]
    fn pause_inside_session_joins_series_and_next_continues() {
        let harness = TestEngine::new();
        let started = harness.engine.start(start_request("task-1", 3)).expect("start");
        let paused = harness
            .engine
            .pause(PauseRequest::new("task-1", "break", PausedBy::System))
            .expect("pause");
        assert_eq!(paused.iteration_id.as_deref(), Some(started.iteration_id.as_str()));
        assert_eq!(
            harness.engine.status(&started.iteration_id).expect("status").state,
            SessionState::Paused
        );

        let resumed = harness.engine.resume("task-1").expect("resume").expect("state");
        assert_eq!(resumed.restored_step, Some(1));
        assert!(!resumed.has_draft);

        harness.engine.next(&started.iteration_id, None).expect("next");
        let resumed = harness.engine.resume("task-1").expect("resume").expect("state");
        assert_eq!(resumed.trigger, Trigger::Iteration);
        assert_eq!(resumed.restored_step, Some(2));
    }

    #[test]
    fn pause_wins_over_later_auto_checkpoint() {
        let harness = TestEngine::new();
        harness
            .engine
            .pause(PauseRequest::new("task-1", "waiting on review", PausedBy::User))
            .expect("pause");
        harness.clock.advance(Duration::minutes(5));
        let auto = harness
            .engine
            .set_task_status("task-1", TaskStatus::Blocked)
            .expect("status change");
        assert_eq!(auto.trigger, Trigger::AutoStatus);

        let resumed = harness.engine.resume("task-1").expect("resume").expect("state");
        assert_eq!(resumed.trigger, Trigger::Manual);
    }

    #[test]
    fn resume_without_checkpoints_is_none() {
        let harness = TestEngine::new();
        assert!(harness.engine.resume("task-1").expect("resume").is_none());
    }

    #[test]
    fn list_is_newest_first_and_purge_drops_expired() {
        let harness = TestEngine::new();
        harness.engine.create_auto_checkpoint("task-1").expect("auto");
        harness
            .engine
            .pause(PauseRequest::new("task-1", "later", PausedBy::User))
            .expect("pause");

        let listed = harness.engine.list_checkpoints("task-1").expect("list");
        assert_eq!(listed.len(), 2);
        assert!(listed[0].sequence > listed[1].sequence);
        assert_eq!(listed[0].trigger, Trigger::Manual);

        harness.clock.advance(Duration::days(2));
        assert_eq!(harness.engine.list_checkpoints("task-1").expect("list").len(), 1);
        assert_eq!(harness.engine.purge_expired().expect("purge"), 1);
        assert_eq!(harness.engine.purge_expired().expect("purge"), 0);
    }

    #[test]
    fn status_change_records_an_auto_checkpoint() {
        let harness = TestEngine::new();
        let started = harness.engine.start(start_request("task-1", 3)).expect("start");

        let summary = harness
            .engine
            .set_task_status("task-1", TaskStatus::Blocked)
            .expect("set status");
        assert_eq!(summary.trigger, Trigger::AutoStatus);
        assert_eq!(summary.iteration_id, None);
        assert_eq!(summary.step, Some(1));
        assert_eq!(harness.task_status("task-1"), Some(TaskStatus::Blocked));

        let stored = harness
            .checkpoints
            .list_for_task("task-1")
            .expect("list")
            .into_iter()
            .find(|checkpoint| checkpoint.id == summary.checkpoint_id)
            .expect("stored");
        assert_eq!(stored.task_status, Some(TaskStatus::Blocked));
        assert_eq!(
            harness.engine.status(&started.iteration_id).expect("status").state,
            SessionState::Running
        );
    }
}
