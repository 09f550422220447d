//! Checkpoint persistence.
//!
//! Checkpoints are append-only. Each append gets the next store-wide sequence
//! number, and appends to a session series are fenced on the series head so a
//! concurrent writer surfaces as [`EngineError::StaleSequence`] instead of a
//! lost update.
//!
//! Nested structures (config, history, agent context, subtasks) are stored as
//! JSON strings in each row. [`CheckpointRow`] is the only place that knows
//! about that encoding.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{FileLock, write_atomic};
use crate::core::checkpoint::{Checkpoint, Phase, Trigger};
use crate::core::types::TaskStatus;
use crate::error::EngineError;

pub trait CheckpointStore {
    /// Persist `checkpoint` and return it with its assigned sequence.
    ///
    /// For session checkpoints, `expected_head` must equal the sequence of the
    /// series' latest stored checkpoint (`None` for a new series).
    fn append(&self, checkpoint: Checkpoint, expected_head: Option<u64>) -> Result<Checkpoint>;

    /// Latest checkpoint of a session series, expired or not.
    fn latest_for_iteration(&self, iteration_id: &str) -> Result<Option<Checkpoint>>;

    /// All checkpoints of a task in ascending sequence order, expired included.
    fn list_for_task(&self, task_id: &str) -> Result<Vec<Checkpoint>>;

    /// Delete checkpoints whose expiry is at or before `now`. Returns the count removed.
    ///
    /// A session series whose head has expired is removed whole, so an older
    /// row of it never becomes the head again.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// On-disk row: scalar columns plus JSON-encoded nested fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CheckpointRow {
    id: String,
    sequence: u64,
    iteration_id: Option<String>,
    task_id: String,
    phase: String,
    step: Option<u32>,
    trigger: String,
    config_json: Option<String>,
    history_json: String,
    agent_context_json: Option<String>,
    draft_content: Option<String>,
    draft_type: Option<String>,
    task_status: Option<TaskStatus>,
    task_notes: Option<String>,
    subtask_states_json: String,
    completion_promise: Option<String>,
    work_product_id: Option<String>,
    close_reason: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl CheckpointRow {
    fn encode(checkpoint: &Checkpoint) -> Result<Self> {
        Ok(Self {
            id: checkpoint.id.clone(),
            sequence: checkpoint.sequence,
            iteration_id: checkpoint.iteration_id.clone(),
            task_id: checkpoint.task_id.clone(),
            phase: checkpoint.phase.as_str().to_string(),
            step: checkpoint.step,
            trigger: checkpoint.trigger.as_str().to_string(),
            config_json: checkpoint
                .config
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("encode session config")?,
            history_json: serde_json::to_string(&checkpoint.history)
                .context("encode history")?,
            agent_context_json: checkpoint
                .agent_context
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("encode agent context")?,
            draft_content: checkpoint.draft_content.clone(),
            draft_type: checkpoint.draft_type.clone(),
            task_status: checkpoint.task_status,
            task_notes: checkpoint.task_notes.clone(),
            subtask_states_json: serde_json::to_string(&checkpoint.subtask_states)
                .context("encode subtask states")?,
            completion_promise: checkpoint.completion_promise.clone(),
            work_product_id: checkpoint.work_product_id.clone(),
            close_reason: checkpoint.close_reason.clone(),
            created_at: checkpoint.created_at,
            expires_at: checkpoint.expires_at,
        })
    }

    fn decode(&self) -> Result<Checkpoint> {
        let context = || format!("decode checkpoint {}", self.id);
        Ok(Checkpoint {
            id: self.id.clone(),
            sequence: self.sequence,
            iteration_id: self.iteration_id.clone(),
            task_id: self.task_id.clone(),
            phase: Phase::parse(&self.phase)
                .ok_or_else(|| anyhow!("unknown phase '{}'", self.phase))
                .with_context(context)?,
            step: self.step,
            trigger: Trigger::parse(&self.trigger)
                .ok_or_else(|| anyhow!("unknown trigger '{}'", self.trigger))
                .with_context(context)?,
            config: self
                .config_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .with_context(context)?,
            history: serde_json::from_str(&self.history_json).with_context(context)?,
            agent_context: self
                .agent_context_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .with_context(context)?,
            draft_content: self.draft_content.clone(),
            draft_type: self.draft_type.clone(),
            task_status: self.task_status,
            task_notes: self.task_notes.clone(),
            subtask_states: serde_json::from_str(&self.subtask_states_json)
                .with_context(context)?,
            completion_promise: self.completion_promise.clone(),
            work_product_id: self.work_product_id.clone(),
            close_reason: self.close_reason.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}

/// The whole table, shared by both store implementations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CheckpointTable {
    next_sequence: u64,
    rows: Vec<CheckpointRow>,
}

impl Default for CheckpointTable {
    fn default() -> Self {
        Self {
            next_sequence: 1,
            rows: Vec::new(),
        }
    }
}

impl CheckpointTable {
    fn head(&self, iteration_id: &str) -> Option<u64> {
        self.rows
            .iter()
            .filter(|row| row.iteration_id.as_deref() == Some(iteration_id))
            .map(|row| row.sequence)
            .max()
    }

    fn append(&mut self, mut checkpoint: Checkpoint, expected_head: Option<u64>) -> Result<Checkpoint> {
        if let Some(iteration_id) = checkpoint.iteration_id.as_deref() {
            let found = self.head(iteration_id);
            if found != expected_head {
                return Err(EngineError::StaleSequence {
                    iteration_id: iteration_id.to_string(),
                    expected: expected_head,
                    found,
                }
                .into());
            }
        }
        if self.rows.iter().any(|row| row.id == checkpoint.id) {
            return Err(anyhow!("checkpoint id {} already exists", checkpoint.id));
        }
        checkpoint.sequence = self.next_sequence;
        self.rows.push(CheckpointRow::encode(&checkpoint)?);
        self.next_sequence += 1;
        debug!(
            checkpoint_id = %checkpoint.id,
            sequence = checkpoint.sequence,
            phase = checkpoint.phase.as_str(),
            "checkpoint appended"
        );
        Ok(checkpoint)
    }

    fn latest_for_iteration(&self, iteration_id: &str) -> Result<Option<Checkpoint>> {
        self.rows
            .iter()
            .filter(|row| row.iteration_id.as_deref() == Some(iteration_id))
            .max_by_key(|row| row.sequence)
            .map(CheckpointRow::decode)
            .transpose()
    }

    fn list_for_task(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        let mut rows: Vec<&CheckpointRow> =
            self.rows.iter().filter(|row| row.task_id == task_id).collect();
        rows.sort_by_key(|row| row.sequence);
        rows.into_iter().map(CheckpointRow::decode).collect()
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut heads: BTreeMap<&str, &CheckpointRow> = BTreeMap::new();
        for row in &self.rows {
            if let Some(iteration_id) = row.iteration_id.as_deref() {
                heads
                    .entry(iteration_id)
                    .and_modify(|head| {
                        if row.sequence > head.sequence {
                            *head = row;
                        }
                    })
                    .or_insert(row);
            }
        }
        let dead_series: Vec<String> = heads
            .into_iter()
            .filter(|(_, head)| head.expires_at <= now)
            .map(|(iteration_id, _)| iteration_id.to_string())
            .collect();

        let before = self.rows.len();
        self.rows.retain(|row| {
            let series_dead = row
                .iteration_id
                .as_ref()
                .is_some_and(|iteration_id| dead_series.contains(iteration_id));
            row.expires_at > now && !series_dead
        });
        before - self.rows.len()
    }
}

/// File-backed store in a single JSON document.
///
/// Every call holds an exclusive lock on `<path>.lock` and commits mutations
/// by temp file + rename, so separate processes sharing the file see each
/// other's appends and the sequence fence holds between them.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<CheckpointTable> {
        if !self.path.exists() {
            return Ok(CheckpointTable::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read checkpoints {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse checkpoints {}", self.path.display()))
    }

    fn save(&self, table: &CheckpointTable) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(table).context("serialize checkpoints")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut CheckpointTable) -> Result<(T, bool)>) -> Result<T> {
        let _lock = FileLock::exclusive(&self.path)?;
        let mut table = self.load()?;
        let (value, dirty) = f(&mut table)?;
        if dirty {
            self.save(&table)?;
        }
        Ok(value)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn append(&self, checkpoint: Checkpoint, expected_head: Option<u64>) -> Result<Checkpoint> {
        self.with_table(|table| Ok((table.append(checkpoint, expected_head)?, true)))
    }

    fn latest_for_iteration(&self, iteration_id: &str) -> Result<Option<Checkpoint>> {
        self.with_table(|table| Ok((table.latest_for_iteration(iteration_id)?, false)))
    }

    fn list_for_task(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        self.with_table(|table| Ok((table.list_for_task(task_id)?, false)))
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_table(|table| {
            let removed = table.purge_expired(now);
            Ok((removed, removed > 0))
        })
    }
}

/// In-memory store with the same semantics; clones share one table.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    table: Arc<Mutex<CheckpointTable>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut CheckpointTable) -> Result<T>) -> Result<T> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| anyhow!("checkpoint store lock poisoned"))?;
        f(&mut table)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn append(&self, checkpoint: Checkpoint, expected_head: Option<u64>) -> Result<Checkpoint> {
        self.with_table(|table| table.append(checkpoint, expected_head))
    }

    fn latest_for_iteration(&self, iteration_id: &str) -> Result<Option<Checkpoint>> {
        self.with_table(|table| table.latest_for_iteration(iteration_id))
    }

    fn list_for_task(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        self.with_table(|table| table.list_for_task(task_id))
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_table(|table| Ok(table.purge_expired(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checkpoint::{AgentContext, HistoryEntry, PausedBy};
    use crate::core::types::{SubtaskState, ValidationSummary};
    use crate::error::engine_error;
    use crate::test_support::session_checkpoint;
    use chrono::Duration;

    fn rich_checkpoint(now: DateTime<Utc>) -> Checkpoint {
        let mut checkpoint = session_checkpoint("task-1", "iter-1", 2, now);
        checkpoint.history.push(HistoryEntry {
            iteration: 1,
            timestamp: now,
            checkpoint_id: "cp-prev".to_string(),
            validation_summary: Some(ValidationSummary {
                passed: false,
                total: 2,
                failed: 1,
                failed_rules: vec!["tests".to_string()],
            }),
        });
        checkpoint.agent_context = Some(AgentContext {
            pause_reason: "lunch".to_string(),
            paused_by: PausedBy::User,
            paused_at: now,
            next_steps: vec!["finish parser".to_string()],
            blockers: Vec::new(),
            key_files: vec!["src/lib.rs".to_string()],
        });
        checkpoint.subtask_states = vec![SubtaskState {
            id: "sub-1".to_string(),
            status: TaskStatus::Completed,
        }];
        checkpoint
    }

    #[test]
    fn file_store_persists_nested_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/checkpoints.json");
        let now = Utc::now();
        let original = rich_checkpoint(now);

        let stored = FileCheckpointStore::new(&path)
            .append(original.clone(), None)
            .expect("append");
        assert_eq!(stored.sequence, 1);

        let reopened = FileCheckpointStore::new(&path);
        let loaded = reopened
            .latest_for_iteration("iter-1")
            .expect("load")
            .expect("present");
        assert_eq!(loaded, Checkpoint { sequence: 1, ..original });

        let raw = fs::read_to_string(&path).expect("read raw");
        assert!(raw.contains("\"history_json\""));
        let mut names: Vec<String> = fs::read_dir(temp.path().join("state"))
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["checkpoints.json", "checkpoints.json.lock"]);
    }

    #[test]
    fn sequences_are_store_wide_and_lists_ascend() {
        let store = MemoryCheckpointStore::new();
        let now = Utc::now();
        let first = store
            .append(session_checkpoint("task-1", "iter-1", 1, now), None)
            .expect("first");
        let mut other = session_checkpoint("task-2", "iter-2", 1, now);
        other.id = "cp-other".to_string();
        store.append(other, None).expect("other");
        let mut second = session_checkpoint("task-1", "iter-1", 2, now);
        second.id = "cp-second".to_string();
        let second = store.append(second, Some(first.sequence)).expect("second");

        assert_eq!(second.sequence, 3);
        let listed = store.list_for_task("task-1").expect("list");
        let sequences: Vec<u64> = listed.iter().map(|cp| cp.sequence).collect();
        assert_eq!(sequences, vec![1, 3]);
    }

    #[test]
    fn append_with_stale_head_is_rejected() {
        let store = MemoryCheckpointStore::new();
        let now = Utc::now();
        let head = store
            .append(session_checkpoint("task-1", "iter-1", 1, now), None)
            .expect("head");

        let mut a = session_checkpoint("task-1", "iter-1", 2, now);
        a.id = "cp-a".to_string();
        store.append(a, Some(head.sequence)).expect("first writer wins");

        let mut b = session_checkpoint("task-1", "iter-1", 2, now);
        b.id = "cp-b".to_string();
        let err = store.append(b, Some(head.sequence)).unwrap_err();
        assert!(matches!(
            engine_error(&err),
            Some(EngineError::StaleSequence { .. })
        ));
        assert_eq!(store.list_for_task("task-1").expect("list").len(), 2);
    }

    #[test]
    fn standalone_checkpoints_are_not_fenced() {
        let store = MemoryCheckpointStore::new();
        let now = Utc::now();
        let mut standalone = session_checkpoint("task-1", "unused", 1, now);
        standalone.iteration_id = None;
        standalone.step = None;
        store.append(standalone, Some(42)).expect("append");
    }

    #[test]
    fn purge_removes_only_expired_rows() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileCheckpointStore::new(temp.path().join("checkpoints.json"));
        let now = Utc::now();
        let mut old = session_checkpoint("task-1", "iter-old", 1, now);
        old.id = "cp-old".to_string();
        old.expires_at = now - Duration::seconds(1);
        store.append(old, None).expect("old");
        store
            .append(session_checkpoint("task-1", "iter-new", 1, now), None)
            .expect("new");

        assert_eq!(store.purge_expired(now).expect("purge"), 1);
        assert_eq!(store.purge_expired(now).expect("purge again"), 0);
        let remaining = store.list_for_task("task-1").expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].iteration_id.as_deref(), Some("iter-new"));
    }

    #[test]
    fn purge_drops_a_dead_series_whole() {
        let store = MemoryCheckpointStore::new();
        let now = Utc::now();
        let mut paused = session_checkpoint("task-1", "iter-1", 1, now);
        paused.id = "cp-paused".to_string();
        paused.expires_at = now + Duration::days(7);
        let paused = store.append(paused, None).expect("paused");
        let mut head = session_checkpoint("task-1", "iter-1", 2, now);
        head.id = "cp-head".to_string();
        head.expires_at = now + Duration::days(1);
        store.append(head, Some(paused.sequence)).expect("head");
        let mut live = session_checkpoint("task-1", "iter-live", 1, now);
        live.id = "cp-live".to_string();
        live.expires_at = now + Duration::days(7);
        store.append(live, None).expect("live");

        let later = now + Duration::days(2);
        assert_eq!(store.purge_expired(later).expect("purge"), 2);
        assert!(store.latest_for_iteration("iter-1").expect("load").is_none());
        assert!(store.latest_for_iteration("iter-live").expect("load").is_some());
    }

    #[test]
    fn purge_keeps_a_live_series_head() {
        let store = MemoryCheckpointStore::new();
        let now = Utc::now();
        let mut first = session_checkpoint("task-1", "iter-1", 1, now);
        first.id = "cp-first".to_string();
        first.expires_at = now + Duration::hours(1);
        let first = store.append(first, None).expect("first");
        let mut head = session_checkpoint("task-1", "iter-1", 2, now);
        head.id = "cp-head".to_string();
        head.expires_at = now + Duration::days(1);
        store.append(head, Some(first.sequence)).expect("head");

        assert_eq!(store.purge_expired(now + Duration::hours(2)).expect("purge"), 1);
        let head = store
            .latest_for_iteration("iter-1")
            .expect("load")
            .expect("present");
        assert_eq!(head.id, "cp-head");
    }

    #[test]
    fn independent_file_stores_do_not_lose_appends() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("checkpoints.json");
        let now = Utc::now();

        let handles: Vec<_> = (0..8)
            .map(|writer| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = FileCheckpointStore::new(path);
                    for n in 0..10 {
                        let mut checkpoint = session_checkpoint("task-1", "unused", 1, now);
                        checkpoint.id = format!("cp-{writer}-{n}");
                        checkpoint.iteration_id = None;
                        checkpoint.step = None;
                        store.append(checkpoint, None).expect("append");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        let stored = FileCheckpointStore::new(&path)
            .list_for_task("task-1")
            .expect("list");
        assert_eq!(stored.len(), 80);
        let sequences: Vec<u64> = stored.iter().map(|cp| cp.sequence).collect();
        assert_eq!(sequences, (1..=80).collect::<Vec<u64>>());
    }

    #[test]
    fn fence_holds_between_independent_file_stores() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("checkpoints.json");
        let now = Utc::now();
        let head = FileCheckpointStore::new(&path)
            .append(session_checkpoint("task-1", "iter-1", 1, now), None)
            .expect("head");

        let handles: Vec<_> = (0..4)
            .map(|writer| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut next = session_checkpoint("task-1", "iter-1", 2, now);
                    next.id = format!("cp-next-{writer}");
                    FileCheckpointStore::new(path)
                        .append(next, Some(head.sequence))
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().expect("writer thread"))
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(
            FileCheckpointStore::new(&path)
                .list_for_task("task-1")
                .expect("list")
                .len(),
            2
        );
    }
}
