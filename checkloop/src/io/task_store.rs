//! Task collaborator: the engine reads task snapshots and writes task status.
//!
//! Tasks are owned elsewhere; the file-backed store is a minimal local stand-in
//! kept in `.checkloop/state/tasks.json`.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{FileLock, write_atomic};
use crate::core::types::{TaskSnapshot, TaskStatus};

pub trait TaskStore {
    fn snapshot(&self, task_id: &str) -> Result<Option<TaskSnapshot>>;

    /// Set a task's status, creating a bare task record if none exists.
    fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<()>;

    /// Number of work-product artifacts recorded against a task.
    fn artifact_count(&self, task_id: &str) -> Result<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(flatten)]
    pub snapshot: TaskSnapshot,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: BTreeMap<String, TaskRecord>,
}

impl TaskFile {
    fn set_status(&mut self, task_id: &str, status: TaskStatus) {
        self.tasks
            .entry(task_id.to_string())
            .and_modify(|record| record.snapshot.status = status)
            .or_insert_with(|| TaskRecord {
                snapshot: TaskSnapshot::new(task_id, status),
                artifacts: Vec::new(),
            });
    }
}

/// File-backed task store; each call holds the `<path>.lock` advisory lock.
#[derive(Debug)]
pub struct FileTaskStore {
    path: PathBuf,
}

impl FileTaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Insert or replace a task record.
    pub fn put(&self, record: TaskRecord) -> Result<()> {
        let _guard = self.guard()?;
        let mut file = self.load()?;
        file.tasks.insert(record.snapshot.id.clone(), record);
        self.save(&file)
    }

    fn guard(&self) -> Result<FileLock> {
        FileLock::exclusive(&self.path)
    }

    fn load(&self) -> Result<TaskFile> {
        if !self.path.exists() {
            return Ok(TaskFile::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read tasks {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse tasks {}", self.path.display()))
    }

    fn save(&self, file: &TaskFile) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(file).context("serialize tasks")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }
}

impl TaskStore for FileTaskStore {
    fn snapshot(&self, task_id: &str) -> Result<Option<TaskSnapshot>> {
        let _guard = self.guard()?;
        Ok(self
            .load()?
            .tasks
            .get(task_id)
            .map(|record| record.snapshot.clone()))
    }

    fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let _guard = self.guard()?;
        let mut file = self.load()?;
        file.set_status(task_id, status);
        debug!(task_id, status = status.as_str(), "task status updated");
        self.save(&file)
    }

    fn artifact_count(&self, task_id: &str) -> Result<usize> {
        let _guard = self.guard()?;
        Ok(self
            .load()?
            .tasks
            .get(task_id)
            .map_or(0, |record| record.artifacts.len()))
    }
}

/// In-memory task store; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryTaskStore {
    file: Arc<Mutex<TaskFile>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, snapshot: TaskSnapshot) -> Result<()> {
        self.with_file(|file| {
            file.tasks.insert(
                snapshot.id.clone(),
                TaskRecord {
                    snapshot,
                    artifacts: Vec::new(),
                },
            );
        })
    }

    pub fn add_artifact(&self, task_id: &str, artifact: impl Into<String>) -> Result<()> {
        let artifact = artifact.into();
        self.with_file(|file| {
            if let Some(record) = file.tasks.get_mut(task_id) {
                record.artifacts.push(artifact);
            }
        })
    }

    fn with_file<T>(&self, f: impl FnOnce(&mut TaskFile) -> T) -> Result<T> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("task store lock poisoned"))?;
        Ok(f(&mut file))
    }
}

impl TaskStore for MemoryTaskStore {
    fn snapshot(&self, task_id: &str) -> Result<Option<TaskSnapshot>> {
        self.with_file(|file| file.tasks.get(task_id).map(|record| record.snapshot.clone()))
    }

    fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        self.with_file(|file| file.set_status(task_id, status))
    }

    fn artifact_count(&self, task_id: &str) -> Result<usize> {
        self.with_file(|file| {
            file.tasks
                .get(task_id)
                .map_or(0, |record| record.artifacts.len())
        })
    }
}
