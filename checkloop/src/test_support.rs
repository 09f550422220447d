//! Test-only fakes and builders: a scripted command runner, a manual clock and
//! an engine wired to in-memory stores.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use crate::core::checkpoint::{Checkpoint, Phase, SessionConfig, Trigger};
use crate::core::promises::default_promises;
use crate::core::types::{TaskSnapshot, TaskStatus};
use crate::io::checkpoint_store::MemoryCheckpointStore;
use crate::io::clock::Clock;
use crate::io::config::EngineConfig;
use crate::io::init::EnginePaths;
use crate::io::runner::{CommandOutcome, CommandRunner, CommandSpec};
use crate::io::task_store::{MemoryTaskStore, TaskStore};
use crate::session::{IterationEngine, StartRequest};

type Scripted = Result<CommandOutcome, String>;

/// Replays queued outcomes in order and records every spec it was asked to run.
/// Once the queue is empty every command exits 0.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRunner {
    queue: Arc<Mutex<VecDeque<Scripted>>>,
    calls: Arc<Mutex<Vec<CommandSpec>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, outcome: CommandOutcome) -> Self {
        self.push(outcome);
        self
    }

    pub fn then_spawn_error(self, message: &str) -> Self {
        self.queue
            .lock()
            .expect("runner queue")
            .push_back(Err(message.to_string()));
        self
    }

    pub fn push(&self, outcome: CommandOutcome) {
        self.queue.lock().expect("runner queue").push_back(Ok(outcome));
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().expect("runner calls").clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome> {
        self.calls.lock().expect("runner calls").push(spec.clone());
        match self.queue.lock().expect("runner queue").pop_front() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(CommandOutcome::exited(0)),
        }
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock")
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock");
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(fixed_start())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        ManualClock::now(self)
    }
}

/// 2026-01-01T00:00:00Z, the start of every `TestEngine` clock.
pub fn fixed_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .expect("valid timestamp")
}

/// A running session checkpoint at `step`, live for an hour from `now`.
pub fn session_checkpoint(
    task_id: &str,
    iteration_id: &str,
    step: u32,
    now: DateTime<Utc>,
) -> Checkpoint {
    Checkpoint {
        id: format!("cp-{iteration_id}-{step}"),
        sequence: 0,
        iteration_id: Some(iteration_id.to_string()),
        task_id: task_id.to_string(),
        phase: Phase::Implementation,
        step: Some(step),
        trigger: Trigger::Iteration,
        config: Some(SessionConfig {
            max_iterations: 10,
            completion_promises: default_promises(),
            validation_rules: Vec::new(),
            circuit_breaker_threshold: None,
        }),
        history: Vec::new(),
        agent_context: None,
        draft_content: None,
        draft_type: None,
        task_status: Some(TaskStatus::InProgress),
        task_notes: None,
        subtask_states: Vec::new(),
        completion_promise: None,
        work_product_id: None,
        close_reason: None,
        created_at: now,
        expires_at: now + Duration::hours(1),
    }
}

/// A start request with the default promises and no validation rules.
pub fn start_request(task_id: &str, max_iterations: u32) -> StartRequest {
    StartRequest {
        task_id: task_id.to_string(),
        max_iterations: Some(max_iterations),
        completion_promises: default_promises(),
        validation_rules: Vec::new(),
        circuit_breaker_threshold: None,
    }
}

/// An engine over in-memory stores, a scripted runner and a manual clock,
/// rooted in a temporary directory for validation logs.
pub struct TestEngine {
    pub engine: IterationEngine,
    pub runner: ScriptedRunner,
    pub clock: ManualClock,
    pub tasks: MemoryTaskStore,
    pub checkpoints: MemoryCheckpointStore,
    pub temp: TempDir,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedRunner::new();
        let clock = ManualClock::default();
        let tasks = MemoryTaskStore::new();
        let checkpoints = MemoryCheckpointStore::new();
        let engine = IterationEngine::new(
            EnginePaths::new(temp.path()),
            config,
            Box::new(checkpoints.clone()),
            Box::new(tasks.clone()),
            Box::new(runner.clone()),
            Box::new(clock.clone()),
        );
        Self {
            engine,
            runner,
            clock,
            tasks,
            checkpoints,
            temp,
        }
    }

    pub fn root(&self) -> &std::path::Path {
        self.temp.path()
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks
            .snapshot(task_id)
            .expect("task snapshot")
            .map(|task| task.status)
    }

    pub fn insert_task(&self, snapshot: TaskSnapshot) {
        self.tasks.insert(snapshot).expect("insert task");
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
