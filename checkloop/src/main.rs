//! `checkloop` command-line driver.
//!
//! Each subcommand performs one engine operation against the project at
//! `--root` and prints its result as JSON on stdout. Exit codes are listed in
//! [`checkloop::exit_codes`].

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;

use checkloop::core::checkpoint::PausedBy;
use checkloop::core::continuation::ContinuationPromptHook;
use checkloop::core::hooks::HookSelector;
use checkloop::core::promises::default_promises;
use checkloop::core::types::{CompletionSignal, TaskStatus, ValidationRule, ValidationSummary};
use checkloop::error::{EngineError, engine_error};
use checkloop::exit_codes;
use checkloop::io::init::{InitOptions, init_engine};
use checkloop::logging;
use checkloop::pause::PauseRequest;
use checkloop::session::{IterationEngine, StartRequest};

#[derive(Parser)]
#[command(
    name = "checkloop",
    version,
    about = "Bounded, resumable, validated iteration loops"
)]
struct Cli {
    /// Project root containing `.checkloop/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.checkloop/` with a default config.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Open an iteration session for a task.
    Start {
        #[arg(long)]
        task: String,
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Completion promise; repeat for several. Defaults to COMPLETE and BLOCKED.
        #[arg(long = "promise")]
        promises: Vec<String>,
        /// JSON file holding an array of validation rules.
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Inline command rule as `name=command`; repeat for several.
        #[arg(long = "check", value_parser = parse_check)]
        checks: Vec<ValidationRule>,
        #[arg(long)]
        breaker_threshold: Option<u32>,
    },
    /// Validate the current iteration's agent output.
    Validate {
        #[arg(long)]
        iteration: String,
        /// File with the agent output; stdin when omitted.
        #[arg(long)]
        output: Option<PathBuf>,
        /// JSON file passed to stop hooks as metadata.
        #[arg(long)]
        metadata: Option<PathBuf>,
        /// Attach a rendered next-iteration prompt to the hook decision.
        #[arg(long)]
        prompt: bool,
    },
    /// Record the current iteration in history and open the next one.
    Next {
        #[arg(long)]
        iteration: String,
        /// JSON validation summary; defaults to the one recorded by `validate`.
        #[arg(long)]
        summary: Option<PathBuf>,
    },
    /// Close the session with a completion promise.
    Complete {
        #[arg(long)]
        iteration: String,
        #[arg(long)]
        promise: String,
        #[arg(long)]
        work_product: Option<String>,
    },
    /// Close the session without changing the task.
    Abandon {
        #[arg(long)]
        iteration: String,
        #[arg(long, default_value = "abandoned by driver")]
        reason: String,
    },
    /// Show a session's state and history.
    Status {
        #[arg(long)]
        iteration: String,
    },
    /// Record a manual pause with optional draft and notes.
    Pause {
        #[arg(long)]
        task: String,
        #[arg(long)]
        reason: String,
        #[arg(long, value_enum, default_value_t = PausedByArg::User)]
        by: PausedByArg,
        /// File whose contents are kept as the draft.
        #[arg(long)]
        draft_file: Option<PathBuf>,
        #[arg(long)]
        draft_type: Option<String>,
        #[arg(long = "next-step")]
        next_steps: Vec<String>,
        #[arg(long = "blocker")]
        blockers: Vec<String>,
        #[arg(long = "key-file")]
        key_files: Vec<String>,
    },
    /// Print the state to resume a task from, or `null`.
    Resume {
        #[arg(long)]
        task: String,
    },
    /// List a task's live checkpoints, newest first.
    Checkpoints {
        #[arg(long)]
        task: String,
    },
    /// Delete expired checkpoints.
    Purge,
    /// Run a task's quality gates.
    Gates {
        #[arg(long)]
        task: String,
    },
    /// Check whether a task may be marked complete.
    CheckCompletion {
        #[arg(long)]
        task: String,
        /// Also require a recorded work product.
        #[arg(long)]
        require_proof: bool,
    },
    /// Change a task's status and record a checkpoint of it.
    TaskStatus {
        #[arg(long)]
        task: String,
        #[arg(long, value_enum)]
        status: StatusArg,
    },
    /// Record an automatic checkpoint of a task's current state.
    Snapshot {
        #[arg(long)]
        task: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PausedByArg {
    User,
    System,
}

impl From<PausedByArg> for PausedBy {
    fn from(value: PausedByArg) -> Self {
        match value {
            PausedByArg::User => PausedBy::User,
            PausedByArg::System => PausedBy::System,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StatusArg {
    Pending,
    InProgress,
    Blocked,
    Completed,
}

impl From<StatusArg> for TaskStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Pending => TaskStatus::Pending,
            StatusArg::InProgress => TaskStatus::InProgress,
            StatusArg::Blocked => TaskStatus::Blocked,
            StatusArg::Completed => TaskStatus::Completed,
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match engine_error(err) {
        Some(EngineError::IterationLimitExceeded { .. }) => exit_codes::LIMIT_EXCEEDED,
        _ => exit_codes::INVALID,
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => {
            let paths = init_engine(&cli.root, &InitOptions { force })?;
            println!("initialized {}", paths.engine_dir.display());
            Ok(exit_codes::OK)
        }
        command => {
            let mut engine = IterationEngine::open(&cli.root)?;
            if let Command::Validate { prompt: true, .. } = &command {
                engine
                    .hooks_mut()
                    .register(HookSelector::Any, ContinuationPromptHook::new()?);
            }
            run_engine(&engine, command)
        }
    }
}

fn run_engine(engine: &IterationEngine, command: Command) -> Result<i32> {
    match command {
        Command::Init { .. } => Ok(exit_codes::OK),
        Command::Start {
            task,
            max_iterations,
            promises,
            rules,
            checks,
            breaker_threshold,
        } => {
            let mut validation_rules: Vec<ValidationRule> = match rules {
                Some(path) => read_json(&path)?,
                None => Vec::new(),
            };
            validation_rules.extend(checks);
            let response = engine.start(StartRequest {
                task_id: task,
                max_iterations,
                completion_promises: if promises.is_empty() {
                    default_promises()
                } else {
                    promises
                },
                validation_rules,
                circuit_breaker_threshold: breaker_threshold,
            })?;
            print_json(&response)?;
            Ok(exit_codes::OK)
        }
        Command::Validate {
            iteration,
            output,
            metadata,
            ..
        } => {
            let agent_output = read_agent_output(output.as_deref())?;
            let metadata: Option<Value> = metadata.as_deref().map(read_json).transpose()?;
            let response =
                engine.validate_with_metadata(&iteration, &agent_output, metadata.as_ref())?;
            print_json(&response)?;
            Ok(match response.completion_signal {
                CompletionSignal::Continue => exit_codes::OK,
                CompletionSignal::Complete => exit_codes::COMPLETE,
                CompletionSignal::Blocked => exit_codes::BLOCKED,
            })
        }
        Command::Next { iteration, summary } => {
            let summary: Option<ValidationSummary> =
                summary.as_deref().map(read_json).transpose()?;
            print_json(&engine.next(&iteration, summary)?)?;
            Ok(exit_codes::OK)
        }
        Command::Complete {
            iteration,
            promise,
            work_product,
        } => {
            print_json(&engine.complete(&iteration, &promise, work_product.as_deref())?)?;
            Ok(exit_codes::OK)
        }
        Command::Abandon { iteration, reason } => {
            print_json(&engine.abandon(&iteration, &reason)?)?;
            Ok(exit_codes::OK)
        }
        Command::Status { iteration } => {
            print_json(&engine.status(&iteration)?)?;
            Ok(exit_codes::OK)
        }
        Command::Pause {
            task,
            reason,
            by,
            draft_file,
            draft_type,
            next_steps,
            blockers,
            key_files,
        } => {
            let draft_content = draft_file
                .as_deref()
                .map(|path| {
                    fs::read_to_string(path)
                        .with_context(|| format!("read draft {}", path.display()))
                })
                .transpose()?;
            let response = engine.pause(PauseRequest {
                draft_content,
                draft_type,
                next_steps,
                blockers,
                key_files,
                ..PauseRequest::new(task, reason, by.into())
            })?;
            print_json(&response)?;
            Ok(exit_codes::OK)
        }
        Command::Resume { task } => {
            print_json(&engine.resume(&task)?)?;
            Ok(exit_codes::OK)
        }
        Command::Checkpoints { task } => {
            print_json(&engine.list_checkpoints(&task)?)?;
            Ok(exit_codes::OK)
        }
        Command::Purge => {
            let purged = engine.purge_expired()?;
            print_json(&serde_json::json!({ "purged": purged }))?;
            Ok(exit_codes::OK)
        }
        Command::Gates { task } => {
            let report = engine.run_quality_gates(&task)?;
            print_json(&report)?;
            Ok(if report.all_passed {
                exit_codes::OK
            } else {
                exit_codes::BLOCKED
            })
        }
        Command::CheckCompletion {
            task,
            require_proof,
        } => {
            let verdict = engine.check_completion(&task, require_proof)?;
            print_json(&verdict)?;
            Ok(if verdict.allowed {
                exit_codes::OK
            } else {
                exit_codes::BLOCKED
            })
        }
        Command::TaskStatus { task, status } => {
            print_json(&engine.set_task_status(&task, status.into())?)?;
            Ok(exit_codes::OK)
        }
        Command::Snapshot { task } => {
            print_json(&engine.create_auto_checkpoint(&task)?)?;
            Ok(exit_codes::OK)
        }
    }
}

fn parse_check(raw: &str) -> Result<ValidationRule, String> {
    let (name, command) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=command, got '{raw}'"))?;
    if name.trim().is_empty() || command.trim().is_empty() {
        return Err(format!("expected name=command, got '{raw}'"));
    }
    Ok(ValidationRule::command(name.trim(), command))
}

fn read_agent_output(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("read agent output {}", path.display()))
        }
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read agent output from stdin")?;
            Ok(buf)
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("encode output")?;
    println!("{out}");
    Ok(())
}
