//! Command execution capability used by validation rules and quality gates.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;

use super::process::run_command_with_timeout;

/// A shell command to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// What happened when a command ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `None` when the process was killed by a signal (including on timeout).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

impl CommandOutcome {
    /// A finished run with the given exit code and no output.
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            timed_out: false,
            stdout_truncated: 0,
            stderr_truncated: 0,
        }
    }

    pub fn timed_out_after(duration: Duration) -> Self {
        Self {
            exit_code: None,
            duration,
            timed_out: true,
            ..Self::exited(0)
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }
}

/// Runs commands on behalf of the engine.
///
/// `Err` means the command could not be started at all; a non-zero exit or a
/// timeout is a successful run with that outcome.
pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome>;
}

/// Runs commands through `sh -c`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellCommandRunner;

impl CommandRunner for ShellCommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.working_dir)
            .envs(&spec.env);
        let output = run_command_with_timeout(cmd, spec.timeout, spec.output_limit_bytes)?;
        Ok(CommandOutcome {
            exit_code: if output.timed_out {
                None
            } else {
                output.status.code()
            },
            stdout: with_notice(&output.stdout, output.stdout_truncated, "stdout"),
            stderr: with_notice(&output.stderr, output.stderr_truncated, "stderr"),
            duration: output.elapsed,
            timed_out: output.timed_out,
            stdout_truncated: output.stdout_truncated,
            stderr_truncated: output.stderr_truncated,
        })
    }
}

fn with_notice(bytes: &[u8], truncated: usize, label: &str) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated > 0 {
        text.push_str(&format!("\n[{label} truncated {truncated} bytes]\n"));
    }
    text
}
