//! CLI tests for the session commands.
//!
//! Spawns the checkloop binary against a temp project and checks stdout JSON
//! and exit codes.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use checkloop::exit_codes;
use checkloop::io::init::{InitOptions, init_engine};
use serde_json::Value;

fn checkloop(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_checkloop"))
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .expect("run checkloop")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout json")
}

fn start(root: &Path, task: &str, max: &str) -> String {
    let output = checkloop(
        root,
        &["start", "--task", task, "--max-iterations", max, "--check", "ok=true"],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    stdout_json(&output)["iterationId"]
        .as_str()
        .expect("iterationId")
        .to_string()
}

#[test]
fn init_twice_requires_force() {
    let temp = tempfile::tempdir().expect("tempdir");
    assert_eq!(
        checkloop(temp.path(), &["init"]).status.code(),
        Some(exit_codes::OK)
    );
    assert_eq!(
        checkloop(temp.path(), &["init"]).status.code(),
        Some(exit_codes::INVALID)
    );
    assert_eq!(
        checkloop(temp.path(), &["init", "--force"]).status.code(),
        Some(exit_codes::OK)
    );
}

#[test]
fn validate_exit_code_follows_the_signal() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_engine(temp.path(), &InitOptions { force: false }).expect("init");
    let id = start(temp.path(), "task-1", "3");

    let plain = temp.path().join("plain.txt");
    fs::write(&plain, "still working").expect("write output");
    let output = checkloop(
        temp.path(),
        &["validate", "--iteration", &id, "--output", plain.to_str().expect("utf8")],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let response = stdout_json(&output);
    assert_eq!(response["validationPassed"], Value::Bool(true));
    assert_eq!(response["completionSignal"], "CONTINUE");

    let output = checkloop(
        temp.path(),
        &[
            "validate",
            "--iteration",
            &id,
            "--output",
            plain.to_str().expect("utf8"),
            "--prompt",
        ],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let prompt = stdout_json(&output)["hookDecision"]["nextPrompt"]
        .as_str()
        .expect("nextPrompt")
        .to_string();
    assert!(prompt.starts_with("Iteration 1 of 3 finished; 2 remaining."), "{prompt}");

    let done = temp.path().join("done.txt");
    fs::write(&done, "finished <promise>COMPLETE</promise>").expect("write output");
    let output = checkloop(
        temp.path(),
        &["validate", "--iteration", &id, "--output", done.to_str().expect("utf8")],
    );
    assert_eq!(output.status.code(), Some(exit_codes::COMPLETE));

    let output = checkloop(
        temp.path(),
        &["complete", "--iteration", &id, "--promise", "<promise>COMPLETE</promise>"],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&output)["taskStatus"], "completed");

    let output = checkloop(temp.path(), &["status", "--iteration", &id]);
    assert_eq!(stdout_json(&output)["state"], "completed");
}

#[test]
fn next_past_the_limit_exits_with_limit_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_engine(temp.path(), &InitOptions { force: false }).expect("init");
    let id = start(temp.path(), "task-1", "1");

    let output = checkloop(temp.path(), &["next", "--iteration", &id]);
    assert_eq!(output.status.code(), Some(exit_codes::LIMIT_EXCEEDED));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Maximum iterations (1) reached"), "{stderr}");
}

#[test]
fn second_start_points_at_resume_or_abandon() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_engine(temp.path(), &InitOptions { force: false }).expect("init");
    let id = start(temp.path(), "task-1", "3");

    let output = checkloop(temp.path(), &["start", "--task", "task-1"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("iteration_abandon"), "{stderr}");

    let output = checkloop(
        temp.path(),
        &["abandon", "--iteration", &id, "--reason", "restart"],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    start(temp.path(), "task-1", "3");
}

#[test]
fn pause_then_resume_prints_the_draft() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_engine(temp.path(), &InitOptions { force: false }).expect("init");
    let draft = temp.path().join("draft.md");
    fs::write(&draft, "partial impl").expect("write draft");

    let output = checkloop(
        temp.path(),
        &[
            "pause",
            "--task",
            "task-9",
            "--reason",
            "handoff",
            "--draft-file",
            draft.to_str().expect("utf8"),
            "--next-step",
            "wire the parser",
        ],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));

    let output = checkloop(temp.path(), &["resume", "--task", "task-9"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let state = stdout_json(&output);
    assert_eq!(state["hasDraft"], Value::Bool(true));
    assert_eq!(state["draftContent"], "partial impl");
    assert_eq!(state["agentContext"]["nextSteps"][0], "wire the parser");

    let output = checkloop(temp.path(), &["resume", "--task", "task-unknown"]);
    assert_eq!(stdout_json(&output), Value::Null);
}
