//! Child processes with a deadline and bounded captured output.
//!
//! Each child leads its own process group. On timeout the whole group is
//! killed, and the output readers get a short grace period before they are
//! detached, so descendants holding the pipes open cannot stall the caller.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const READ_CHUNK_BYTES: usize = 8 * 1024;
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Bytes kept from one stream plus how many were dropped past the limit.
#[derive(Debug, Default)]
struct Captured {
    kept: Vec<u8>,
    dropped: usize,
}

impl Captured {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.kept.len()).min(chunk.len());
        self.kept.extend_from_slice(&chunk[..room]);
        self.dropped += chunk.len() - room;
    }
}

/// One pipe drained on its own thread. `done` fires at EOF or on a read error.
struct Reader {
    name: &'static str,
    captured: Arc<Mutex<Captured>>,
    done: Receiver<Result<()>>,
}

/// Run `cmd` with stdin closed, killing its process group once `timeout` elapses.
///
/// Both pipes are drained on their own threads while the child runs; at most
/// `output_limit_bytes` of each are kept. A timed-out child is still a
/// successful run with `timed_out` set. `Err` means it never started.
#[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64, output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|err| {
        error!(err = %err, "failed to spawn command");
        anyhow::Error::new(err).context("spawn command")
    })?;
    debug!(pid = child.id(), "child process spawned");

    let stdout = spawn_reader(child.stdout.take(), output_limit_bytes, "stdout")?;
    let stderr = spawn_reader(child.stderr.take(), output_limit_bytes, "stderr")?;

    let (status, timed_out) = wait_or_kill(&mut child, timeout)?;
    let elapsed = started.elapsed();

    // Background descendants may still hold the pipes after the leader exits.
    let drain_by = if timed_out {
        Instant::now() + DRAIN_GRACE
    } else {
        (started + timeout).max(Instant::now()) + DRAIN_GRACE
    };
    let mut drained = drain(&stdout, drain_by)? && drain(&stderr, drain_by)?;
    if !drained {
        warn!("output pipes still open after the child exited, killing its group");
        kill_group(&mut child)?;
        let retry_by = Instant::now() + DRAIN_GRACE;
        drained = drain(&stdout, retry_by)? && drain(&stderr, retry_by)?;
        if !drained {
            warn!("detaching output readers that are still blocked");
        }
    }

    let stdout = take(&stdout)?;
    let stderr = take(&stderr)?;
    if stdout.dropped + stderr.dropped > 0 {
        warn!(
            stdout_truncated = stdout.dropped,
            stderr_truncated = stderr.dropped,
            "output truncated"
        );
    }

    debug!(
        exit_code = ?status.code(),
        timed_out,
        elapsed_ms = elapsed.as_millis() as u64,
        "child process finished"
    );
    Ok(CommandOutput {
        status,
        stdout: stdout.kept,
        stderr: stderr.kept,
        stdout_truncated: stdout.dropped,
        stderr_truncated: stderr.dropped,
        timed_out,
        elapsed,
    })
}

fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    if let Some(status) = child.wait_timeout(timeout).context("wait for command")? {
        return Ok((status, false));
    }
    warn!(timeout_ms = timeout.as_millis() as u64, "deadline passed, killing process group");
    kill_group(child)?;
    let status = child.wait().context("reap killed command")?;
    Ok((status, true))
}

/// SIGKILL the child's process group. A group that is already gone is fine.
fn kill_group(child: &mut Child) -> Result<()> {
    let pgid = i32::try_from(child.id()).context("child pid out of range")?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => {
            warn!(err = %err, "killpg failed, killing the child only");
            child.kill().context("kill timed-out command")
        }
    }
}

fn spawn_reader<R>(pipe: Option<R>, limit: usize, name: &'static str) -> Result<Reader>
where
    R: Read + Send + 'static,
{
    let mut pipe = pipe.ok_or_else(|| anyhow!("{name} was not piped"))?;
    let captured = Arc::new(Mutex::new(Captured::default()));
    let (tx, done) = mpsc::channel();
    let sink = Arc::clone(&captured);
    thread::spawn(move || {
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        let outcome = loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break Ok(()),
                Ok(read) => match sink.lock() {
                    Ok(mut captured) => captured.push(&chunk[..read], limit),
                    Err(_) => break Err(anyhow!("{name} buffer poisoned")),
                },
                Err(err) => break Err(anyhow::Error::new(err).context("read child output")),
            }
        };
        let _ = tx.send(outcome);
    });
    Ok(Reader {
        name,
        captured,
        done,
    })
}

/// Wait until `by` for the reader to hit EOF. `Ok(false)` means it is still blocked.
fn drain(reader: &Reader, by: Instant) -> Result<bool> {
    match reader
        .done
        .recv_timeout(by.saturating_duration_since(Instant::now()))
    {
        Ok(outcome) => outcome.with_context(|| format!("collect {}", reader.name)).map(|()| true),
        Err(RecvTimeoutError::Timeout) => Ok(false),
        // The outcome was taken by an earlier drain.
        Err(RecvTimeoutError::Disconnected) => Ok(true),
    }
}

fn take(reader: &Reader) -> Result<Captured> {
    let mut captured = reader
        .captured
        .lock()
        .map_err(|_| anyhow!("{} buffer poisoned", reader.name))?;
    Ok(std::mem::take(&mut *captured))
}
