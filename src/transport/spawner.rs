//! Agent process spawner and supervisor.
//!
//! Spawns the external agent with:
//! - `kill_on_drop(true)` so processes are cleaned up automatically.
//! - Optional `env_clear()` + a safe variable allowlist so host secrets do
//!   not leak into the child unless explicitly passed through.
//! - Piped stdin/stdout for the protocol and piped stderr captured as a
//!   diagnostic side channel.
//!
//! The returned [`Supervisor`] owns the child through a background monitor
//! task that publishes the exit status exactly once and performs the
//! terminate sequence (`SIGTERM`, grace period, kill) on request.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{AppError, Result};

/// How long to wait for stderr to drain after the process exits.
const STDERR_DRAIN: Duration = Duration::from_millis(200);

/// Capacity of the stderr broadcast channel.
const STDERR_BROADCAST_DEPTH: usize = 256;

// ── Environment allowlist ────────────────────────────────────────────────────

/// Environment variables inherited when [`SpawnConfig::inherit_env`] is off.
///
/// Every other variable from the host's environment is stripped via
/// `env_clear()` before the child is launched; anything else the agent
/// needs (credentials included) must be passed through [`SpawnConfig::env`].
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TERM",
    "TMPDIR",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

// ── Configuration ────────────────────────────────────────────────────────────

/// Opaque command used to launch the agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    /// Executable name or path.
    pub program: String,
    /// Arguments, passed verbatim.
    pub args: Vec<String>,
    /// Extra environment variables, applied after inheritance.
    pub env: BTreeMap<String, String>,
    /// Inherit the host environment; when `false` only
    /// [`ALLOWED_ENV_VARS`] are passed through.
    pub inherit_env: bool,
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
    /// Number of trailing stderr lines retained for error reports.
    pub stderr_tail_lines: usize,
    /// Time between `SIGTERM` and a hard kill during termination.
    pub terminate_grace: Duration,
}

impl SpawnConfig {
    /// A config running `program` with the allowlisted environment and
    /// default limits.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            inherit_env: false,
            cwd: None,
            stderr_tail_lines: 100,
            terminate_grace: Duration::from_secs(2),
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

// ── Exit status ──────────────────────────────────────────────────────────────

/// How the agent process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code for a normal exit.
    pub code: Option<i32>,
    /// Signal number when terminated by a signal (unix only).
    pub signal: Option<i32>,
}

impl ProcessExit {
    /// Whether the process exited normally with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Convert into [`AppError::ProcessExited`], attaching the stderr tail.
    #[must_use]
    pub fn into_error(self, stderr: Option<String>) -> AppError {
        AppError::ProcessExited {
            code: self.code,
            signal: self.signal,
            stderr,
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "process exited with code {code}"),
            (None, Some(signal)) => write!(f, "process terminated by signal {signal}"),
            (None, None) => f.write_str("process exited with unknown status"),
        }
    }
}

// ── Stderr tap ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct StderrTap {
    tail: Mutex<VecDeque<String>>,
    capacity: usize,
    /// Set once a line has been evicted from the tail.
    dropped: AtomicBool,
    lines: broadcast::Sender<String>,
}

impl StderrTap {
    fn new(capacity: usize) -> Self {
        let (lines, _) = broadcast::channel(STDERR_BROADCAST_DEPTH);
        Self {
            tail: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            dropped: AtomicBool::new(false),
            lines,
        }
    }

    fn push(&self, line: String) {
        if self.capacity > 0 {
            let mut tail = self.tail.lock();
            if tail.len() == self.capacity {
                tail.pop_front();
                self.dropped.store(true, Ordering::Relaxed);
            }
            tail.push_back(line.clone());
        }
        // No subscribers is fine; the tail still records the line.
        let _ = self.lines.send(line);
    }

    fn snapshot(&self) -> Option<String> {
        let tail = self.tail.lock();
        if tail.is_empty() {
            return None;
        }
        let joined = tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
        if self.dropped.load(Ordering::Relaxed) {
            Some(format!(
                "[stderr truncated, showing last {} lines]\n{joined}",
                self.capacity
            ))
        } else {
            Some(joined)
        }
    }
}

// ── Supervisor ───────────────────────────────────────────────────────────────

/// Handle to a running agent process.
///
/// Cheap to clone; every clone observes the same exit status.
#[derive(Debug, Clone)]
pub struct Supervisor {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ProcessExit>>,
    terminate: CancellationToken,
    stderr: Arc<StderrTap>,
}

impl Supervisor {
    /// OS process id, if still known.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait until the process exits.
    ///
    /// Returns `None` only if the monitor task vanished without publishing a
    /// status (runtime shutdown).
    pub async fn wait(&self) -> Option<ProcessExit> {
        let mut exit = self.exit.clone();
        let status = exit.wait_for(Option::is_some).await.ok().and_then(|v| *v);
        status
    }

    /// Ask the monitor to terminate the process (`SIGTERM`, grace, kill).
    ///
    /// Idempotent; a no-op once the process has exited.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    /// The retained stderr tail, newest line last.
    #[must_use]
    pub fn stderr_tail(&self) -> Option<String> {
        self.stderr.snapshot()
    }

    /// Subscribe to stderr lines emitted from now on.
    #[must_use]
    pub fn subscribe_stderr(&self) -> broadcast::Receiver<String> {
        self.stderr.lines.subscribe()
    }
}

/// A spawned agent: its protocol pipes and supervisor.
#[derive(Debug)]
pub struct SpawnedProcess {
    /// Agent's stdin; hand this to the writer task.
    pub stdin: ChildStdin,
    /// Agent's stdout; hand this to the reader task.
    pub stdout: ChildStdout,
    /// Lifetime handle.
    pub supervisor: Supervisor,
}

// ── Spawner ──────────────────────────────────────────────────────────────────

/// Spawn the agent process and start its monitor and stderr tasks.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// - [`AppError::ExecutableNotFound`]: the program does not exist or is not
///   on `PATH`.
/// - [`AppError::Config`]: the working directory does not exist.
/// - [`AppError::Io`]: any other OS spawn failure.
pub fn spawn_process(config: &SpawnConfig) -> Result<SpawnedProcess> {
    if let Some(cwd) = &config.cwd {
        if !cwd.is_dir() {
            return Err(AppError::Config(format!(
                "working directory does not exist: {}",
                cwd.display()
            )));
        }
    }

    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args);

    if !config.inherit_env {
        // Strip inherited environment, then inject only the safe allowlist.
        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
    }
    cmd.envs(&config.env);

    if let Some(cwd) = &config.cwd {
        cmd.current_dir(cwd);
    }

    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            AppError::ExecutableNotFound(format!("{}: {err}", config.program))
        } else {
            AppError::Io(format!("failed to spawn agent: {err}"))
        }
    })?;

    let pid = child.id();
    info!(program = %config.program, ?pid, "agent process spawned");

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Io("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Io("failed to capture agent stdout".into()))?;
    let stderr = child.stderr.take();

    let tap = Arc::new(StderrTap::new(config.stderr_tail_lines));
    let stderr_task = stderr.map(|pipe| spawn_stderr_task(pipe, Arc::clone(&tap)));

    let (exit_tx, exit_rx) = watch::channel(None);
    let terminate = CancellationToken::new();
    drop(monitor_exit(
        child,
        terminate.clone(),
        config.terminate_grace,
        stderr_task,
        exit_tx,
    ));

    Ok(SpawnedProcess {
        stdin,
        stdout,
        supervisor: Supervisor {
            pid,
            exit: exit_rx,
            terminate,
            stderr: tap,
        },
    })
}

// ── Background tasks ─────────────────────────────────────────────────────────

fn spawn_stderr_task(pipe: ChildStderr, tap: Arc<StderrTap>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(target: "agent_conduit::stderr", "{line}");
                    tap.push(line);
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(%err, "stderr read failed, stopping capture");
                    break;
                }
            }
        }
    })
}

/// Spawn a background task that owns `child`, awaits its exit, and publishes
/// the [`ProcessExit`] on `exit_tx`.
///
/// When `terminate` fires first, the task sends `SIGTERM` (unix), waits up
/// to `grace`, and kills the process if it is still running.
fn monitor_exit(
    mut child: Child,
    terminate: CancellationToken,
    grace: Duration,
    stderr_task: Option<JoinHandle<()>>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            () = terminate.cancelled() => {
                debug!("monitor: terminate requested");
                send_terminate(&mut child);
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(status) => status,
                    Err(_elapsed) => {
                        warn!(?grace, "agent ignored SIGTERM, killing");
                        if let Err(err) = child.kill().await {
                            warn!(%err, "failed to kill agent process");
                        }
                        child.wait().await
                    }
                }
            }
        };

        let exit = match status {
            Ok(status) => ProcessExit::from_status(status),
            Err(err) => {
                warn!(%err, "error waiting for agent child process");
                ProcessExit {
                    code: None,
                    signal: None,
                }
            }
        };

        // Let the stderr task drain so the tail is complete when published.
        if let Some(task) = stderr_task {
            let _ = tokio::time::timeout(STDERR_DRAIN, task).await;
        }

        info!(%exit, "agent process exited");
        exit_tx.send_replace(Some(exit));
    })
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(%err, pid, "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        debug!(%err, "failed to start kill");
    }
}
