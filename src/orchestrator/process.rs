//! Worker process handle.
//!
//! Spawns worker processes with:
//! - stdout and stderr either captured as independent pipes (server and
//!   foreground CLI) or redirected to append-only log files (detached CLI
//!   runs that must outlive the controller);
//! - `kill_on_drop(true)` for captured workers, so no worker outlives its
//!   supervisor;
//! - `AUTORUN_TASK` and `AUTORUN_RUN_ID` injected into the environment; the
//!   run id lets a later controller tell its worker apart from an unrelated
//!   process that reused the PID;
//! - an optional restricted environment (`env_clear()` plus
//!   [`ALLOWED_ENV_VARS`]) when the configuration disables inheritance.
//!
//! Every handle owns a monitor task that reaps the child and publishes the
//! exit outcome exactly once through a `watch` channel.

use std::fs::File;
use std::process::{ExitStatus, Stdio};

use chrono::{DateTime, Utc};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::task::{LaunchSpec, RunningTask, TaskType};
use crate::{AppError, Result};

/// Environment variable carrying the task type into the worker.
pub const TASK_ENV: &str = "AUTORUN_TASK";

/// Environment variable carrying the run id into the worker.
pub const RUN_ID_ENV: &str = "AUTORUN_RUN_ID";

/// Environment variables inherited when `inherit_env` is disabled.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "TZ",
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

/// Where the worker's standard streams go.
#[derive(Debug)]
pub enum StdioMode {
    /// Pipes handed back to the caller in [`SpawnedProcess`].
    Captured,
    /// Redirected to already-open log files; the worker is detached into
    /// its own process group and survives the controller.
    Files {
        /// Destination for stdout.
        stdout: File,
        /// Destination for stderr.
        stderr: File,
    },
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code; `None` when killed by a signal or when waiting failed.
    pub code: Option<i32>,
    /// Terminating signal, when known.
    pub signal: Option<i32>,
}

impl ExitOutcome {
    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    /// Human-readable description used in logs and CLI output.
    #[must_use]
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {code}"),
            (None, Some(signal)) => format!("terminated by signal {signal}"),
            (None, None) => "status unknown".to_owned(),
        }
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
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

/// A freshly spawned worker plus its captured pipes (if any).
#[derive(Debug)]
pub struct SpawnedProcess {
    /// Handle used for liveness, exit and termination.
    pub handle: ProcessHandle,
    /// Captured stdout, present in [`StdioMode::Captured`].
    pub stdout: Option<ChildStdout>,
    /// Captured stderr, present in [`StdioMode::Captured`].
    pub stderr: Option<ChildStderr>,
}

/// Cloneable handle to one spawned worker.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    task_type: TaskType,
    pid: u32,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
    kill: CancellationToken,
}

impl ProcessHandle {
    /// Spawn the worker described by `spec`.
    ///
    /// Does not wait for the worker. Must be called from within a Tokio
    /// runtime: the exit monitor is a Tokio task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the OS refuses to create the process.
    pub fn spawn(
        task_type: &TaskType,
        spec: &LaunchSpec,
        run_id: Uuid,
        stdio: StdioMode,
    ) -> Result<SpawnedProcess> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);

        if !spec.inherit_env {
            cmd.env_clear();
            for &key in ALLOWED_ENV_VARS {
                if let Ok(val) = std::env::var(key) {
                    cmd.env(key, val);
                }
            }
        }
        cmd.envs(&spec.env)
            .env(TASK_ENV, task_type.as_str())
            .env(RUN_ID_ENV, run_id.to_string())
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null());

        let captured = matches!(stdio, StdioMode::Captured);
        match stdio {
            StdioMode::Captured => {
                cmd.stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true);
            }
            StdioMode::Files { stdout, stderr } => {
                cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
                #[cfg(unix)]
                cmd.process_group(0);
            }
        }

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Spawn(format!(
                "failed to spawn '{}' for task '{task_type}': {err}",
                spec.command_line()
            ))
        })?;

        let pid = child.id().ok_or_else(|| {
            AppError::Spawn(format!("worker for task '{task_type}' exited before reporting a pid"))
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        info!(
            task = %task_type,
            pid,
            %run_id,
            command = %spec.command_line(),
            captured,
            "worker process spawned"
        );

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let monitor_kill = kill.clone();
        let monitor_task = task_type.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                () = monitor_kill.cancelled() => {
                    if let Err(err) = child.start_kill() {
                        warn!(task = %monitor_task, pid, %err, "forced kill failed");
                    }
                    child.wait().await
                }
            };

            let outcome = match status {
                Ok(status) => ExitOutcome::from(status),
                Err(err) => {
                    warn!(task = %monitor_task, pid, %err, "error waiting for worker process");
                    ExitOutcome::unknown()
                }
            };
            debug!(task = %monitor_task, pid, outcome = %outcome.describe(), "worker process reaped");
            // Receivers may all be gone; the outcome is then simply unobserved.
            let _ = exit_tx.send(Some(outcome));
        });

        Ok(SpawnedProcess {
            handle: Self {
                task_type: task_type.clone(),
                pid,
                run_id,
                started_at: Utc::now(),
                exit_rx,
                kill,
            },
            stdout,
            stderr,
        })
    }

    /// Task type of the worker.
    #[must_use]
    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    /// Operating system process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Run id injected into the worker environment.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Record describing this run.
    #[must_use]
    pub fn record(&self) -> RunningTask {
        RunningTask {
            task_type: self.task_type.clone(),
            pid: self.pid,
            started_at: self.started_at,
            run_id: self.run_id,
        }
    }

    /// Whether the exit has not been observed yet.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Exit outcome, once observed.
    #[must_use]
    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        *self.exit_rx.borrow()
    }

    /// Receiver that changes to `Some` exactly once, when the exit is
    /// observed.
    #[must_use]
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitOutcome>> {
        self.exit_rx.clone()
    }

    /// Resolve once the worker has exited, however it ended.
    pub async fn wait(&self) -> ExitOutcome {
        let mut rx = self.exit_rx.clone();
        // A closed sender without an outcome means the exit went unobserved.
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => *outcome,
            Err(_) => None,
        };
        outcome.unwrap_or_else(ExitOutcome::unknown)
    }

    /// Ask the worker to terminate (SIGTERM on Unix).
    ///
    /// Idempotent: a worker that already exited is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Termination` if the signal cannot be delivered.
    pub fn terminate(&self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            signal_terminate(self.pid).map(|_| ())
        }

        #[cfg(not(unix))]
        {
            self.kill.cancel();
            Ok(())
        }
    }

    /// Kill the worker without giving it a chance to clean up.
    pub fn force_kill(&self) {
        self.kill.cancel();
    }
}

/// Send SIGTERM to `pid`.
///
/// Returns `Ok(false)` when no such process exists.
///
/// # Errors
///
/// Returns `AppError::Termination` if the signal cannot be delivered
/// (e.g. the process belongs to another user).
#[cfg(unix)]
pub fn signal_terminate(pid: u32) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    let target = unix_pid(pid)
        .ok_or_else(|| AppError::Termination(format!("invalid process id {pid}")))?;
    match kill(target, Signal::SIGTERM) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(err) => Err(AppError::Termination(format!(
            "cannot signal process {pid}: {err}"
        ))),
    }
}

/// Terminate `pid`. Unsupported off Unix without a live handle.
///
/// # Errors
///
/// Always returns `AppError::Termination`.
#[cfg(not(unix))]
pub fn signal_terminate(pid: u32) -> Result<bool> {
    Err(AppError::Termination(format!(
        "signalling process {pid} by id is only supported on unix"
    )))
}

#[cfg(unix)]
fn unix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    // pid 0 and negative values address process groups, never a worker.
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(nix::unistd::Pid::from_raw)
}

/// Liveness probe by pid. Unknown or reaped processes are not alive.
#[cfg(unix)]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(target) = unix_pid(pid) else {
        return false;
    };
    matches!(kill(target, None), Ok(()) | Err(Errno::EPERM))
}

/// Liveness probe by pid. Without a portable probe the process is assumed
/// alive so a marker is never cleared by mistake.
#[cfg(not(unix))]
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    pid != 0
}

/// Check that `pid` is the worker launched with `run_id`.
///
/// `Some(true)` when the run id is found in the process environment,
/// `Some(false)` when the environment is readable but lacks it (PID reuse,
/// or a zombie whose environment is gone), `None` when it cannot be told.
#[cfg(target_os = "linux")]
#[must_use]
pub fn run_identity(pid: u32, run_id: Uuid) -> Option<bool> {
    if run_id.is_nil() {
        return None;
    }
    match std::fs::read(format!("/proc/{pid}/environ")) {
        Ok(environ) => {
            let needle = format!("{RUN_ID_ENV}={run_id}");
            Some(
                environ
                    .split(|b| *b == 0)
                    .any(|entry| entry == needle.as_bytes()),
            )
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Some(false),
        Err(_) => None,
    }
}

/// Check that `pid` is the worker launched with `run_id`.
///
/// Not determinable on this platform.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn run_identity(_pid: u32, _run_id: Uuid) -> Option<bool> {
    None
}

/// Whether a persisted run record still refers to a live worker.
#[must_use]
pub fn record_alive(record: &RunningTask) -> bool {
    pid_alive(record.pid) && run_identity(record.pid, record.run_id) != Some(false)
}
