//! Task identity, launch specification and run lifecycle types.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, Result};

/// Longest accepted task type name.
const MAX_TASK_NAME_LEN: usize = 64;

/// Validated task type identifier (e.g. `swap`, `lp`, `swap_lp`).
///
/// Names are restricted to lowercase ASCII letters, digits, `_` and `-`
/// because they are embedded in log file names and the marker line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    /// Validate and wrap a task type name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownTask` if the name is empty, too long, or
    /// contains characters outside `[a-z0-9_-]`.
    pub fn parse(name: &str) -> Result<Self> {
        if name.is_empty() || name.len() > MAX_TASK_NAME_LEN {
            return Err(AppError::UnknownTask(format!(
                "task name must be 1-{MAX_TASK_NAME_LEN} characters"
            )));
        }
        let valid = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid {
            return Err(AppError::UnknownTask(format!(
                "'{name}' contains characters outside [a-z0-9_-]"
            )));
        }
        Ok(Self(name.to_owned()))
    }

    /// Placeholder for a durable marker that names no task (a bare pid
    /// written by hand or by an older controller).
    #[must_use]
    pub fn unattributed() -> Self {
        Self("unknown".to_owned())
    }

    /// Borrow the task name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fully resolved launch command for one task type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable path or name.
    pub program: String,
    /// Argument list.
    pub args: Vec<String>,
    /// Environment overrides (global overrides merged with per-task ones).
    pub env: BTreeMap<String, String>,
    /// Working directory of the worker.
    pub working_dir: PathBuf,
    /// Inherit the supervisor environment instead of the allowlist.
    pub inherit_env: bool,
}

impl LaunchSpec {
    /// Render the command line for log messages.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A live run of a task: the record persisted by the state stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunningTask {
    /// Task type this run belongs to.
    pub task_type: TaskType,
    /// Operating system process identifier.
    pub pid: u32,
    /// Spawn timestamp.
    pub started_at: DateTime<Utc>,
    /// Random token injected into the worker environment; nil when unknown.
    pub run_id: Uuid,
}

impl RunningTask {
    /// Construct a record for a freshly spawned worker.
    #[must_use]
    pub fn new(task_type: TaskType, pid: u32, run_id: Uuid) -> Self {
        Self {
            task_type,
            pid,
            started_at: Utc::now(),
            run_id,
        }
    }
}

/// Per-task supervision state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// No worker for this task.
    Idle,
    /// Start accepted; the worker is being spawned.
    Starting,
    /// Worker live.
    Running,
    /// Termination signalled; waiting for exit.
    Stopping,
}

impl TaskState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Starting)
                | (Self::Starting, Self::Idle | Self::Running | Self::Stopping)
                | (Self::Running, Self::Stopping | Self::Idle)
                | (Self::Stopping, Self::Idle)
        )
    }
}

/// Externally reported status of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    /// No live worker.
    Idle,
    /// Worker is being spawned.
    Starting,
    /// Worker live.
    Running {
        /// Run record.
        run: RunningTask,
    },
    /// Termination signalled, exit not yet observed.
    Stopping {
        /// Run record.
        run: RunningTask,
    },
}

impl TaskStatus {
    /// Coarse state for this status.
    #[must_use]
    pub fn state(&self) -> TaskState {
        match self {
            Self::Idle => TaskState::Idle,
            Self::Starting => TaskState::Starting,
            Self::Running { .. } => TaskState::Running,
            Self::Stopping { .. } => TaskState::Stopping,
        }
    }

    /// Whether the task has no live worker.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl std::borrow::Borrow<str> for TaskType {
    fn borrow(&self) -> &str {
        &self.0
    }
}
