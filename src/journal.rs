//! Per-task lifecycle journal.
//!
//! Every supervision event of a task is appended as one JSON line to
//! `<logs_dir>/<task>.journal.jsonl`, next to the task's `.out.log` and
//! `.err.log`, so a task's output and its run history sit side by side.
//! Events that concern no task go to `supervisor.journal.jsonl`.
//!
//! Each entry is serialized up front and written with a single
//! `write_all` on a descriptor opened in append mode. Several controller
//! processes (the CLI is one process per command) can therefore share a
//! journal without interleaving partial lines, and nothing is buffered
//! between entries.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::task::{RunningTask, TaskType};
use crate::orchestrator::broker::open_append;
use crate::{AppError, Result};

/// Journal file for events that concern no task.
pub const SUPERVISOR_JOURNAL: &str = "supervisor.journal.jsonl";

/// What happened.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalEvent {
    /// Worker spawned and recorded.
    TaskStarted,
    /// Termination requested by an operator.
    TaskStopped,
    /// Worker exit observed.
    TaskExited,
    /// Start rejected because a run is already live.
    StartRejected,
    /// The OS refused to spawn the worker.
    SpawnFailed,
    /// A marker pointing at a dead or reused pid was cleared.
    StaleMarkerCleared,
}

/// One journal line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// When the event was recorded.
    pub at: DateTime<Utc>,
    /// What happened.
    pub event: JournalEvent,
    /// Task concerned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskType>,
    /// Worker pid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Run identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    /// Exit code of a `task_exited` event; absent when killed by a signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Why a start was rejected or a spawn failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl JournalEntry {
    /// Entry for `event`, stamped now.
    #[must_use]
    pub fn new(event: JournalEvent) -> Self {
        Self {
            at: Utc::now(),
            event,
            task: None,
            pid: None,
            run_id: None,
            exit_code: None,
            reason: None,
        }
    }

    /// Attribute the entry to `task_type`.
    #[must_use]
    pub fn with_task(mut self, task_type: &TaskType) -> Self {
        self.task = Some(task_type.clone());
        self
    }

    /// Attribute the entry to a run. A nil run id (bare pid marker) is
    /// left out.
    #[must_use]
    pub fn with_run(mut self, run: &RunningTask) -> Self {
        self.task = Some(run.task_type.clone());
        self.pid = Some(run.pid);
        self.run_id = (!run.run_id.is_nil()).then_some(run.run_id);
        self
    }

    /// Set the exit code.
    #[must_use]
    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Set the reason.
    #[must_use]
    pub fn with_reason(mut self, reason: String) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// Sink for lifecycle entries, shared by the supervisor and its exit
/// watchers.
pub trait Journal: Send + Sync {
    /// Append one entry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the entry cannot be written.
    fn record(&self, entry: &JournalEntry) -> Result<()>;
}

/// Journal file for `task` (or the supervisor journal) inside `logs_dir`.
#[must_use]
pub fn journal_path(logs_dir: &Path, task: Option<&TaskType>) -> PathBuf {
    match task {
        Some(task) => logs_dir.join(format!("{task}.journal.jsonl")),
        None => logs_dir.join(SUPERVISOR_JOURNAL),
    }
}

/// [`Journal`] writing JSONL files into the logs directory.
#[derive(Debug, Clone)]
pub struct FileJournal {
    logs_dir: PathBuf,
}

impl FileJournal {
    /// Journal rooted at `logs_dir`; files are created on first write.
    #[must_use]
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
        }
    }

    /// Entries recorded for `task` (or the supervisor journal), oldest
    /// first. A missing journal reads as empty; unparsable lines are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file exists but cannot be read.
    pub fn entries(&self, task: Option<&TaskType>) -> Result<Vec<JournalEntry>> {
        let path = journal_path(&self.logs_dir, task);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AppError::Io(format!("cannot read {}: {err}", path.display())));
            }
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

impl Journal for FileJournal {
    fn record(&self, entry: &JournalEntry) -> Result<()> {
        let path = journal_path(&self.logs_dir, entry.task.as_ref());
        let mut line = serde_json::to_vec(entry)
            .map_err(|err| AppError::Io(format!("cannot encode journal entry: {err}")))?;
        line.push(b'\n');

        open_append(&path)
            .and_then(|mut file| file.write_all(&line))
            .map_err(|err| AppError::Io(format!("cannot append to {}: {err}", path.display())))
    }
}
