//! Durable marker file for the CLI controller.
//!
//! The marker is a single line:
//!
//! ```text
//! <pid> <task> <started_at RFC 3339> <run_id>
//! ```
//!
//! A bare `<pid>` line is also accepted; it is attributed to
//! [`TaskType::unattributed`] and carries no run id, so only pid liveness
//! can be checked for it. Content that does not start with a pid is
//! garbage: it is removed on read and treated as "no run".
//!
//! New markers are written to a temporary file and hard-linked into place,
//! which both publishes the complete line atomically and fails if another
//! controller recorded a run first.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::StateStore;
use crate::models::task::{RunningTask, TaskType};
use crate::{AppError, Result};

/// Render a run record as a marker line (with trailing newline).
#[must_use]
pub fn format_marker(record: &RunningTask) -> String {
    format!(
        "{} {} {} {}\n",
        record.pid,
        record.task_type,
        record.started_at.to_rfc3339(),
        record.run_id
    )
}

/// Parse a marker line. `fallback_started_at` is used when the line holds
/// only a pid. Returns `None` for content that does not start with a pid.
#[must_use]
pub fn parse_marker(raw: &str, fallback_started_at: DateTime<Utc>) -> Option<RunningTask> {
    let mut fields = raw.split_whitespace();
    let pid: u32 = fields.next()?.parse().ok().filter(|pid| *pid > 0)?;

    let task_type = fields
        .next()
        .and_then(|name| TaskType::parse(name).ok())
        .unwrap_or_else(TaskType::unattributed);
    let started_at = fields
        .next()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map_or(fallback_started_at, |ts| ts.with_timezone(&Utc));
    let run_id = fields
        .next()
        .and_then(|id| Uuid::parse_str(id).ok())
        .unwrap_or_else(Uuid::nil);

    Some(RunningTask {
        task_type,
        pid,
        started_at,
        run_id,
    })
}

/// Single-record store backed by a marker file.
#[derive(Debug, Clone)]
pub struct FileMarkerStore {
    path: PathBuf,
}

impl FileMarkerStore {
    /// Store backed by the marker file at `path` (not created until a run
    /// is recorded).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Marker file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<RunningTask>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(AppError::Io(format!(
                    "cannot read marker {}: {err}",
                    self.path.display()
                )))
            }
        };

        let modified = fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .map_or_else(|_| Utc::now(), DateTime::<Utc>::from);

        if let Some(record) = parse_marker(&raw, modified) {
            return Ok(Some(record));
        }

        warn!(path = %self.path.display(), "marker file does not hold a pid; removing it");
        self.delete()?;
        Ok(None)
    }

    fn delete(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(AppError::Io(format!(
                "cannot remove marker {}: {err}",
                self.path.display()
            ))),
        }
    }
}

impl StateStore for FileMarkerStore {
    fn conflicting(&self, _task_type: &TaskType) -> Result<Option<RunningTask>> {
        self.read()
    }

    fn get(&self, task_type: &TaskType) -> Result<Option<RunningTask>> {
        Ok(self
            .read()?
            .filter(|record| &record.task_type == task_type))
    }

    fn put(&self, record: &RunningTask) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let staging = self
            .path
            .with_extension(format!("{}.tmp", record.run_id.simple()));
        fs::write(&staging, format_marker(record))?;

        let linked = fs::hard_link(&staging, &self.path);
        if let Err(err) = fs::remove_file(&staging) {
            warn!(path = %staging.display(), %err, "failed to remove staging marker");
        }

        match linked {
            Ok(()) => {
                debug!(path = %self.path.display(), pid = record.pid, "marker written");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let holder = self
                    .read()
                    .ok()
                    .flatten()
                    .map_or_else(|| "another run".to_owned(), |r| format!("task '{}' (pid {})", r.task_type, r.pid));
                Err(AppError::AlreadyRunning(format!(
                    "{holder} is recorded in {}",
                    self.path.display()
                )))
            }
            Err(err) => Err(AppError::Io(format!(
                "cannot write marker {}: {err}",
                self.path.display()
            ))),
        }
    }

    fn remove(&self, record: &RunningTask) -> Result<bool> {
        match self.read()? {
            Some(stored) if stored.pid == record.pid && stored.run_id == record.run_id => {
                self.delete()
            }
            _ => Ok(false),
        }
    }

    fn list(&self) -> Result<Vec<RunningTask>> {
        Ok(self.read()?.into_iter().collect())
    }
}
