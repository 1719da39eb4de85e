//! In-memory run store for the long-lived server.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::StateStore;
use crate::models::task::{RunningTask, TaskType};
use crate::{AppError, Result};

/// One record per task type, held for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    runs: Mutex<HashMap<TaskType, RunningTask>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<TaskType, RunningTask>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateStore for MemoryStateStore {
    fn conflicting(&self, task_type: &TaskType) -> Result<Option<RunningTask>> {
        self.get(task_type)
    }

    fn get(&self, task_type: &TaskType) -> Result<Option<RunningTask>> {
        Ok(self.runs().get(task_type).cloned())
    }

    fn put(&self, record: &RunningTask) -> Result<()> {
        match self.runs().entry(record.task_type.clone()) {
            Entry::Occupied(existing) => Err(AppError::AlreadyRunning(format!(
                "task '{}' is already running (pid {})",
                record.task_type,
                existing.get().pid
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    fn remove(&self, record: &RunningTask) -> Result<bool> {
        let mut runs = self.runs();
        let matches = runs
            .get(&record.task_type)
            .is_some_and(|stored| stored.pid == record.pid && stored.run_id == record.run_id);
        if matches {
            runs.remove(&record.task_type);
        }
        Ok(matches)
    }

    fn list(&self) -> Result<Vec<RunningTask>> {
        let mut runs: Vec<_> = self.runs().values().cloned().collect();
        runs.sort_by(|a, b| a.task_type.cmp(&b.task_type));
        Ok(runs)
    }
}
