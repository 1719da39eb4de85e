//! Run-state persistence.
//!
//! The supervisor records every live run in a [`StateStore`]. Two stores
//! share one contract with different lifetimes:
//! - [`marker::FileMarkerStore`]: a single-line marker file that survives
//!   the short-lived CLI controller and holds at most one run overall;
//! - [`memory::MemoryStateStore`]: an in-process map for the long-lived
//!   server, holding at most one run per task type.

pub mod marker;
pub mod memory;

use crate::models::task::{RunningTask, TaskType};
use crate::Result;

pub use marker::FileMarkerStore;
pub use memory::MemoryStateStore;

/// Storage for "currently running" records.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`std::sync::Arc`].
pub trait StateStore: Send + Sync {
    /// Record that prevents a new run of `task_type`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn conflicting(&self, task_type: &TaskType) -> Result<Option<RunningTask>>;

    /// Record for `task_type` itself, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, task_type: &TaskType) -> Result<Option<RunningTask>>;

    /// Persist a new run. Exclusive: fails if a conflicting record exists.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyRunning` when a conflicting record is
    /// present, or an I/O error if the record cannot be written.
    fn put(&self, record: &RunningTask) -> Result<()>;

    /// Remove `record` if it is still the stored run (same pid and run id).
    /// Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be updated.
    fn remove(&self, record: &RunningTask) -> Result<bool>;

    /// Every stored run.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn list(&self) -> Result<Vec<RunningTask>>;
}
