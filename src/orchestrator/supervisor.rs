//! Supervisor: the per-task state machine shared by every front-end.
//!
//! Each task type owns one slot guarded by its own mutex:
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Idle
//!            \-> Idle (spawn failure)
//! ```
//!
//! `start` performs the check-and-set to `Starting` under the slot lock,
//! releases the lock for the spawn, and relocks to publish `Running`, so
//! concurrent starts of one task admit exactly one caller and different
//! tasks never contend. Exit is observed by a supervision task per worker
//! which drains the output pipes, removes the durable record, emits the
//! terminal broker event and returns the slot to `Idle`. Between the exit
//! and the slot reset, status reports `Stopping`: a task is only ever
//! reported `Idle` when a start would be accepted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use super::broker::{open_log_file, OutputBroker, Subscription};
use super::process::{self, ProcessHandle, StdioMode};
use super::reader::run_reader;
use super::registry::TaskRegistry;
use crate::journal::{Journal, JournalEntry, JournalEvent};
use crate::models::output::{BrokerEvent, StreamKind};
use crate::models::task::{LaunchSpec, RunningTask, TaskState, TaskStatus, TaskType};
use crate::persistence::StateStore;
use crate::{AppError, Result};

/// Default time to keep draining output pipes after a worker exits.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Where spawned workers send their output.
#[derive(Debug, Clone)]
pub enum LaunchMode {
    /// Pipes read by the supervisor and published through the broker.
    Captured,
    /// Redirected straight to `<logs_dir>/<task>.{out,err}.log`; the worker
    /// outlives the controller.
    Detached {
        /// Directory receiving the log files.
        logs_dir: PathBuf,
    },
}

/// Result of [`Supervisor::run_to_completion`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunOutput {
    /// Combined stdout and stderr, in arrival order.
    pub output: String,
    /// Worker exit code; `None` when killed by a signal.
    pub exit_code: Option<i32>,
    /// Whether the run was stopped because it exceeded its time limit.
    pub timed_out: bool,
}

/// State of the single durable record seen by the CLI controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackedStatus {
    /// No record.
    Idle,
    /// The recorded worker is alive.
    Running(RunningTask),
    /// The recorded worker was gone; the record has been cleared.
    Stale(RunningTask),
}

#[derive(Debug)]
struct Slot {
    state: TaskState,
    handle: Option<ProcessHandle>,
    run_id: Option<Uuid>,
    stop_requested: bool,
}

impl Slot {
    fn idle() -> Self {
        Self {
            state: TaskState::Idle,
            handle: None,
            run_id: None,
            stop_requested: false,
        }
    }

    fn transition(&mut self, next: TaskState) {
        if !self.state.can_transition_to(next) {
            warn!(from = ?self.state, to = ?next, "unexpected task state transition");
        }
        self.state = next;
    }

    fn reset(&mut self) {
        if self.state != TaskState::Idle {
            self.transition(TaskState::Idle);
        }
        *self = Self::idle();
    }
}

type SharedSlot = Arc<Mutex<Slot>>;

fn lock(slot: &SharedSlot) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Append a journal entry, logging (never propagating) failures.
fn write_journal(journal: Option<&Arc<dyn Journal>>, entry: &JournalEntry) {
    if let Some(journal) = journal {
        if let Err(err) = journal.record(entry) {
            warn!(%err, "failed to write supervisor journal entry");
        }
    }
}

/// Everything the exit supervision task needs after `start` returns.
struct ExitWatch {
    slot: SharedSlot,
    store: Arc<dyn StateStore>,
    broker: Arc<OutputBroker>,
    journal: Option<Arc<dyn Journal>>,
    drain_timeout: Duration,
}

impl ExitWatch {
    async fn run(self, handle: ProcessHandle, readers: Vec<JoinHandle<u64>>, cancel: CancellationToken) {
        let outcome = handle.wait().await;
        let record = handle.record();

        let mut drained = Box::pin(join_all(readers));
        tokio::select! {
            _ = &mut drained => {}
            () = tokio::time::sleep(self.drain_timeout) => {
                warn!(
                    task = %record.task_type,
                    pid = record.pid,
                    "output pipes still open after worker exit; abandoning them"
                );
                cancel.cancel();
                drained.await;
            }
        }

        if let Err(err) = self.store.remove(&record) {
            warn!(task = %record.task_type, %err, "failed to remove run record after exit");
        }

        info!(
            task = %record.task_type,
            pid = record.pid,
            outcome = %outcome.describe(),
            "worker exited"
        );
        write_journal(
            self.journal.as_ref(),
            &JournalEntry::new(JournalEvent::TaskExited)
                .with_run(&record)
                .with_exit_code(outcome.code),
        );

        let mut slot = lock(&self.slot);
        self.broker.complete(&record.task_type, outcome.code);
        if slot.run_id == Some(record.run_id) {
            slot.reset();
        }
    }
}

/// Orchestrates registry, process handles, broker and state store.
///
/// One instance is created per front-end process and injected wherever it
/// is needed; there is no global registry.
pub struct Supervisor {
    registry: Arc<TaskRegistry>,
    store: Arc<dyn StateStore>,
    broker: Arc<OutputBroker>,
    journal: Option<Arc<dyn Journal>>,
    mode: LaunchMode,
    drain_timeout: Duration,
    slots: HashMap<TaskType, SharedSlot>,
}

impl Supervisor {
    /// Create a supervisor with one idle slot per registered task.
    #[must_use]
    pub fn new(
        registry: Arc<TaskRegistry>,
        store: Arc<dyn StateStore>,
        broker: Arc<OutputBroker>,
        mode: LaunchMode,
    ) -> Self {
        let slots = registry
            .task_types()
            .map(|task_type| (task_type.clone(), Arc::new(Mutex::new(Slot::idle()))))
            .collect();

        Self {
            registry,
            store,
            broker,
            journal: None,
            mode,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            slots,
        }
    }

    /// Record lifecycle events to `journal`.
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Override how long output pipes are drained after a worker exits.
    #[must_use]
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Task registry shared with the front-ends.
    #[must_use]
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Output broker shared with the front-ends.
    #[must_use]
    pub fn broker(&self) -> &Arc<OutputBroker> {
        &self.broker
    }

    fn slot(&self, task_type: &TaskType) -> Result<&SharedSlot> {
        self.slots.get(task_type).ok_or_else(|| {
            AppError::UnknownTask(format!("'{task_type}' has no supervision slot"))
        })
    }

    fn note(&self, entry: &JournalEntry) {
        write_journal(self.journal.as_ref(), entry);
    }

    fn clear_stale(&self, record: &RunningTask) -> Result<()> {
        self.store.remove(record)?;
        info!(task = %record.task_type, pid = record.pid, "cleared stale run record");
        self.note(&JournalEntry::new(JournalEvent::StaleMarkerCleared).with_run(record));
        Ok(())
    }

    /// Start a worker for `name`.
    ///
    /// # Errors
    ///
    /// - `AppError::UnknownTask` if `name` is not registered (nothing is
    ///   spawned or written).
    /// - `AppError::AlreadyRunning` if a run of the task (or, with the
    ///   single-record file store, any task) is live.
    /// - `AppError::Spawn` if the OS refuses to create the worker.
    pub fn start(&self, name: &str) -> Result<RunningTask> {
        self.launch(name, false).map(|(record, _)| record)
    }

    /// Start a worker and return a subscription attached before the spawn,
    /// so it observes the run from its first byte.
    ///
    /// # Errors
    ///
    /// Same as [`Supervisor::start`].
    pub fn start_and_subscribe(&self, name: &str) -> Result<(RunningTask, Subscription)> {
        let (record, subscription) = self.launch(name, true)?;
        let subscription = subscription.ok_or_else(|| {
            AppError::Io(format!("no subscription created for task '{name}'"))
        })?;
        Ok((record, subscription))
    }

    fn launch(&self, name: &str, subscribe: bool) -> Result<(RunningTask, Option<Subscription>)> {
        let (task_type, spec) = self.registry.resolve(name)?;
        let span = info_span!("start_task", task = %task_type);
        let _guard = span.enter();

        let slot = self.slot(task_type)?;
        let run_id = Uuid::new_v4();

        {
            let mut guard = lock(slot);
            if guard.state != TaskState::Idle {
                let reason = format!("task '{task_type}' is {:?}", guard.state);
                return Err(self.reject(task_type, reason));
            }

            if let Some(existing) = self.store.conflicting(task_type)? {
                if process::record_alive(&existing) {
                    let reason = format!(
                        "task '{}' (pid {}) is still running; stop it first",
                        existing.task_type, existing.pid
                    );
                    return Err(self.reject(task_type, reason));
                }
                self.clear_stale(&existing)?;
            }

            guard.transition(TaskState::Starting);
            guard.run_id = Some(run_id);
            guard.stop_requested = false;
        }

        self.broker.begin_run(task_type);
        let subscription = subscribe.then(|| self.broker.attach(task_type));

        match self.spawn_worker(task_type, spec, run_id, slot) {
            Ok(record) => Ok((record, subscription)),
            Err(err) => {
                lock(slot).reset();
                Err(err)
            }
        }
    }

    fn reject(&self, task_type: &TaskType, reason: String) -> AppError {
        info!(task = %task_type, %reason, "start rejected");
        self.note(
            &JournalEntry::new(JournalEvent::StartRejected)
                .with_task(task_type)
                .with_reason(reason.clone()),
        );
        AppError::AlreadyRunning(reason)
    }

    /// Spawn, record and hand over to exit supervision. On error the caller
    /// resets the slot.
    fn spawn_worker(
        &self,
        task_type: &TaskType,
        spec: &LaunchSpec,
        run_id: Uuid,
        slot: &SharedSlot,
    ) -> Result<RunningTask> {
        let stdio = match &self.mode {
            LaunchMode::Captured => StdioMode::Captured,
            LaunchMode::Detached { logs_dir } => StdioMode::Files {
                stdout: open_log_file(logs_dir, task_type, StreamKind::Stdout)?,
                stderr: open_log_file(logs_dir, task_type, StreamKind::Stderr)?,
            },
        };

        let spawned = match ProcessHandle::spawn(task_type, spec, run_id, stdio) {
            Ok(spawned) => spawned,
            Err(err) => {
                warn!(task = %task_type, %err, "worker spawn failed");
                self.note(
                    &JournalEntry::new(JournalEvent::SpawnFailed)
                        .with_task(task_type)
                        .with_reason(err.to_string()),
                );
                return Err(err);
            }
        };

        let handle = spawned.handle;
        let record = handle.record();

        if let Err(err) = self.store.put(&record) {
            warn!(task = %task_type, pid = record.pid, %err, "cannot record run; terminating worker");
            if handle.terminate().is_err() {
                handle.force_kill();
            }
            if matches!(err, AppError::AlreadyRunning(_)) {
                self.note(
                    &JournalEntry::new(JournalEvent::StartRejected)
                        .with_run(&record)
                        .with_reason(err.to_string()),
                );
            }
            return Err(err);
        }

        let cancel = CancellationToken::new();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = spawned.stdout {
            readers.push(tokio::spawn(run_reader(
                task_type.clone(),
                StreamKind::Stdout,
                stdout,
                Arc::clone(&self.broker),
                cancel.clone(),
            )));
        }
        if let Some(stderr) = spawned.stderr {
            readers.push(tokio::spawn(run_reader(
                task_type.clone(),
                StreamKind::Stderr,
                stderr,
                Arc::clone(&self.broker),
                cancel.clone(),
            )));
        }

        {
            let mut guard = lock(slot);
            guard.transition(TaskState::Running);
            guard.handle = Some(handle.clone());

            if guard.stop_requested {
                debug!(task = %task_type, "stop requested during start; terminating");
                match handle.terminate() {
                    Ok(()) => guard.transition(TaskState::Stopping),
                    Err(err) => warn!(task = %task_type, %err, "deferred stop failed"),
                }
            }
        }

        let watch = ExitWatch {
            slot: Arc::clone(slot),
            store: Arc::clone(&self.store),
            broker: Arc::clone(&self.broker),
            journal: self.journal.clone(),
            drain_timeout: self.drain_timeout,
        };
        tokio::spawn(watch.run(handle, readers, cancel));

        info!(task = %task_type, pid = record.pid, run_id = %record.run_id, "task started");
        self.note(&JournalEntry::new(JournalEvent::TaskStarted).with_run(&record));
        Ok(record)
    }

    /// Request termination of the run of `name`.
    ///
    /// Returns the status after the request: `Stopping` with the run
    /// record, or `Starting` when the stop was queued behind an in-flight
    /// spawn and will be applied as soon as it completes.
    ///
    /// # Errors
    ///
    /// - `AppError::UnknownTask` if `name` is not registered.
    /// - `AppError::NotRunning` if no run is live (a stale record is
    ///   cleared first; nothing is touched when there is no record).
    /// - `AppError::Termination` if the signal cannot be delivered.
    pub fn stop(&self, name: &str) -> Result<TaskStatus> {
        let (task_type, _) = self.registry.resolve(name)?;
        let span = info_span!("stop_task", task = %task_type);
        let _guard = span.enter();

        let slot = self.slot(task_type)?;
        let mut guard = lock(slot);

        match guard.state {
            TaskState::Starting => {
                guard.stop_requested = true;
                info!(task = %task_type, "stop queued until spawn completes");
                Ok(TaskStatus::Starting)
            }
            TaskState::Stopping => {
                let run = guard
                    .handle
                    .as_ref()
                    .map(ProcessHandle::record)
                    .ok_or_else(|| AppError::NotRunning(format!("task '{task_type}' has no worker")))?;
                Ok(TaskStatus::Stopping { run })
            }
            TaskState::Running => {
                let handle = guard
                    .handle
                    .clone()
                    .ok_or_else(|| AppError::NotRunning(format!("task '{task_type}' has no worker")))?;
                let run = handle.record();
                if !handle.is_alive() {
                    // Already exited; the run is being wound down.
                    return Ok(TaskStatus::Stopping { run });
                }
                handle.terminate()?;
                guard.transition(TaskState::Stopping);
                drop(guard);

                if let Err(err) = self.store.remove(&run) {
                    warn!(task = %task_type, %err, "failed to remove run record on stop");
                }
                info!(task = %task_type, pid = run.pid, "termination requested");
                self.note(&JournalEntry::new(JournalEvent::TaskStopped).with_run(&run));
                Ok(TaskStatus::Stopping { run })
            }
            TaskState::Idle => {
                drop(guard);
                match self.store.get(task_type)? {
                    Some(record) => self.signal_recorded(record).map(|run| TaskStatus::Stopping { run }),
                    None => Err(AppError::NotRunning(format!(
                        "no running instance of task '{task_type}'"
                    ))),
                }
            }
        }
    }

    /// Terminate a worker known only through its durable record (started by
    /// another controller process).
    fn signal_recorded(&self, record: RunningTask) -> Result<RunningTask> {
        if process::record_alive(&record) && process::signal_terminate(record.pid)? {
            self.store.remove(&record)?;
            info!(task = %record.task_type, pid = record.pid, "termination requested");
            self.note(&JournalEntry::new(JournalEvent::TaskStopped).with_run(&record));
            return Ok(record);
        }

        self.clear_stale(&record)?;
        Err(AppError::NotRunning(format!(
            "recorded pid {} for task '{}' is no longer running; record cleared",
            record.pid, record.task_type
        )))
    }

    /// Stop whatever run the durable store records, regardless of task.
    ///
    /// # Errors
    ///
    /// - `AppError::NotRunning` if there is no record, or the record was
    ///   stale (it is cleared).
    /// - `AppError::Termination` if the signal cannot be delivered; the
    ///   record is kept.
    pub fn stop_tracked(&self) -> Result<RunningTask> {
        let span = info_span!("stop_tracked");
        let _guard = span.enter();

        let Some(record) = self.store.list()?.into_iter().next() else {
            return Err(AppError::NotRunning("no process is being tracked".into()));
        };

        let owned = self.slots.get(&record.task_type).is_some_and(|slot| {
            lock(slot)
                .handle
                .as_ref()
                .is_some_and(|handle| handle.run_id() == record.run_id)
        });
        if owned {
            self.stop(record.task_type.as_str())?;
            return Ok(record);
        }

        self.signal_recorded(record)
    }

    /// Status of the single durable record; a stale record is cleared.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the store cannot be read or cleaned.
    pub fn tracked_status(&self) -> Result<TrackedStatus> {
        let Some(record) = self.store.list()?.into_iter().next() else {
            return Ok(TrackedStatus::Idle);
        };
        if process::record_alive(&record) {
            return Ok(TrackedStatus::Running(record));
        }
        self.clear_stale(&record)?;
        Ok(TrackedStatus::Stale(record))
    }

    /// Current status of `name`, cross-checked against liveness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownTask` for unregistered names and
    /// `AppError::Io` if the store cannot be read or cleaned.
    pub fn status(&self, name: &str) -> Result<TaskStatus> {
        let (task_type, _) = self.registry.resolve(name)?;
        self.status_of(task_type)
    }

    fn status_of(&self, task_type: &TaskType) -> Result<TaskStatus> {
        let (state, worker) = {
            let guard = lock(self.slot(task_type)?);
            let worker = guard.handle.as_ref().map(|h| (h.record(), h.is_alive()));
            (guard.state, worker)
        };

        match (state, worker) {
            (TaskState::Running, Some((run, true))) => Ok(TaskStatus::Running { run }),
            // Exit observed or termination requested; the slot is held
            // until the run's output has been drained.
            (TaskState::Running | TaskState::Stopping, Some((run, _))) => {
                Ok(TaskStatus::Stopping { run })
            }
            // The handle is published together with `Running`.
            (TaskState::Starting | TaskState::Running | TaskState::Stopping, _) => {
                Ok(TaskStatus::Starting)
            }
            (TaskState::Idle, _) => match self.store.get(task_type)? {
                Some(run) if process::record_alive(&run) => Ok(TaskStatus::Running { run }),
                Some(stale) => {
                    self.clear_stale(&stale)?;
                    Ok(TaskStatus::Idle)
                }
                None => Ok(TaskStatus::Idle),
            },
        }
    }

    /// Status of every registered task, in name order.
    ///
    /// # Errors
    ///
    /// Same as [`Supervisor::status`].
    pub fn status_all(&self) -> Result<Vec<(TaskType, TaskStatus)>> {
        self.registry
            .task_types()
            .map(|task_type| Ok((task_type.clone(), self.status_of(task_type)?)))
            .collect()
    }

    /// Attach to the output of `name` without starting it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownTask` for unregistered names.
    pub fn subscribe(&self, name: &str) -> Result<Subscription> {
        let (task_type, _) = self.registry.resolve(name)?;
        Ok(self.broker.attach(task_type))
    }

    /// Start `name`, collect its combined output until it exits and return
    /// it with the exit code. With `limit` set the worker is stopped once
    /// the limit elapses and the output gathered so far is returned.
    ///
    /// # Errors
    ///
    /// Same as [`Supervisor::start`].
    pub async fn run_to_completion(&self, name: &str, limit: Option<Duration>) -> Result<RunOutput> {
        let (record, mut subscription) = self.start_and_subscribe(name)?;
        let mut out = RunOutput::default();

        let finished = match limit {
            Some(limit) => tokio::time::timeout(limit, collect_run(&mut subscription, &mut out))
                .await
                .is_ok(),
            None => {
                collect_run(&mut subscription, &mut out).await;
                true
            }
        };

        if !finished {
            warn!(task = %record.task_type, pid = record.pid, ?limit, "run exceeded its time limit; stopping");
            out.timed_out = true;
            match self.stop(record.task_type.as_str()) {
                Ok(_) | Err(AppError::NotRunning(_)) => {}
                Err(err) => return Err(err),
            }
            collect_run(&mut subscription, &mut out).await;
        }

        Ok(out)
    }

    /// Terminate every supervised worker; force-kill those still alive
    /// after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        let handles: Vec<ProcessHandle> = self
            .slots
            .values()
            .filter_map(|slot| lock(slot).handle.clone())
            .filter(ProcessHandle::is_alive)
            .collect();

        if handles.is_empty() {
            return;
        }

        info!(count = handles.len(), ?grace, "terminating supervised workers");
        for handle in &handles {
            if let Err(err) = handle.terminate() {
                warn!(task = %handle.task_type(), pid = handle.pid(), %err, "terminate failed; killing");
                handle.force_kill();
            }
        }

        let exited = join_all(handles.iter().map(ProcessHandle::wait));
        if tokio::time::timeout(grace, exited).await.is_err() {
            for handle in handles.iter().filter(|h| h.is_alive()) {
                warn!(task = %handle.task_type(), pid = handle.pid(), "worker ignored termination; killing");
                handle.force_kill();
            }
            join_all(handles.iter().map(ProcessHandle::wait)).await;
        }
    }
}

/// Append events to `out` until the run completes or the subscription
/// closes.
async fn collect_run(subscription: &mut Subscription, out: &mut RunOutput) {
    while let Some(event) = subscription.recv().await {
        match event {
            BrokerEvent::Output(event) => out.output.push_str(&event.text()),
            BrokerEvent::Lagged { missed, .. } => {
                out.output.push_str(&format!("[{missed} output chunks dropped]\n"));
            }
            BrokerEvent::Completed { exit_code, .. } => {
                out.exit_code = exit_code;
                return;
            }
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("tasks", &self.registry.names())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
