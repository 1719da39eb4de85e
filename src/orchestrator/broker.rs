//! Output broker: fans worker output out to live subscribers and log files.
//!
//! One topic per task type. Each topic holds:
//! - the attached subscribers, each with its own bounded `mpsc` queue;
//! - a bounded backlog of the current run's events, so a subscriber that
//!   attaches after the worker started still sees the run from its first
//!   byte (attach snapshots the backlog and registers the queue under the
//!   same lock, so no event can fall between the two). When a long run has
//!   pushed its oldest events out of the backlog, the snapshot starts with
//!   a [`BrokerEvent::Lagged`] counting them;
//! - the append-only `<task>.out.log` / `<task>.err.log` mirror, written
//!   whether or not anyone is subscribed.
//!
//! Every topic has its own lock; the topic map is locked only long enough
//! to look a topic up, so a slow log disk stalls only the task writing to
//! it.
//!
//! ## Backpressure
//!
//! Publishing never blocks. When a subscriber's queue is full the event is
//! dropped for that subscriber only and counted; before its next delivered
//! event the subscriber receives [`BrokerEvent::Lagged`] with the number of
//! events it missed. Other subscribers, the log mirror and the worker are
//! unaffected. The terminal [`BrokerEvent::Completed`] is never dropped: if
//! the queue is full it is handed to a background send.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::models::output::{BrokerEvent, OutputEvent, StreamKind};
use crate::models::task::TaskType;

/// Path of the append-only log for `task_type` and `stream`.
#[must_use]
pub fn log_file_path(logs_dir: &Path, task_type: &TaskType, stream: StreamKind) -> PathBuf {
    logs_dir.join(format!("{task_type}.{}.log", stream.as_str()))
}

/// Open `path` for appending, creating it and its directory if needed.
///
/// # Errors
///
/// Returns the underlying I/O error if the directory or file cannot be
/// created.
pub fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Open (creating if needed) the append-only log for one stream.
///
/// # Errors
///
/// Returns the underlying I/O error if the directory or file cannot be
/// created.
pub fn open_log_file(
    logs_dir: &Path,
    task_type: &TaskType,
    stream: StreamKind,
) -> std::io::Result<File> {
    open_append(&log_file_path(logs_dir, task_type, stream))
}

/// Append-only mirror of one run's output.
struct LogSink {
    stdout: File,
    stderr: File,
}

impl LogSink {
    fn open(logs_dir: &Path, task_type: &TaskType) -> std::io::Result<Self> {
        Ok(Self {
            stdout: open_log_file(logs_dir, task_type, StreamKind::Stdout)?,
            stderr: open_log_file(logs_dir, task_type, StreamKind::Stderr)?,
        })
    }

    fn write(&mut self, event: &OutputEvent) -> std::io::Result<()> {
        let file = match event.stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        };
        file.write_all(&event.payload)
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<BrokerEvent>,
    missed: u64,
}

#[derive(Default)]
struct Topic {
    subscribers: Vec<Subscriber>,
    backlog: VecDeque<BrokerEvent>,
    /// Events of the current run pushed out of `backlog`.
    evicted: u64,
    sink: Option<LogSink>,
}

impl Topic {
    fn remember(&mut self, event: BrokerEvent, limit: usize) {
        if self.backlog.len() >= limit {
            self.backlog.pop_front();
            self.evicted += 1;
        }
        self.backlog.push_back(event);
    }

    fn snapshot(&self, task_type: &TaskType) -> VecDeque<BrokerEvent> {
        let mut backlog = VecDeque::with_capacity(self.backlog.len() + 1);
        if self.evicted > 0 {
            backlog.push_back(BrokerEvent::Lagged {
                task_type: task_type.clone(),
                missed: self.evicted,
            });
        }
        backlog.extend(self.backlog.iter().cloned());
        backlog
    }
}

type SharedTopic = Arc<Mutex<Topic>>;

fn lock_topic(topic: &SharedTopic) -> MutexGuard<'_, Topic> {
    topic.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Multiplexes worker output to subscribers and the log mirror.
pub struct OutputBroker {
    topics: Mutex<HashMap<TaskType, SharedTopic>>,
    logs_dir: Option<PathBuf>,
    subscriber_capacity: usize,
    backlog_events: usize,
    next_id: AtomicU64,
}

impl OutputBroker {
    /// Create a broker. With `logs_dir` set, every run is mirrored to
    /// `<logs_dir>/<task>.out.log` and `<logs_dir>/<task>.err.log`.
    #[must_use]
    pub fn new(config: &BrokerConfig, logs_dir: Option<PathBuf>) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            logs_dir,
            subscriber_capacity: config.subscriber_capacity.max(1),
            backlog_events: config.backlog_events.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Topic for `task_type`, created on first use.
    fn topic(&self, task_type: &TaskType) -> SharedTopic {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(topics.entry(task_type.clone()).or_default())
    }

    fn existing_topic(&self, task_type: &TaskType) -> Option<SharedTopic> {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.get(task_type).cloned()
    }

    /// Reset the topic for a new run: clear the backlog and open the log
    /// mirror. Existing subscribers stay attached.
    pub fn begin_run(&self, task_type: &TaskType) {
        let sink = self.logs_dir.as_deref().and_then(|dir| {
            LogSink::open(dir, task_type)
                .map_err(|err| {
                    warn!(task = %task_type, %err, "cannot open output log files; mirroring disabled for this run");
                })
                .ok()
        });

        let topic = self.topic(task_type);
        let mut topic = lock_topic(&topic);
        topic.backlog.clear();
        topic.evicted = 0;
        topic.sink = sink;
    }

    /// Attach a new subscriber to `task_type`.
    ///
    /// The returned [`Subscription`] first yields the backlog of the
    /// current (or most recent) run, then live events. Dropping it detaches.
    pub fn attach(self: &Arc<Self>, task_type: &TaskType) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);

        let backlog = {
            let topic = self.topic(task_type);
            let mut topic = lock_topic(&topic);
            topic.subscribers.push(Subscriber { id, tx, missed: 0 });
            topic.snapshot(task_type)
        };

        debug!(task = %task_type, subscriber = id, backlog = backlog.len(), "subscriber attached");

        Subscription {
            id,
            task_type: task_type.clone(),
            backlog,
            rx,
            broker: Arc::clone(self),
        }
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn detach(&self, task_type: &TaskType, id: u64) {
        if let Some(topic) = self.existing_topic(task_type) {
            let mut topic = lock_topic(&topic);
            let before = topic.subscribers.len();
            topic.subscribers.retain(|sub| sub.id != id);
            if topic.subscribers.len() != before {
                debug!(task = %task_type, subscriber = id, "subscriber detached");
            }
        }
    }

    /// Number of subscribers currently attached to `task_type`.
    #[must_use]
    pub fn subscriber_count(&self, task_type: &TaskType) -> usize {
        self.existing_topic(task_type)
            .map_or(0, |topic| lock_topic(&topic).subscribers.len())
    }

    /// Fan an output chunk out to the log mirror and every subscriber.
    pub fn publish(&self, event: OutputEvent) {
        let topic = self.topic(&event.task_type);
        let mut topic = lock_topic(&topic);

        if let Some(sink) = topic.sink.as_mut() {
            if let Err(err) = sink.write(&event) {
                warn!(task = %event.task_type, %err, "failed to append worker output to log file");
            }
        }

        let task_type = event.task_type.clone();
        let event = BrokerEvent::Output(event);
        topic.remember(event.clone(), self.backlog_events);
        topic
            .subscribers
            .retain_mut(|sub| deliver(sub, &event, &task_type));
    }

    /// Publish the terminal event of a run and close its log mirror.
    pub fn complete(&self, task_type: &TaskType, exit_code: Option<i32>) {
        let topic = self.topic(task_type);
        let mut topic = lock_topic(&topic);
        topic.sink = None;

        let event = BrokerEvent::Completed {
            task_type: task_type.clone(),
            exit_code,
            timestamp: Utc::now(),
        };
        topic.remember(event.clone(), self.backlog_events);
        topic
            .subscribers
            .retain_mut(|sub| deliver_terminal(sub, event.clone(), task_type));
    }
}

/// Best-effort delivery; returns `false` once the subscriber is gone.
fn deliver(sub: &mut Subscriber, event: &BrokerEvent, task_type: &TaskType) -> bool {
    if sub.missed > 0 {
        let lagged = BrokerEvent::Lagged {
            task_type: task_type.clone(),
            missed: sub.missed,
        };
        match sub.tx.try_send(lagged) {
            Ok(()) => sub.missed = 0,
            Err(TrySendError::Full(_)) => {
                sub.missed += 1;
                return true;
            }
            Err(TrySendError::Closed(_)) => return false,
        }
    }

    match sub.tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            sub.missed += 1;
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Guaranteed delivery of a terminal event, falling back to a background
/// send when the queue is full.
fn deliver_terminal(sub: &mut Subscriber, event: BrokerEvent, task_type: &TaskType) -> bool {
    let mut pending = Vec::with_capacity(2);
    if sub.missed > 0 {
        pending.push(BrokerEvent::Lagged {
            task_type: task_type.clone(),
            missed: sub.missed,
        });
        sub.missed = 0;
    }
    pending.push(event);

    if pending.len() == 1 {
        match sub.tx.try_send(pending.remove(0)) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(event)) => pending.push(event),
        }
    }

    let tx = sub.tx.clone();
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                for event in pending {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            });
        }
        Err(_) => {
            warn!(task = %task_type, subscriber = sub.id, "no runtime to queue completion event; dropped");
        }
    }
    true
}

/// A live subscription to one task's output.
pub struct Subscription {
    id: u64,
    task_type: TaskType,
    backlog: VecDeque<BrokerEvent>,
    rx: mpsc::Receiver<BrokerEvent>,
    broker: Arc<OutputBroker>,
}

impl Subscription {
    /// Subscriber identifier, unique per broker.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Task this subscription follows.
    #[must_use]
    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    /// Next event: backlog first, then live events. `None` once the broker
    /// has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<BrokerEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.rx.recv().await
    }

    /// Detach explicitly (dropping the subscription does the same).
    pub fn detach(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broker.detach(&self.task_type, self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("backlog", &self.backlog.len())
            .finish_non_exhaustive()
    }
}
