//! Output events fanned out by the broker.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskType;

/// Which standard stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl StreamKind {
    /// Short name used in log file names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "out",
            Self::Stderr => "err",
        }
    }
}

/// One chunk of worker output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    /// Producing task.
    pub task_type: TaskType,
    /// Source stream.
    pub stream: StreamKind,
    /// Raw bytes exactly as produced (a line including its `\n`, or a
    /// bounded fragment of an over-long line).
    pub payload: Bytes,
    /// Time the chunk was read.
    pub timestamp: DateTime<Utc>,
}

impl OutputEvent {
    /// Build an event stamped with the current time.
    #[must_use]
    pub fn new(task_type: TaskType, stream: StreamKind, payload: Bytes) -> Self {
        Self {
            task_type,
            stream,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Payload decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Message delivered to a broker subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Output chunk.
    Output(OutputEvent),
    /// This subscriber's queue overflowed and `missed` events were dropped
    /// for it alone.
    Lagged {
        /// Task the dropped events belonged to.
        task_type: TaskType,
        /// Number of events dropped since the last delivery.
        missed: u64,
    },
    /// Terminal event: the worker exited and all its output was published.
    Completed {
        /// Task that completed.
        task_type: TaskType,
        /// Exit code; `None` when the worker was killed by a signal.
        exit_code: Option<i32>,
        /// Time the exit was observed.
        timestamp: DateTime<Utc>,
    },
}

impl BrokerEvent {
    /// Whether this is the terminal event of a run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}
