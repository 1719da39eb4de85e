//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all supervision failure modes.
///
/// The first five variants are the supervision taxonomy: every one of them
/// is recoverable at the call site and is reported to the caller rather
/// than terminating the supervising process.
#[derive(Debug)]
pub enum AppError {
    /// Requested task type is not in the registry.
    UnknownTask(String),
    /// A run of the task (or, for the CLI marker, any task) is already live.
    AlreadyRunning(String),
    /// The operating system refused to create the worker process.
    Spawn(String),
    /// The termination signal could not be delivered.
    Termination(String),
    /// Stop or status was requested for a task with no live run.
    NotRunning(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// HTTP server failure.
    Http(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTask(msg) => write!(f, "unknown task: {msg}"),
            Self::AlreadyRunning(msg) => write!(f, "already running: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn failed: {msg}"),
            Self::Termination(msg) => write!(f, "termination failed: {msg}"),
            Self::NotRunning(msg) => write!(f, "not running: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Http(msg) => write!(f, "http: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
