//! Global configuration parsing and validation.
//!
//! The configuration is the single source of task launch specifications;
//! every front-end builds its [`crate::orchestrator::registry::TaskRegistry`]
//! from the same [`GlobalConfig`].

use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::models::task::TaskType;
use crate::{AppError, Result};

/// Placeholder expanded to the canonical workspace root inside `env` values.
pub const WORKSPACE_PLACEHOLDER: &str = "${workspace_root}";

/// Configuration used when no `--config` file is supplied.
///
/// Mirrors the stock deployment: three Python trading scripts run
/// unbuffered from the workspace root with the workspace on `PYTHONPATH`.
pub const BUILTIN_CONFIG: &str = r#"
workspace_root = "."
logs_dir = "logs"
marker_file = ".pid"

[env]
PYTHONPATH = "${workspace_root}"

[tasks.swap]
program = "python3"
args = ["-u", "scripts/auto_swap.py"]
description = "auto swap"

[tasks.lp]
program = "python3"
args = ["-u", "scripts/auto_LP.py"]
description = "auto LP"

[tasks.swap_lp]
program = "python3"
args = ["-u", "scripts/auto_swap_lp.py"]
description = "combined swap and LP"
"#;

/// Launch specification for a single task type.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TaskConfig {
    /// Executable to run (looked up on `PATH` when not absolute).
    pub program: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides applied after the global `env` table.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Human-readable description shown in CLI help.
    #[serde(default)]
    pub description: Option<String>,
}

/// Output fan-out sizing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BrokerConfig {
    /// Bounded queue length per live subscriber; overflow drops events.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
    /// Events of the current run retained for late subscribers.
    #[serde(default = "default_backlog_events")]
    pub backlog_events: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: default_subscriber_capacity(),
            backlog_events: default_backlog_events(),
        }
    }
}

/// Timeout values for run and shutdown flows.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Upper bound for `POST /api/run`; 0 means no timeout.
    #[serde(default)]
    pub run_seconds: u64,
    /// How long to keep draining output pipes after the worker exits.
    #[serde(default = "default_drain_millis")]
    pub drain_millis: u64,
    /// Grace period between SIGTERM and forced kill on server shutdown.
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            run_seconds: 0,
            drain_millis: default_drain_millis(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

fn default_subscriber_capacity() -> usize {
    256
}

fn default_backlog_events() -> usize {
    1024
}

fn default_drain_millis() -> u64 {
    2000
}

fn default_shutdown_grace_seconds() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_marker_file() -> PathBuf {
    PathBuf::from(".pid")
}

fn default_http_port() -> u16 {
    3000
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Global configuration parsed from `autorun.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory workers run in; relative paths below resolve against it.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Directory holding `<task>.out.log`, `<task>.err.log` and the journal.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    /// Durable marker file used by the CLI controller.
    #[serde(default = "default_marker_file")]
    pub marker_file: PathBuf,
    /// HTTP port for the server front-end.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Address the server binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Whether workers inherit the supervisor's full environment.
    #[serde(default = "default_true")]
    pub inherit_env: bool,
    /// Environment overrides applied to every task.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Output fan-out sizing.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Run and shutdown timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Task registry keyed by task type.
    pub tasks: BTreeMap<String, TaskConfig>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in configuration rooted at the current directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the current directory cannot be resolved.
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_CONFIG)
    }

    /// Replace the workspace root and re-validate.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the path does not exist.
    pub fn set_workspace_root(&mut self, root: impl Into<PathBuf>) -> Result<()> {
        self.workspace_root = root.into();
        self.validate()
    }

    /// Absolute logs directory.
    #[must_use]
    pub fn logs_path(&self) -> PathBuf {
        self.workspace_root.join(&self.logs_dir)
    }

    /// Absolute path of the durable marker file.
    #[must_use]
    pub fn marker_path(&self) -> PathBuf {
        self.workspace_root.join(&self.marker_file)
    }

    /// Expand [`WORKSPACE_PLACEHOLDER`] in an environment value.
    #[must_use]
    pub fn expand(&self, value: &str) -> String {
        value.replace(
            WORKSPACE_PLACEHOLDER,
            &self.workspace_root.to_string_lossy(),
        )
    }

    fn validate(&mut self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(AppError::Config("at least one task must be configured".into()));
        }

        for (name, task) in &self.tasks {
            TaskType::parse(name)
                .map_err(|err| AppError::Config(format!("invalid task name '{name}': {err}")))?;
            if task.program.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "task '{name}' must define a non-empty program"
                )));
            }
        }

        if self.broker.subscriber_capacity == 0 {
            return Err(AppError::Config(
                "broker.subscriber_capacity must be greater than zero".into(),
            ));
        }

        if self.broker.backlog_events == 0 {
            return Err(AppError::Config(
                "broker.backlog_events must be greater than zero".into(),
            ));
        }

        let canonical_root = self
            .workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;
        self.workspace_root = canonical_root;

        Ok(())
    }
}
