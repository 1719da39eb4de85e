//! Shared helpers for supervisor-level integration tests.
//!
//! Builds configurations whose tasks are `sh -c` stubs, supervisors for
//! both front-end scopes, and polling helpers with bounded waits.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use autorun::config::GlobalConfig;
use autorun::journal::{FileJournal, Journal};
use autorun::models::task::TaskStatus;
use autorun::orchestrator::{LaunchMode, OutputBroker, Supervisor, TaskRegistry};
use autorun::persistence::{FileMarkerStore, MemoryStateStore, StateStore};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

/// Configuration with stub workers:
/// - `swap` prints `A` and exits 0;
/// - `lp` prints `started` and sleeps until terminated;
/// - `swap_lp` writes to stderr and exits 3;
/// - `chatty` prints 200 numbered lines;
/// - `stubborn` ignores SIGTERM;
/// - `orphan` prints `A` and exits, leaving a background child that holds
///   its stdout open for three seconds;
/// - `prompt` prints a prompt without a newline, then sleeps;
/// - `broken` points at a program that does not exist.
pub fn test_config(workspace_root: &Path) -> GlobalConfig {
    let toml = format!(
        r#"
workspace_root = '{root}'
http_port = 0

[broker]
subscriber_capacity = 512
backlog_events = 512

[timeouts]
drain_millis = 500
shutdown_grace_seconds = 2

[tasks.swap]
program = "sh"
args = ["-c", "echo A"]

[tasks.lp]
program = "sh"
args = ["-c", "echo started; exec sleep 30"]

[tasks.swap_lp]
program = "sh"
args = ["-c", "echo failing >&2; exit 3"]

[tasks.chatty]
program = "sh"
args = ["-c", "i=0; while [ $i -lt 200 ]; do echo line$i; i=$((i+1)); done"]

[tasks.stubborn]
program = "sh"
args = ["-c", "trap '' TERM; echo ready; while true; do sleep 1; done"]

[tasks.orphan]
program = "sh"
args = ["-c", "echo A; sleep 3 &"]

[tasks.prompt]
program = "sh"
args = ["-c", "printf 'Enter amount: '; exec sleep 30"]

[tasks.broken]
program = "/nonexistent/autorun-worker"
"#,
        root = workspace_root.display(),
    );
    GlobalConfig::from_toml_str(&toml).expect("valid test config")
}

fn journal(config: &GlobalConfig) -> Arc<dyn Journal> {
    Arc::new(FileJournal::new(config.logs_path()))
}

/// Server-scope supervisor: in-memory store, captured output mirrored to
/// the logs directory.
pub fn server_supervisor(config: &GlobalConfig) -> Arc<Supervisor> {
    let registry = Arc::new(TaskRegistry::from_config(config).expect("registry"));
    let broker = Arc::new(OutputBroker::new(&config.broker, Some(config.logs_path())));
    Arc::new(
        Supervisor::new(
            registry,
            Arc::new(MemoryStateStore::new()),
            broker,
            LaunchMode::Captured,
        )
        .with_journal(journal(config))
        .with_drain_timeout(Duration::from_millis(config.timeouts.drain_millis)),
    )
}

/// CLI-scope supervisor over the workspace marker file.
pub fn cli_supervisor(config: &GlobalConfig, mode: LaunchMode) -> Arc<Supervisor> {
    let registry = Arc::new(TaskRegistry::from_config(config).expect("registry"));
    let mirror = matches!(mode, LaunchMode::Captured).then(|| config.logs_path());
    let broker = Arc::new(OutputBroker::new(&config.broker, mirror));
    let store: Arc<dyn StateStore> = Arc::new(FileMarkerStore::new(config.marker_path()));
    Arc::new(
        Supervisor::new(registry, store, broker, mode)
            .with_journal(journal(config))
            .with_drain_timeout(Duration::from_millis(config.timeouts.drain_millis)),
    )
}

/// Poll until `task` reports idle; panics after [`WAIT`].
///
/// Idle is only reported once the supervision slot has been released, and
/// the server-scope store holds no other record for the task, so a start
/// issued right after this returns is accepted.
pub async fn wait_until_idle(supervisor: &Supervisor, task: &str) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if supervisor.status(task).expect("status").is_idle() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task '{task}' did not become idle"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until `check` holds; panics after [`WAIT`].
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Whether `status` reports a live worker.
pub fn is_running(status: &TaskStatus) -> bool {
    matches!(status, TaskStatus::Running { .. })
}

/// Event names recorded in every journal under the logs directory.
pub fn journal_events(config: &GlobalConfig) -> Vec<String> {
    let Ok(dir) = std::fs::read_dir(config.logs_path()) else {
        return Vec::new();
    };
    dir.filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.to_string_lossy().ends_with(".journal.jsonl"))
        .flat_map(|path| {
            std::fs::read_to_string(path)
                .unwrap_or_default()
                .lines()
                .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
                .filter_map(|value| value["event"].as_str().map(str::to_owned))
                .collect::<Vec<_>>()
        })
        .collect()
}
