//! Unit tests for `ProcessHandle` against `sh` stub workers.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use uuid::Uuid;

use autorun::models::task::{LaunchSpec, RunningTask, TaskType};
use autorun::orchestrator::process::{
    pid_alive, record_alive, run_identity, signal_terminate, ProcessHandle, StdioMode, RUN_ID_ENV,
    TASK_ENV,
};
use autorun::AppError;

fn sh(script: &str, dir: &Path) -> LaunchSpec {
    LaunchSpec {
        program: "sh".into(),
        args: vec!["-c".into(), script.into()],
        env: BTreeMap::from([("GREETING".to_owned(), "hello".to_owned())]),
        working_dir: dir.to_path_buf(),
        inherit_env: true,
    }
}

fn task() -> TaskType {
    TaskType::parse("swap").expect("valid task name")
}

#[tokio::test]
async fn captures_stdout_and_stderr_separately() {
    let temp = tempfile::tempdir().expect("tempdir");
    let spec = sh("echo out; echo err >&2", temp.path());

    let spawned =
        ProcessHandle::spawn(&task(), &spec, Uuid::new_v4(), StdioMode::Captured).expect("spawn");
    let mut stdout = spawned.stdout.expect("stdout pipe");
    let mut stderr = spawned.stderr.expect("stderr pipe");

    let mut out = String::new();
    let mut err = String::new();
    stdout.read_to_string(&mut out).await.expect("read stdout");
    stderr.read_to_string(&mut err).await.expect("read stderr");

    assert_eq!(out, "out\n");
    assert_eq!(err, "err\n");
    assert_eq!(spawned.handle.wait().await.code, Some(0));
}

#[tokio::test]
async fn injects_task_run_id_and_overrides() {
    let temp = tempfile::tempdir().expect("tempdir");
    let run_id = Uuid::new_v4();
    let script = format!("echo \"${TASK_ENV} ${RUN_ID_ENV} $GREETING\"");
    let spec = sh(&script, temp.path());

    let spawned = ProcessHandle::spawn(&task(), &spec, run_id, StdioMode::Captured).expect("spawn");
    let mut out = String::new();
    spawned
        .stdout
        .expect("stdout pipe")
        .read_to_string(&mut out)
        .await
        .expect("read");

    assert_eq!(out, format!("swap {run_id} hello\n"));
}

#[tokio::test]
async fn restricted_environment_keeps_only_allowlist_and_overrides() {
    let temp = tempfile::tempdir().expect("tempdir");
    // cargo exports CARGO_MANIFEST_DIR to test processes; it is not allowlisted.
    let mut spec = sh(
        "echo \"[${CARGO_MANIFEST_DIR:-unset}] [${PATH:+path}] $GREETING\"",
        temp.path(),
    );
    spec.inherit_env = false;

    let spawned =
        ProcessHandle::spawn(&task(), &spec, Uuid::new_v4(), StdioMode::Captured).expect("spawn");
    let mut out = String::new();
    spawned
        .stdout
        .expect("stdout pipe")
        .read_to_string(&mut out)
        .await
        .expect("read");

    assert_eq!(out, "[unset] [path] hello\n");
}

#[tokio::test]
async fn runs_in_the_working_directory() {
    let temp = tempfile::tempdir().expect("tempdir");
    let canonical = temp.path().canonicalize().expect("canonical");
    let spec = sh("pwd", &canonical);

    let spawned =
        ProcessHandle::spawn(&task(), &spec, Uuid::new_v4(), StdioMode::Captured).expect("spawn");
    let mut out = String::new();
    spawned
        .stdout
        .expect("stdout pipe")
        .read_to_string(&mut out)
        .await
        .expect("read");

    assert_eq!(Path::new(out.trim()), canonical);
}

#[tokio::test]
async fn missing_program_is_a_spawn_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut spec = sh("true", temp.path());
    spec.program = "/nonexistent/autorun-worker".into();

    let err = ProcessHandle::spawn(&task(), &spec, Uuid::new_v4(), StdioMode::Captured)
        .expect_err("must fail");
    assert!(matches!(err, AppError::Spawn(ref msg) if msg.contains("autorun-worker")));
}

#[tokio::test]
async fn exit_code_is_reported_once_exited() {
    let temp = tempfile::tempdir().expect("tempdir");
    let spawned = ProcessHandle::spawn(
        &task(),
        &sh("exit 3", temp.path()),
        Uuid::new_v4(),
        StdioMode::Captured,
    )
    .expect("spawn");
    let handle = spawned.handle;

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("exits");
    assert_eq!(outcome.code, Some(3));
    assert!(!handle.is_alive());
    assert_eq!(handle.exit_outcome(), Some(outcome));
    assert!(handle.exit_watch().borrow().is_some());

    // Terminating an exited worker is a no-op.
    handle.terminate().expect("idempotent terminate");
}

#[tokio::test]
async fn terminate_delivers_sigterm() {
    let temp = tempfile::tempdir().expect("tempdir");
    let spawned = ProcessHandle::spawn(
        &task(),
        &sh("exec sleep 30", temp.path()),
        Uuid::new_v4(),
        StdioMode::Captured,
    )
    .expect("spawn");
    let handle = spawned.handle;
    assert!(handle.is_alive());
    assert!(pid_alive(handle.pid()));

    handle.terminate().expect("terminate");
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("exits after SIGTERM");

    assert_eq!(outcome.code, None);
    assert_eq!(outcome.signal, Some(15));
    assert!(outcome.describe().contains("signal 15"));
}

#[tokio::test]
async fn force_kill_ends_a_worker_ignoring_sigterm() {
    let temp = tempfile::tempdir().expect("tempdir");
    let spawned = ProcessHandle::spawn(
        &task(),
        &sh("trap '' TERM; while true; do sleep 1; done", temp.path()),
        Uuid::new_v4(),
        StdioMode::Captured,
    )
    .expect("spawn");
    let handle = spawned.handle;

    handle.force_kill();
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("killed");
    assert_eq!(outcome.signal, Some(9));
}

#[tokio::test]
async fn detached_worker_writes_to_files() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out_path = temp.path().join("w.out.log");
    let err_path = temp.path().join("w.err.log");
    let stdio = StdioMode::Files {
        stdout: std::fs::File::create(&out_path).expect("out file"),
        stderr: std::fs::File::create(&err_path).expect("err file"),
    };

    let spawned = ProcessHandle::spawn(
        &task(),
        &sh("echo A; echo B >&2", temp.path()),
        Uuid::new_v4(),
        stdio,
    )
    .expect("spawn");
    assert!(spawned.stdout.is_none());
    assert!(spawned.stderr.is_none());
    spawned.handle.wait().await;

    assert_eq!(std::fs::read_to_string(out_path).expect("out"), "A\n");
    assert_eq!(std::fs::read_to_string(err_path).expect("err"), "B\n");
}

#[test]
fn pid_checks_tolerate_unknown_processes() {
    assert!(pid_alive(std::process::id()));
    assert!(!pid_alive(0));
    assert!(!pid_alive(u32::MAX));
    assert!(matches!(signal_terminate(0), Err(AppError::Termination(_))));
}

#[cfg(target_os = "linux")]
#[test]
fn run_identity_detects_reused_pid() {
    // This test process never carries an autorun run id.
    let own = std::process::id();
    assert_eq!(run_identity(own, Uuid::new_v4()), Some(false));
    assert_eq!(run_identity(own, Uuid::nil()), None);

    let record = RunningTask::new(TaskType::parse("lp").expect("valid"), own, Uuid::new_v4());
    assert!(!record_alive(&record));

    let unattributed = RunningTask::new(TaskType::unattributed(), own, Uuid::nil());
    assert!(record_alive(&unattributed));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn run_identity_confirms_own_worker() {
    let temp = tempfile::tempdir().expect("tempdir");
    let run_id = Uuid::new_v4();
    let spawned = ProcessHandle::spawn(
        &task(),
        &sh("exec sleep 30", temp.path()),
        run_id,
        StdioMode::Captured,
    )
    .expect("spawn");
    let handle = spawned.handle;

    assert_eq!(run_identity(handle.pid(), run_id), Some(true));
    assert!(record_alive(&handle.record()));

    handle.force_kill();
    handle.wait().await;
    assert!(!record_alive(&handle.record()));
}
