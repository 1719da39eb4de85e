//! Unit tests for the `StateStore` implementations.

use std::fs;
use std::sync::{Arc, Barrier};

use uuid::Uuid;

use autorun::models::task::{RunningTask, TaskType};
use autorun::persistence::{FileMarkerStore, MemoryStateStore, StateStore};
use autorun::AppError;

fn task(name: &str) -> TaskType {
    TaskType::parse(name).expect("valid task name")
}

fn record(name: &str, pid: u32) -> RunningTask {
    RunningTask::new(task(name), pid, Uuid::new_v4())
}

// ── FileMarkerStore ──────────────────────────────────────

#[test]
fn marker_round_trips_a_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = FileMarkerStore::new(temp.path().join(".pid"));
    let run = record("swap", 4321);

    store.put(&run).expect("put");

    let raw = fs::read_to_string(store.path()).expect("marker written");
    assert!(raw.starts_with("4321 swap "));
    assert!(raw.ends_with(&format!("{}\n", run.run_id)));

    let stored = store.get(&task("swap")).expect("get").expect("present");
    assert_eq!(stored.pid, 4321);
    assert_eq!(stored.run_id, run.run_id);
    assert_eq!(store.list().expect("list").len(), 1);
}

#[test]
fn marker_holds_one_run_across_all_tasks() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = FileMarkerStore::new(temp.path().join(".pid"));
    store.put(&record("swap", 100)).expect("first put");

    let conflict = store.conflicting(&task("lp")).expect("read");
    assert_eq!(conflict.map(|r| r.pid), Some(100));
    assert!(store.get(&task("lp")).expect("get").is_none());

    let err = store.put(&record("lp", 200)).expect_err("second put");
    assert!(matches!(err, AppError::AlreadyRunning(ref msg) if msg.contains("swap")));

    let stored = store.list().expect("list");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].pid, 100);
}

#[test]
fn concurrent_marker_writers_admit_exactly_one() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join(".pid");
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8u32)
        .map(|i| {
            let store = FileMarkerStore::new(path.clone());
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                store.put(&record("swap", 1000 + i)).is_ok()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().expect("thread"))
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);

    let leftovers: Vec<_> = fs::read_dir(temp.path())
        .expect("read dir")
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "staging files must be cleaned up");
}

#[test]
fn remove_only_deletes_the_matching_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = FileMarkerStore::new(temp.path().join(".pid"));
    let run = record("swap", 555);
    store.put(&run).expect("put");

    let impostor = RunningTask {
        run_id: Uuid::new_v4(),
        ..run.clone()
    };
    assert!(!store.remove(&impostor).expect("remove"));
    assert!(store.path().exists());

    assert!(store.remove(&run).expect("remove"));
    assert!(!store.path().exists());
    assert!(!store.remove(&run).expect("idempotent"));
}

#[test]
fn bare_pid_marker_is_accepted() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = FileMarkerStore::new(temp.path().join(".pid"));
    fs::write(store.path(), "31337").expect("write");

    let stored = store.list().expect("list");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].pid, 31337);
    assert_eq!(stored[0].task_type, TaskType::unattributed());
    assert!(stored[0].run_id.is_nil());

    assert!(store.remove(&stored[0]).expect("remove"));
}

#[test]
fn garbage_marker_is_cleared_on_read() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = FileMarkerStore::new(temp.path().join(".pid"));
    fs::write(store.path(), "not a pid\n").expect("write");

    assert!(store.list().expect("list").is_empty());
    assert!(!store.path().exists());
}

#[test]
fn missing_marker_reads_as_no_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = FileMarkerStore::new(temp.path().join("nested").join(".pid"));

    assert!(store.conflicting(&task("swap")).expect("read").is_none());
    assert!(store.list().expect("list").is_empty());

    store.put(&record("swap", 9)).expect("put creates parent directory");
    assert!(store.path().exists());
}

// ── MemoryStateStore ─────────────────────────────────────

#[test]
fn memory_store_is_exclusive_per_task() {
    let store = MemoryStateStore::new();
    store.put(&record("swap", 1)).expect("swap");
    store.put(&record("lp", 2)).expect("lp runs alongside swap");

    let err = store.put(&record("swap", 3)).expect_err("duplicate swap");
    assert!(matches!(err, AppError::AlreadyRunning(_)));

    assert!(store.conflicting(&task("swap_lp")).expect("read").is_none());
    let pids: Vec<_> = store.list().expect("list").iter().map(|r| r.pid).collect();
    assert_eq!(pids, vec![2, 1]);
}

#[test]
fn memory_store_remove_checks_identity() {
    let store = MemoryStateStore::new();
    let run = record("swap", 1);
    store.put(&run).expect("put");

    assert!(!store.remove(&record("swap", 1)).expect("different run id"));
    assert!(store.remove(&run).expect("remove"));
    assert!(store.get(&task("swap")).expect("get").is_none());
}
