//! Exclusivity under concurrent starts.

#![cfg(unix)]

use std::sync::Arc;

use tokio::sync::Barrier;

use autorun::AppError;

use super::test_helpers::{is_running, server_supervisor, test_config, wait_until_idle};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_admit_exactly_one() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let supervisor = server_supervisor(&config);
    let barrier = Arc::new(Barrier::new(8));

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let supervisor = Arc::clone(&supervisor);
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                supervisor.start("lp")
            })
        })
        .collect();

    let mut started = 0;
    let mut rejected = 0;
    for attempt in attempts {
        match attempt.await.expect("task") {
            Ok(_) => started += 1,
            Err(AppError::AlreadyRunning(_)) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(started, 1);
    assert_eq!(rejected, 7);
    assert!(is_running(&supervisor.status("lp").expect("status")));

    supervisor.stop("lp").expect("stop");
    wait_until_idle(&supervisor, "lp").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_tasks_start_independently() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let supervisor = server_supervisor(&config);

    let lp = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.start("lp") })
    };
    let stubborn = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.start("stubborn") })
    };

    let lp = lp.await.expect("task").expect("lp starts");
    let stubborn = stubborn.await.expect("task").expect("stubborn starts");
    assert_ne!(lp.pid, stubborn.pid);

    supervisor.shutdown(std::time::Duration::from_millis(500)).await;
    wait_until_idle(&supervisor, "lp").await;
    wait_until_idle(&supervisor, "stubborn").await;
}
