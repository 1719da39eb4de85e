//! Lifecycle tests for the server-scope supervisor.
//!
//! Start, natural exit, stop, spawn failure and output delivery, each
//! against `sh` stub workers.

#![cfg(unix)]

use std::time::Duration;

use autorun::models::output::BrokerEvent;
use autorun::models::task::TaskStatus;
use autorun::orchestrator::Subscription;
use autorun::AppError;

use super::test_helpers::{
    is_running, journal_events, server_supervisor, test_config, wait_until_idle, WAIT,
};

/// Collect output text until completion; returns (text, exit code).
async fn drain(subscription: &mut Subscription) -> (String, Option<i32>) {
    let mut text = String::new();
    loop {
        let event = tokio::time::timeout(WAIT, subscription.recv())
            .await
            .expect("event before timeout")
            .expect("subscription open");
        match event {
            BrokerEvent::Output(output) => text.push_str(&output.text()),
            BrokerEvent::Lagged { missed, .. } => panic!("unexpected lag of {missed}"),
            BrokerEvent::Completed { exit_code, .. } => return (text, exit_code),
        }
    }
}

#[tokio::test]
async fn unknown_task_has_no_side_effects() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let supervisor = server_supervisor(&config);

    let err = supervisor.start("arbitrage").expect_err("unknown");
    assert!(matches!(err, AppError::UnknownTask(_)));
    assert!(matches!(supervisor.stop("arbitrage"), Err(AppError::UnknownTask(_))));
    assert!(matches!(supervisor.status("arbitrage"), Err(AppError::UnknownTask(_))));

    let logs: Vec<_> = std::fs::read_dir(config.logs_path())
        .expect("logs dir")
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".log"))
        .collect();
    assert!(logs.is_empty());
    assert!(journal_events(&config).is_empty());
}

#[tokio::test]
async fn swap_runs_to_completion_and_logs_its_output() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let supervisor = server_supervisor(&config);

    let (run, mut subscription) = supervisor.start_and_subscribe("swap").expect("start");
    assert_eq!(run.task_type.as_str(), "swap");
    assert!(run.pid > 0);

    let (text, exit_code) = drain(&mut subscription).await;
    assert_eq!(text, "A\n");
    assert_eq!(exit_code, Some(0));

    wait_until_idle(&supervisor, "swap").await;
    let log = std::fs::read_to_string(config.logs_path().join("swap.out.log")).expect("log");
    assert!(log.contains('A'));

    let events = journal_events(&config);
    assert!(events.contains(&"task_started".to_owned()));
    assert!(events.contains(&"task_exited".to_owned()));
}

#[tokio::test]
async fn non_zero_exit_surfaces_through_completion() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let supervisor = server_supervisor(&config);

    let (_, mut subscription) = supervisor.start_and_subscribe("swap_lp").expect("start");
    let (text, exit_code) = drain(&mut subscription).await;

    assert_eq!(text, "failing\n");
    assert_eq!(exit_code, Some(3));
    wait_until_idle(&supervisor, "swap_lp").await;

    let err_log =
        std::fs::read_to_string(config.logs_path().join("swap_lp.err.log")).expect("err log");
    assert_eq!(err_log, "failing\n");
}

#[tokio::test]
async fn second_start_is_rejected_and_stop_returns_to_idle() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let supervisor = server_supervisor(&config);

    let run = supervisor.start("lp").expect("first start");
    assert!(is_running(&supervisor.status("lp").expect("status")));

    let err = supervisor.start("lp").expect_err("second start");
    assert!(matches!(err, AppError::AlreadyRunning(_)));

    // Other task types are unaffected.
    supervisor.start("swap").expect("swap alongside lp");

    match supervisor.stop("lp").expect("stop") {
        TaskStatus::Stopping { run: stopping } => assert_eq!(stopping.pid, run.pid),
        other => panic!("expected stopping, got {other:?}"),
    }
    wait_until_idle(&supervisor, "lp").await;

    supervisor.start("lp").expect("restart after stop");
    supervisor.stop("lp").expect("stop again");
    wait_until_idle(&supervisor, "lp").await;

    let events = journal_events(&config);
    assert!(events.contains(&"start_rejected".to_owned()));
    assert!(events.contains(&"task_stopped".to_owned()));
}

#[tokio::test]
async fn stop_on_idle_is_not_running_without_side_effects() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let supervisor = server_supervisor(&config);
    let before: Vec<_> = std::fs::read_dir(temp.path())
        .expect("read dir")
        .filter_map(Result::ok)
        .map(|entry| entry.file_name())
        .collect();

    let err = supervisor.stop("lp").expect_err("idle");
    assert!(matches!(err, AppError::NotRunning(_)));

    let after: Vec<_> = std::fs::read_dir(temp.path())
        .expect("read dir")
        .filter_map(Result::ok)
        .map(|entry| entry.file_name())
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn stopped_worker_completes_without_exit_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let supervisor = server_supervisor(&config);

    let (_, mut subscription) = supervisor.start_and_subscribe("lp").expect("start");
    match tokio::time::timeout(WAIT, subscription.recv()).await.expect("output") {
        Some(BrokerEvent::Output(output)) => assert_eq!(output.text(), "started\n"),
        other => panic!("expected output, got {other:?}"),
    }

    supervisor.stop("lp").expect("stop");
    let (_, exit_code) = drain(&mut subscription).await;
    assert_eq!(exit_code, None);
}

#[tokio::test]
async fn spawn_failure_returns_to_idle() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let supervisor = server_supervisor(&config);

    for _ in 0..2 {
        let err = supervisor.start("broken").expect_err("spawn fails");
        assert!(matches!(err, AppError::Spawn(_)));
        assert!(supervisor.status("broken").expect("status").is_idle());
    }
    assert!(journal_events(&config).contains(&"spawn_failed".to_owned()));
}

#[tokio::test]
async fn subscribers_see_every_line_in_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let supervisor = server_supervisor(&config);

    let (_, mut first) = supervisor.start_and_subscribe("chatty").expect("start");
    let mut late = supervisor.subscribe("chatty").expect("late attach");
    let quitter = supervisor.subscribe("chatty").expect("third subscriber");
    drop(quitter);

    let expected: String = (0..200).map(|i| format!("line{i}\n")).collect();
    let (text, exit_code) = drain(&mut first).await;
    assert_eq!(text, expected);
    assert_eq!(exit_code, Some(0));

    let (late_text, _) = drain(&mut late).await;
    assert_eq!(late_text, expected);
}

#[tokio::test]
async fn status_all_lists_every_task() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let supervisor = server_supervisor(&config);
    supervisor.start("lp").expect("start");

    let statuses = supervisor.status_all().expect("status");
    let names: Vec<_> = statuses.iter().map(|(task, _)| task.as_str()).collect();
    assert_eq!(
        names,
        vec!["broken", "chatty", "lp", "orphan", "prompt", "stubborn", "swap", "swap_lp"]
    );
    let lp = statuses
        .iter()
        .find(|(task, _)| task.as_str() == "lp")
        .map(|(_, status)| status)
        .expect("lp listed");
    assert!(is_running(lp));

    supervisor.stop("lp").expect("stop");
    wait_until_idle(&supervisor, "lp").await;
}

#[tokio::test]
async fn run_to_completion_collects_output() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let supervisor = server_supervisor(&config);

    let out = supervisor
        .run_to_completion("swap", None)
        .await
        .expect("run");
    assert_eq!(out.output, "A\n");
    assert_eq!(out.exit_code, Some(0));
    assert!(!out.timed_out);
}

#[tokio::test]
async fn run_to_completion_stops_at_the_limit() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let supervisor = server_supervisor(&config);

    let out = supervisor
        .run_to_completion("lp", Some(Duration::from_millis(300)))
        .await
        .expect("run");
    assert!(out.timed_out);
    assert!(out.output.contains("started"));
    assert_eq!(out.exit_code, None);
    wait_until_idle(&supervisor, "lp").await;
}

#[tokio::test]
async fn status_stays_stopping_until_a_start_would_be_accepted() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    config.timeouts.drain_millis = 2_000;
    let supervisor = server_supervisor(&config);

    // `orphan` exits at once but its background child keeps stdout open,
    // so the exit watcher sits in the output drain.
    supervisor.start("orphan").expect("start");
    tokio::time::sleep(Duration::from_millis(400)).await;

    let status = supervisor.status("orphan").expect("status");
    assert!(
        matches!(status, TaskStatus::Stopping { .. }),
        "expected stopping while draining, got {status:?}"
    );
    let err = supervisor.start("orphan").expect_err("start while draining");
    assert!(matches!(err, AppError::AlreadyRunning(_)));

    wait_until_idle(&supervisor, "orphan").await;
    supervisor.start("orphan").expect("start once idle");
    wait_until_idle(&supervisor, "orphan").await;
}

#[tokio::test]
async fn prompt_without_newline_reaches_subscribers() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = test_config(temp.path());
    let supervisor = server_supervisor(&config);

    let (_run, mut subscription) = supervisor.start_and_subscribe("prompt").expect("start");
    let event = tokio::time::timeout(Duration::from_millis(1_500), subscription.recv())
        .await
        .expect("prompt delivered while the worker waits")
        .expect("subscription open");
    match event {
        BrokerEvent::Output(output) => assert_eq!(output.text(), "Enter amount: "),
        other => panic!("expected output, got {other:?}"),
    }

    supervisor.stop("prompt").expect("stop");
    wait_until_idle(&supervisor, "prompt").await;
}
