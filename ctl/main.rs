#![forbid(unsafe_code)]

//! `autorun`: command-line controller.
//!
//! Starts one worker detached from the terminal (its output appended to
//! the task's log files), or in the foreground with `--attach`. The run is
//! recorded in the workspace marker file so that later invocations can
//! report on it and stop it.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, warn};

use autorun::config::GlobalConfig;
use autorun::http::finished_message;
use autorun::journal::FileJournal;
use autorun::logging::{init_tracing, LogFormat};
use autorun::models::output::{BrokerEvent, StreamKind};
use autorun::orchestrator::broker::log_file_path;
use autorun::orchestrator::{LaunchMode, OutputBroker, Supervisor, TaskRegistry, TrackedStatus};
use autorun::persistence::FileMarkerStore;
use autorun::{AppError, Result};

#[derive(Debug, Parser)]
#[command(
    name = "autorun",
    about = "Start, stop and inspect autorun workers",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file (built-in tasks when omitted).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the workspace root holding the marker, logs and scripts.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Diagnostic log format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a task.
    Auto {
        /// Task name (e.g. swap, lp, swap_lp).
        task: String,

        /// Stay in the foreground and stream the worker's output; Ctrl-C
        /// stops the worker.
        #[arg(long)]
        attach: bool,
    },

    /// Stop the recorded process.
    Stop,

    /// Show whether the recorded process is still running.
    Status,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format, "warn") {
        eprintln!("❌ {err}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("❌ failed to build tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("❌ {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Cli) -> Result<ExitCode> {
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::builtin()?,
    };
    if let Some(workspace) = args.workspace {
        config.set_workspace_root(workspace)?;
    }

    let attach = matches!(args.command, Command::Auto { attach: true, .. });
    let supervisor = build_supervisor(&config, attach)?;

    match args.command {
        Command::Auto { task, attach } => {
            if !supervisor.registry().contains(&task) {
                print_help(&supervisor);
                return Ok(ExitCode::SUCCESS);
            }
            if attach {
                start_attached(&supervisor, &task).await
            } else {
                start_detached(&supervisor, &config, &task)
            }
        }
        Command::Stop => {
            stop(&supervisor);
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            status(&supervisor, &config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_supervisor(config: &GlobalConfig, attach: bool) -> Result<Supervisor> {
    let logs_dir = config.logs_path();
    let registry = Arc::new(TaskRegistry::from_config(config)?);
    let store = Arc::new(FileMarkerStore::new(config.marker_path()));

    // Detached workers write their log files themselves.
    let (broker, mode) = if attach {
        (
            OutputBroker::new(&config.broker, Some(logs_dir.clone())),
            LaunchMode::Captured,
        )
    } else {
        (
            OutputBroker::new(&config.broker, None),
            LaunchMode::Detached {
                logs_dir: logs_dir.clone(),
            },
        )
    };

    Ok(Supervisor::new(registry, store, Arc::new(broker), mode)
        .with_journal(Arc::new(FileJournal::new(logs_dir)))
        .with_drain_timeout(Duration::from_millis(config.timeouts.drain_millis)))
}

fn print_help(supervisor: &Supervisor) {
    println!();
    println!("❌ Unknown command.");
    println!();
    println!("✅ Usage:");
    for (task_type, description) in supervisor.registry().describe() {
        let entry = format!("auto {task_type}");
        println!("  {entry:<16}- {}", description.unwrap_or("start this task"));
    }
    println!("  {:<16}- stop the running process", "stop");
    println!("  {:<16}- check whether a process is running", "status");
    println!();
}

fn reject_running(err: &AppError) {
    debug!(%err, "start rejected");
    println!("⚠️ A process is still running. Run 'stop' first.");
}

fn start_detached(supervisor: &Supervisor, config: &GlobalConfig, task: &str) -> Result<ExitCode> {
    match supervisor.start(task) {
        Ok(run) => {
            let log_path = log_file_path(&config.logs_dir, &run.task_type, StreamKind::Stdout);
            println!("🚀 Started {} (PID: {})", run.task_type, run.pid);
            println!("📄 Log output: {}", log_path.display());
            Ok(ExitCode::SUCCESS)
        }
        Err(err @ AppError::AlreadyRunning(_)) => {
            reject_running(&err);
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err),
    }
}

async fn start_attached(supervisor: &Supervisor, task: &str) -> Result<ExitCode> {
    let (run, mut subscription) = match supervisor.start_and_subscribe(task) {
        Ok(started) => started,
        Err(err @ AppError::AlreadyRunning(_)) => {
            reject_running(&err);
            return Ok(ExitCode::FAILURE);
        }
        Err(err) => return Err(err),
    };
    println!("🚀 Started {} (PID: {}); press Ctrl-C to stop", run.task_type, run.pid);

    let mut stopping = false;
    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(BrokerEvent::Output(output)) => {
                    let written = match output.stream {
                        StreamKind::Stdout => {
                            let mut out = std::io::stdout().lock();
                            out.write_all(&output.payload).and_then(|()| out.flush())
                        }
                        StreamKind::Stderr => {
                            let mut err = std::io::stderr().lock();
                            err.write_all(&output.payload).and_then(|()| err.flush())
                        }
                    };
                    if let Err(err) = written {
                        debug!(%err, "terminal write failed");
                    }
                }
                Some(BrokerEvent::Lagged { missed, .. }) => {
                    eprintln!("⚠️ {missed} output chunks dropped");
                }
                Some(BrokerEvent::Completed { task_type, exit_code, .. }) => {
                    println!("{}", finished_message(&task_type, exit_code));
                    break;
                }
                None => break,
            },
            signal = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                if let Err(err) = signal {
                    warn!(%err, "ctrl-c handler failed; stopping worker");
                }
                match supervisor.stop(task) {
                    Ok(_) => println!("🛑 Stopping {} (PID: {})", run.task_type, run.pid),
                    Err(AppError::NotRunning(_)) => {}
                    Err(err) => eprintln!("❌ Failed to stop process: {err}"),
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn stop(supervisor: &Supervisor) {
    match supervisor.stop_tracked() {
        Ok(run) => println!("🛑 Process (PID: {}) stopped", run.pid),
        Err(AppError::NotRunning(reason)) => {
            debug!(%reason, "nothing to stop");
            println!("ℹ️ No process is running.");
        }
        Err(err) => eprintln!("❌ Failed to stop process: {err}"),
    }
}

fn status(supervisor: &Supervisor, config: &GlobalConfig) -> Result<()> {
    match supervisor.tracked_status()? {
        TrackedStatus::Running(run) => {
            println!("✅ Process is running (PID: {}, task: {})", run.pid, run.task_type);
        }
        TrackedStatus::Stale(run) => {
            println!(
                "⚠️ PID {} was recorded but the process is gone. Removed {}.",
                run.pid,
                config.marker_file.display()
            );
        }
        TrackedStatus::Idle => println!("ℹ️ No process is running."),
    }
    Ok(())
}
