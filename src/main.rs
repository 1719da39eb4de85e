#![forbid(unsafe_code)]

//! `autorun-server`: HTTP and live-channel front-end.
//!
//! Bootstraps configuration, builds the shared supervisor with an
//! in-memory state store, serves the HTTP API, and terminates every worker
//! on shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use autorun::config::GlobalConfig;
use autorun::http::{server, AppState};
use autorun::journal::FileJournal;
use autorun::logging::{init_tracing, LogFormat};
use autorun::orchestrator::{LaunchMode, OutputBroker, Supervisor, TaskRegistry};
use autorun::persistence::MemoryStateStore;
use autorun::{AppError, Result};

#[derive(Debug, Parser)]
#[command(name = "autorun-server", about = "HTTP front-end for autorun workers", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file (built-in tasks when omitted).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the workspace root workers run in.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Override the configured HTTP port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format, "info")?;
    info!("autorun-server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::builtin()?,
    };
    if let Some(workspace) = args.workspace {
        config.set_workspace_root(workspace)?;
    }
    if let Some(port) = args.port {
        config.http_port = port;
    }
    let config = Arc::new(config);
    info!(
        workspace = %config.workspace_root.display(),
        tasks = ?config.tasks.keys().collect::<Vec<_>>(),
        "configuration loaded"
    );

    // ── Build the supervisor ────────────────────────────
    let logs_dir = config.logs_path();
    let registry = Arc::new(TaskRegistry::from_config(&config)?);
    let broker = Arc::new(OutputBroker::new(&config.broker, Some(logs_dir.clone())));
    let supervisor = Supervisor::new(
        registry,
        Arc::new(MemoryStateStore::new()),
        broker,
        LaunchMode::Captured,
    )
    .with_journal(Arc::new(FileJournal::new(logs_dir)))
    .with_drain_timeout(Duration::from_millis(config.timeouts.drain_millis));

    let supervisor = Arc::new(supervisor);
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        supervisor: Arc::clone(&supervisor),
    });

    // ── Start the HTTP server ───────────────────────────
    let bind = SocketAddr::new(config.bind_address, config.http_port);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Http(format!("failed to bind {bind}: {err}")))?;

    let ct = CancellationToken::new();
    let server_ct = ct.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(err) = server::serve(state, listener, server_ct).await {
            error!(%err, "http server failed");
        }
    });

    info!(%bind, "autorun-server ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    supervisor
        .shutdown(Duration::from_secs(config.timeouts.shutdown_grace_seconds))
        .await;

    if let Err(err) = server_handle.await {
        error!(%err, "http server task panicked");
    }
    info!("autorun-server shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}
