//! Router assembly and the server loop.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{run, socket, stream, AppState};
use crate::models::task::{TaskStatus, TaskType};
use crate::{AppError, Result};

/// Handler for `GET /health`.
async fn health() -> &'static str {
    "ok"
}

/// One task's status as rendered on the wire.
#[derive(Debug, Serialize)]
pub struct TaskStatusView {
    /// Task name.
    pub task: TaskType,
    /// State plus run record when live.
    #[serde(flatten)]
    pub status: TaskStatus,
}

#[derive(Debug, Serialize)]
struct StatusList {
    tasks: Vec<TaskStatusView>,
}

async fn status_all(State(state): State<Arc<AppState>>) -> Result<Json<StatusList>> {
    let tasks = state
        .supervisor
        .status_all()?
        .into_iter()
        .map(|(task, status)| TaskStatusView { task, status })
        .collect();
    Ok(Json(StatusList { tasks }))
}

async fn status_one(
    State(state): State<Arc<AppState>>,
    Path(task): Path<String>,
) -> Result<Json<TaskStatusView>> {
    let status = state.supervisor.status(&task)?;
    let (task, _) = state.supervisor.registry().resolve(&task)?;
    Ok(Json(TaskStatusView {
        task: task.clone(),
        status,
    }))
}

async fn stop_task(
    State(state): State<Arc<AppState>>,
    Path(task): Path<String>,
) -> Result<Json<TaskStatusView>> {
    let status = state.supervisor.stop(&task)?;
    let (task, _) = state.supervisor.registry().resolve(&task)?;
    Ok(Json(TaskStatusView {
        task: task.clone(),
        status,
    }))
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/run", post(run::run_task))
        .route("/api/status", get(status_all))
        .route("/api/status/{task}", get(status_one))
        .route("/api/stop/{task}", post(stop_task))
        .route("/api/stream/{task}", get(stream::stream_task))
        .route("/api/socket", get(socket::upgrade))
        .with_state(state)
}

/// Serve the router on `listener` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Http` if the server loop fails.
pub async fn serve(state: Arc<AppState>, listener: TcpListener, ct: CancellationToken) -> Result<()> {
    let local = listener
        .local_addr()
        .map_err(|err| AppError::Http(format!("listener has no local address: {err}")))?;
    info!(%local, "http server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Http(format!("server error: {err}")))?;

    info!("http server shut down");
    Ok(())
}
