//! `POST /api/run`: run a task to completion and return its output.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{finished_message, AppState};
use crate::Result;

/// Request body.
#[derive(Debug, Deserialize)]
pub struct RunRequest {
    /// Task name.
    #[serde(rename = "type")]
    pub task_type: String,
}

/// Response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    /// Combined output followed by the completion line.
    pub output: String,
    /// Worker exit code; `null` when killed by a signal.
    pub exit_code: Option<i32>,
    /// Whether the run hit `timeouts.run_seconds` and was stopped.
    #[serde(default)]
    pub timed_out: bool,
}

/// Handler for `POST /api/run`.
///
/// # Errors
///
/// Unknown task (400), already running (409) or spawn failure (500).
pub async fn run_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunResponse>> {
    let limit = match state.config.timeouts.run_seconds {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let run = state
        .supervisor
        .run_to_completion(&request.task_type, limit)
        .await?;
    let (task_type, _) = state.supervisor.registry().resolve(&request.task_type)?;

    info!(task = %task_type, exit_code = ?run.exit_code, "run request finished");

    let mut output = run.output;
    output.push('\n');
    output.push_str(&finished_message(task_type, run.exit_code));

    Ok(Json(RunResponse {
        output,
        exit_code: run.exit_code,
        timed_out: run.timed_out,
    }))
}
