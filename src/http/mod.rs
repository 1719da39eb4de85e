//! HTTP front-end: request/response run endpoint, status and stop
//! endpoints, a Server-Sent Events tail and the WebSocket live channel.
//!
//! Every handler talks to the one [`Supervisor`] held in [`AppState`];
//! errors map to a status code plus a `{"error": "..."}` body.

pub mod run;
pub mod server;
pub mod socket;
pub mod stream;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::config::GlobalConfig;
use crate::models::task::TaskType;
use crate::orchestrator::Supervisor;
use crate::AppError;

/// Shared state injected into every handler.
#[derive(Debug)]
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<GlobalConfig>,
    /// The supervisor owning every worker started through this server.
    pub supervisor: Arc<Supervisor>,
}

/// HTTP status for an application error.
#[must_use]
pub fn status_code(err: &AppError) -> StatusCode {
    match err {
        AppError::UnknownTask(_) => StatusCode::BAD_REQUEST,
        AppError::AlreadyRunning(_) | AppError::NotRunning(_) => StatusCode::CONFLICT,
        AppError::Spawn(_)
        | AppError::Termination(_)
        | AppError::Config(_)
        | AppError::Io(_)
        | AppError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_code(&self);
        if status.is_server_error() {
            tracing::error!(err = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Completion line reported to clients when a run ends.
#[must_use]
pub fn finished_message(task_type: &TaskType, exit_code: Option<i32>) -> String {
    let code = exit_code.map_or_else(|| "null".to_owned(), |code| code.to_string());
    format!("👋 Script '{task_type}' finished with code {code}")
}
