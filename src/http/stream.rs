//! `GET /api/stream/{task}`: Server-Sent Events tail of a task's output.
//!
//! Replays the current (or last) run from the broker backlog, then follows
//! it live. Event names are `stdout`, `stderr`, `lagged` and `completed`;
//! the stream ends after `completed`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream};

use super::AppState;
use crate::models::output::{BrokerEvent, StreamKind};
use crate::orchestrator::Subscription;
use crate::Result;

/// Render a broker event as an SSE event. Returns whether the stream
/// should continue afterwards.
fn to_sse(event: &BrokerEvent) -> (Event, bool) {
    match event {
        BrokerEvent::Output(output) => {
            let name = match output.stream {
                StreamKind::Stdout => "stdout",
                StreamKind::Stderr => "stderr",
            };
            // SSE fields cannot carry bare carriage returns.
            let text = output.text();
            let text = text.trim_end_matches(['\r', '\n']).replace('\r', "");
            (Event::default().event(name).data(text), true)
        }
        BrokerEvent::Lagged { missed, .. } => {
            (Event::default().event("lagged").data(missed.to_string()), true)
        }
        BrokerEvent::Completed { exit_code, .. } => {
            let code = exit_code.map_or_else(|| "null".to_owned(), |code| code.to_string());
            (Event::default().event("completed").data(code), false)
        }
    }
}

/// Follow `subscription` until its run completes.
pub fn event_stream(subscription: Subscription) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    stream::unfold(Some(subscription), |subscription| async move {
        let mut subscription = subscription?;
        let event = subscription.recv().await?;
        let (sse, more) = to_sse(&event);
        Some((Ok(sse), more.then_some(subscription)))
    })
}

/// Handler for `GET /api/stream/{task}`.
///
/// # Errors
///
/// Returns `AppError::UnknownTask` (400) for unregistered names.
pub async fn stream_task(
    State(state): State<Arc<AppState>>,
    Path(task): Path<String>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let subscription = state.supervisor.subscribe(&task)?;
    Ok(Sse::new(event_stream(subscription)).keep_alive(KeepAlive::default()))
}
