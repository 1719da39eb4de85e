//! `GET /api/socket`: WebSocket live channel.
//!
//! One connection multiplexes any number of tasks. Client frames are JSON
//! `{"event": "start-script" | "stop-script" | "attach", "data": "<task>"}`;
//! every server frame is `{"event": "output", "task": ..., "data": ...}`.
//!
//! Each followed task gets a forwarder that copies its subscription into
//! the connection's outbound queue. A slow browser therefore backs up only
//! its own queues; the broker drops and reports lag rather than blocking
//! the worker. Closing the connection aborts the forwarders, which detaches
//! their subscriptions; workers keep running.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{finished_message, AppState};
use crate::models::output::{BrokerEvent, StreamKind};
use crate::orchestrator::{Subscription, Supervisor};
use crate::AppError;

/// Outbound frames buffered per connection.
const OUTBOUND_CAPACITY: usize = 256;

/// Prefix marking stderr chunks on the live channel.
pub const STDERR_PREFIX: &str = "⚠️ Error: ";

/// A frame sent by the browser.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Start a task and follow its output.
    StartScript(String),
    /// Stop a task.
    StopScript(String),
    /// Follow a task's current or last run without starting it.
    Attach(String),
}

/// A frame sent to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// Always `output`.
    pub event: String,
    /// Task the frame concerns, when known.
    pub task: Option<String>,
    /// Text to display.
    pub data: String,
}

impl ServerMessage {
    /// Output frame for `task`.
    #[must_use]
    pub fn output(task: Option<&str>, data: impl Into<String>) -> Self {
        Self {
            event: "output".to_owned(),
            task: task.map(str::to_owned),
            data: data.into(),
        }
    }
}

/// Render one broker event for the browser. Returns the frame and whether
/// the forwarder should keep following.
fn render(event: &BrokerEvent) -> (ServerMessage, bool) {
    match event {
        BrokerEvent::Output(output) => {
            let task = Some(output.task_type.as_str());
            let data = match output.stream {
                StreamKind::Stdout => output.text(),
                StreamKind::Stderr => format!("{STDERR_PREFIX}{}", output.text()),
            };
            (ServerMessage::output(task, data), true)
        }
        BrokerEvent::Lagged { task_type, missed } => (
            ServerMessage::output(
                Some(task_type.as_str()),
                format!("⚠️ {missed} output chunks dropped (client too slow)"),
            ),
            true,
        ),
        BrokerEvent::Completed {
            task_type,
            exit_code,
            ..
        } => (
            ServerMessage::output(Some(task_type.as_str()), finished_message(task_type, *exit_code)),
            false,
        ),
    }
}

/// Copy a subscription into the outbound queue until its run completes.
async fn forward(mut subscription: Subscription, out: mpsc::Sender<ServerMessage>) {
    while let Some(event) = subscription.recv().await {
        let (message, more) = render(&event);
        if out.send(message).await.is_err() || !more {
            break;
        }
    }
    debug!(task = %subscription.task_type(), subscriber = subscription.id(), "forwarder finished");
}

/// Per-connection protocol state, independent of the transport.
pub struct SocketSession {
    supervisor: Arc<Supervisor>,
    out: mpsc::Sender<ServerMessage>,
    forwards: HashMap<String, JoinHandle<()>>,
}

impl SocketSession {
    /// Create a session that writes its frames to `out`.
    #[must_use]
    pub fn new(supervisor: Arc<Supervisor>, out: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            supervisor,
            out,
            forwards: HashMap::new(),
        }
    }

    async fn reply(&self, task: &str, data: String) {
        if self.out.send(ServerMessage::output(Some(task), data)).await.is_err() {
            debug!(task, "connection gone; reply dropped");
        }
    }

    fn follow(&mut self, task: &str, subscription: Subscription) {
        let handle = tokio::spawn(forward(subscription, self.out.clone()));
        if let Some(previous) = self.forwards.insert(task.to_owned(), handle) {
            previous.abort();
        }
    }

    /// Parse and handle one text frame.
    pub async fn handle_text(&mut self, raw: &str) {
        match serde_json::from_str::<ClientMessage>(raw) {
            Ok(message) => self.handle(message).await,
            Err(err) => {
                let reply = ServerMessage::output(None, format!("❌ Invalid message: {err}"));
                if self.out.send(reply).await.is_err() {
                    debug!("connection gone; reply dropped");
                }
            }
        }
    }

    /// Handle one decoded client message.
    pub async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::StartScript(task) => match self.supervisor.start_and_subscribe(&task) {
                Ok((record, subscription)) => {
                    info!(task = %record.task_type, pid = record.pid, "started from live channel");
                    self.follow(&task, subscription);
                }
                Err(AppError::UnknownTask(_)) => {
                    self.reply(&task, format!("❌ Unknown script: {task}")).await;
                }
                Err(AppError::AlreadyRunning(_)) => {
                    self.reply(&task, format!("⚠️ Script '{task}' already running")).await;
                }
                Err(err) => self.reply(&task, format!("❌ {err}")).await,
            },
            ClientMessage::StopScript(task) => match self.supervisor.stop(&task) {
                Ok(_) => self.reply(&task, format!("🛑 Script '{task}' stopped")).await,
                Err(AppError::NotRunning(_)) => {
                    self.reply(&task, format!("ℹ️ No running script for '{task}'")).await;
                }
                Err(AppError::UnknownTask(_)) => {
                    self.reply(&task, format!("❌ Unknown script: {task}")).await;
                }
                Err(err) => self.reply(&task, format!("❌ {err}")).await,
            },
            ClientMessage::Attach(task) => match self.supervisor.subscribe(&task) {
                Ok(subscription) => self.follow(&task, subscription),
                Err(AppError::UnknownTask(_)) => {
                    self.reply(&task, format!("❌ Unknown script: {task}")).await;
                }
                Err(err) => self.reply(&task, format!("❌ {err}")).await,
            },
        }
    }

    /// Abort every forwarder, detaching its subscription.
    pub fn close(self) {
        for (_, handle) in self.forwards {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for SocketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketSession")
            .field("following", &self.forwards.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Handler for `GET /api/socket`.
pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let supervisor = Arc::clone(&state.supervisor);
    ws.on_upgrade(move |socket| serve_socket(socket, supervisor))
}

async fn serve_socket(socket: WebSocket, supervisor: Arc<Supervisor>) {
    let (mut sink, mut frames) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(%err, "cannot encode live channel frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    info!("live channel connected");
    let mut session = SocketSession::new(supervisor, out_tx);

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Message::Text(text)) => session.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(%err, "live channel read failed");
                break;
            }
        }
    }

    session.close();
    writer.abort();
    info!("live channel disconnected");
}
