//! Output reader task.
//!
//! Reads one worker stream through [`FramedRead`] backed by
//! [`OutputCodec`] and publishes every chunk to the [`OutputBroker`] in the
//! order it was produced. One reader runs per captured stream, so stdout
//! and stderr are each individually ordered; no order is imposed between
//! them.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::broker::OutputBroker;
use super::codec::OutputCodec;
use crate::models::output::{OutputEvent, StreamKind};
use crate::models::task::TaskType;

/// Publish `stream` until EOF, an I/O error, or cancellation.
///
/// Returns the number of bytes published.
pub async fn run_reader<R>(
    task_type: TaskType,
    kind: StreamKind,
    stream: R,
    broker: Arc<OutputBroker>,
    cancel: CancellationToken,
) -> u64
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stream, OutputCodec::new());
    let mut published: u64 = 0;

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(task = %task_type, stream = ?kind, "reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(task = %task_type, stream = ?kind, published, "reader: EOF");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(task = %task_type, stream = ?kind, %err, "reader: I/O error, stopping");
                        break;
                    }
                    Some(Ok(chunk)) => {
                        published += chunk.len() as u64;
                        broker.publish(OutputEvent::new(task_type.clone(), kind, chunk));
                    }
                }
            }
        }
    }

    published
}
