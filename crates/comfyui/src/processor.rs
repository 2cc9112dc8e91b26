//! WebSocket message processing loop.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them into
//! [`ComfyUIMessage`] values, feeds them to the [`ExecutionTracker`], and
//! broadcasts the resulting [`ComfyUIEvent`]s.

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::WsStream;
use crate::events::ComfyUIEvent;
use crate::messages::{parse_message, ComfyUIMessage};
use crate::tracker::ExecutionTracker;

/// Why [`process_messages`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The cancellation token fired.
    Cancelled,
    /// The server closed the socket, the stream ended, or a receive error
    /// occurred.
    Disconnected,
}

/// Process WebSocket messages until the connection drops or `cancel` fires.
///
/// Binary frames (preview images) are ignored.
pub async fn process_messages(
    ws_stream: &mut WsStream,
    tracker: &ExecutionTracker,
    event_tx: &broadcast::Sender<ComfyUIEvent>,
    cancel: &CancellationToken,
) -> StreamEnd {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            frame = ws_stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => handle_text_message(&text, tracker, event_tx),
            Some(Ok(Message::Binary(_))) => {
                tracing::trace!("Ignoring binary message (preview image)");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                return StreamEnd::Disconnected;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "WebSocket receive error");
                return StreamEnd::Disconnected;
            }
            None => return StreamEnd::Disconnected,
        }
    }
}

/// Parse one text frame, log it, and route it through the tracker.
fn handle_text_message(
    text: &str,
    tracker: &ExecutionTracker,
    event_tx: &broadcast::Sender<ComfyUIEvent>,
) {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(
                error = %e,
                raw_message = %text,
                "Failed to parse ComfyUI message",
            );
            return;
        }
    };

    log_message(&msg);

    if let Some(event) = tracker.handle(&msg) {
        // No subscribers is fine.
        let _ = event_tx.send(event);
    }
}

fn log_message(msg: &ComfyUIMessage) {
    match msg {
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
        }
        ComfyUIMessage::ExecutionStart(data) => {
            tracing::info!(prompt_id = %data.prompt_id, "Execution started");
        }
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::debug!(
                prompt_id = %data.prompt_id,
                cached_nodes = data.nodes.len(),
                "Execution used cache",
            );
        }
        ComfyUIMessage::Executing(data) => match &data.node {
            Some(node) => tracing::debug!(prompt_id = ?data.prompt_id, node = %node, "Executing node"),
            None => tracing::info!(prompt_id = ?data.prompt_id, "Execution completed (all nodes done)"),
        },
        ComfyUIMessage::Progress(data) => {
            tracing::debug!(
                prompt_id = ?data.prompt_id,
                value = data.value,
                max = data.max,
                percent = data.percent(),
                "Generation progress",
            );
        }
        ComfyUIMessage::Executed(data) => {
            tracing::debug!(
                prompt_id = %data.prompt_id,
                node = %data.node,
                "Node executed with output",
            );
        }
        ComfyUIMessage::ExecutionSuccess(data) => {
            tracing::debug!(prompt_id = %data.prompt_id, "Execution success reported");
        }
        ComfyUIMessage::ExecutionError(data) => {
            tracing::error!(
                prompt_id = %data.prompt_id,
                node_id = ?data.node_id,
                error_type = %data.exception_type,
                error_message = %data.exception_message,
                "Execution error",
            );
        }
        ComfyUIMessage::ExecutionInterrupted(data) => {
            tracing::warn!(prompt_id = %data.prompt_id, node_id = ?data.node_id, "Execution interrupted");
        }
        ComfyUIMessage::ServerError { message } => {
            tracing::error!(error_message = %message, "ComfyUI reported an error");
        }
        ComfyUIMessage::Other { kind } => {
            tracing::trace!(kind = %kind, "Ignoring unhandled ComfyUI message");
        }
    }
}
