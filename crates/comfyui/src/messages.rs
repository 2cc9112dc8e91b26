//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON frames shaped `{"type": "<kind>", "data": {...}}`.
//! Parsing is two-stage: the envelope first, then the payload for the
//! kinds we act on. Kinds we do not know (custom-node monitors and the
//! like) come back as [`ComfyUIMessage::Other`] instead of an error, so one
//! unexpected frame never tears down the listener.

use serde::Deserialize;
use serde_json::Value;

/// Every ComfyUI WebSocket message the listener distinguishes.
#[derive(Debug, Clone)]
pub enum ComfyUIMessage {
    /// Queue depth broadcast.
    Status(StatusData),
    /// A prompt has started executing.
    ExecutionStart(PromptRef),
    /// Nodes skipped because their outputs were cached.
    ExecutionCached(ExecutionCachedData),
    /// A node is executing; `node == None` means the prompt finished.
    Executing(ExecutingData),
    /// Step-level progress inside a node (e.g. sampler steps).
    Progress(ProgressData),
    /// A node finished and produced output.
    Executed(ExecutedData),
    /// The prompt finished successfully (newer servers send this after the
    /// final `executing`).
    ExecutionSuccess(PromptRef),
    /// Execution failed.
    ExecutionError(ErrorData),
    /// Execution was interrupted via `POST /interrupt`.
    ExecutionInterrupted(InterruptedData),
    /// Untyped `{"type": "error"}` frame not tied to a prompt ID.
    ServerError { message: String },
    /// Any kind not listed above.
    Other { kind: String },
}

impl ComfyUIMessage {
    /// Prompt ID carried by the message, when it has one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            ComfyUIMessage::ExecutionStart(d) | ComfyUIMessage::ExecutionSuccess(d) => {
                Some(&d.prompt_id)
            }
            ComfyUIMessage::ExecutionCached(d) => Some(&d.prompt_id),
            ComfyUIMessage::Executing(d) => d.prompt_id.as_deref(),
            ComfyUIMessage::Progress(d) => d.prompt_id.as_deref(),
            ComfyUIMessage::Executed(d) => Some(&d.prompt_id),
            ComfyUIMessage::ExecutionError(d) => Some(&d.prompt_id),
            ComfyUIMessage::ExecutionInterrupted(d) => Some(&d.prompt_id),
            ComfyUIMessage::Status(_)
            | ComfyUIMessage::ServerError { .. }
            | ComfyUIMessage::Other { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload that only names a prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Older servers omit `prompt_id` here; the tracker then falls back to the
/// prompt it last saw start.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: i64,
    pub max: i64,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

impl ProgressData {
    /// Completion percentage, clamped to 0-100. Zero when `max` is not
    /// positive.
    pub fn percent(&self) -> u8 {
        if self.max <= 0 {
            return 0;
        }
        ((self.value.max(0) as f64 / self.max as f64) * 100.0).min(100.0) as u8
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    /// Raw node output (`images`, `gifs`, text, ...).
    pub output: Value,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    message: Option<String>,
}

/// Parse a ComfyUI WebSocket text frame.
///
/// Fails on malformed JSON, a missing `type`, or a known kind whose payload
/// does not match. Unknown kinds parse as [`ComfyUIMessage::Other`].
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let Envelope {
        kind,
        data,
        message,
    } = serde_json::from_str(text)?;

    let msg = match kind.as_str() {
        "status" => ComfyUIMessage::Status(serde_json::from_value(data)?),
        "execution_start" => ComfyUIMessage::ExecutionStart(serde_json::from_value(data)?),
        "execution_cached" => ComfyUIMessage::ExecutionCached(serde_json::from_value(data)?),
        "executing" => ComfyUIMessage::Executing(serde_json::from_value(data)?),
        "progress" => ComfyUIMessage::Progress(serde_json::from_value(data)?),
        "executed" => ComfyUIMessage::Executed(serde_json::from_value(data)?),
        "execution_success" => ComfyUIMessage::ExecutionSuccess(serde_json::from_value(data)?),
        "execution_error" => ComfyUIMessage::ExecutionError(serde_json::from_value(data)?),
        "execution_interrupted" => {
            ComfyUIMessage::ExecutionInterrupted(serde_json::from_value(data)?)
        }
        "error" => ComfyUIMessage::ServerError {
            message: message
                .or_else(|| {
                    data.get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "unknown server error".to_string()),
        },
        _ => ComfyUIMessage::Other { kind: kind.clone() },
    };
    Ok(msg)
}
