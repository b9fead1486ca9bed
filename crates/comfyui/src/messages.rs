//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them
//! into a strongly-typed [`ComfyUIMessage`] enum. Message kinds the
//! listener has no use for are kept as [`ComfyUIMessage::Other`] rather
//! than rejected, since ComfyUI and its custom nodes add new kinds freely.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// ComfyUI WebSocket messages the listener understands.
#[derive(Debug, Clone)]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth, etc.).
    Status(StatusData),

    /// A prompt has started executing.
    ExecutionStart(ExecutionStartData),

    /// A specific node is currently executing, or the prompt went idle
    /// when `node` is `None`.
    Executing(ExecutingData),

    /// Progress update from a long-running node (e.g. KSampler).
    Progress(ProgressData),

    /// Execution failed with an error.
    ExecutionError(ErrorData),

    /// Any other message kind, by its `type` tag.
    Other(String),
}

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

/// Current queue state.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload for `execution_start` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

/// Payload for `executing` messages.
///
/// `node` is `None` whenever the server goes idle, both at the very
/// start of a run and after the last node finished.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `progress` messages (step-level progress within a node).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: i64,
    /// Total number of steps.
    pub max: i64,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    pub node_id: String,
    pub exception_message: String,
    pub exception_type: String,
}

/// `{"type": ..., "data": ...}` envelope shared by every message.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON or a known `type` whose payload does
/// not match. Unknown types parse to [`ComfyUIMessage::Other`].
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let Envelope { kind, data } = serde_json::from_str(text)?;

    let msg = match kind.as_str() {
        "status" => ComfyUIMessage::Status(payload(data)?),
        "execution_start" => ComfyUIMessage::ExecutionStart(payload(data)?),
        "executing" => ComfyUIMessage::Executing(payload(data)?),
        "progress" => ComfyUIMessage::Progress(payload(data)?),
        "execution_error" => ComfyUIMessage::ExecutionError(payload(data)?),
        _ => ComfyUIMessage::Other(kind),
    };
    Ok(msg)
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(data)
}
