//! Progress events emitted while a colourisation job runs.
//!
//! Every step of the job pipeline, and every interesting message seen by
//! the ComfyUI event listener, becomes a [`ProgressEvent`] pushed into the
//! job's progress channel. Events serialize flat, as
//! `{"type": "<kind>", ...payload}`, which is exactly the shape relayed to
//! observers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Relay message type sent once when an observer attaches.
pub const MSG_TYPE_STARTED: &str = "started";

/// Relay message type sent when no event arrived within the heartbeat window.
pub const MSG_TYPE_HEARTBEAT: &str = "heartbeat";

/// Final relay message type for a completed job.
pub const MSG_TYPE_DONE: &str = "done";

/// Final relay message type for a failed job.
pub const MSG_TYPE_ERROR: &str = "error";

/// Discriminant of a [`ProgressEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Human-readable pipeline step description.
    Status,
    /// The workflow was accepted by the backend queue.
    Queued,
    /// The backend started executing our prompt.
    ExecutionStart,
    /// The backend moved on to a new graph node.
    NodeExecuting,
    /// Step-level progress inside a long-running node.
    Progress,
    /// The job finished and its artifact is stored.
    Completed,
    /// The job failed.
    Error,
}

impl EventKind {
    /// Wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Status => "status",
            EventKind::Queued => "queued",
            EventKind::ExecutionStart => "execution_start",
            EventKind::NodeExecuting => "node_executing",
            EventKind::Progress => "progress",
            EventKind::Completed => "completed",
            EventKind::Error => "error",
        }
    }

    /// Whether an event of this kind ends the progress stream of a job.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventKind::Completed | EventKind::Error)
    }
}

/// A single progress record: a kind plus a free-form JSON object payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ProgressEvent {
    /// Create an event with an empty payload.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            payload: Map::new(),
        }
    }

    /// Add one payload field.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self::new(EventKind::Status).with_field("message", message.into())
    }

    pub fn queued(prompt_id: &str) -> Self {
        Self::new(EventKind::Queued)
            .with_field("prompt_id", prompt_id)
            .with_field("message", "Workflow queued")
    }

    pub fn execution_start(prompt_id: &str) -> Self {
        Self::new(EventKind::ExecutionStart).with_field("prompt_id", prompt_id)
    }

    pub fn node_executing(prompt_id: &str, node: &str) -> Self {
        Self::new(EventKind::NodeExecuting)
            .with_field("prompt_id", prompt_id)
            .with_field("node", node)
    }

    /// Step progress inside a node. `percent` is pre-computed by the caller.
    pub fn progress(value: i64, max: i64, node: Option<&str>, percent: u8) -> Self {
        Self::new(EventKind::Progress)
            .with_field("value", value)
            .with_field("max", max)
            .with_field("node", node.map(str::to_string))
            .with_field("percent", percent)
    }

    pub fn completed(prompt_id: &str, result_url: &str) -> Self {
        Self::new(EventKind::Completed)
            .with_field("prompt_id", prompt_id)
            .with_field("result_url", result_url)
            .with_field("message", "Workflow completed successfully")
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error).with_field("message", message.into())
    }

    /// Read a string payload field.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Destination for progress events.
///
/// Implemented by the job pipeline's per-job progress channel; the ComfyUI
/// detectors only ever see this trait. Publishing never blocks and never
/// fails: an event nobody is listening for is dropped.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

impl ProgressSink for tokio::sync::mpsc::UnboundedSender<ProgressEvent> {
    fn publish(&self, event: ProgressEvent) {
        let _ = self.send(event);
    }
}
