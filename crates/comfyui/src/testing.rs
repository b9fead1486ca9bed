//! In-memory doubles for the ComfyUI seams, used by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::api::{ComfyUIApiError, ComfyUIBackend, HistoryEntry};
use crate::client::{ComfyUIClientError, EventConnector, MessageStream};

pub const PROMPT: &str = "prompt-1";
pub const OUTPUT_NODE: &str = "1239";

/// What one connect call yields.
pub enum Script {
    /// The connect call fails.
    Fail,
    /// The connection delivers these frames, then drops.
    Messages(Vec<String>),
    /// The connection delivers these frames, then stays silent forever.
    MessagesThenHang(Vec<String>),
}

/// Connector replaying one [`Script`] per connect call. Once the scripts
/// run out every connect fails.
pub struct ScriptedConnector {
    scripts: Mutex<VecDeque<Script>>,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventConnector for ScriptedConnector {
    async fn connect(&self, _client_id: &str) -> Result<MessageStream, ComfyUIClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            None | Some(Script::Fail) => {
                Err(ComfyUIClientError::Connection("scripted failure".into()))
            }
            Some(Script::Messages(frames)) => {
                Ok(futures::stream::iter(frames.into_iter().map(Ok)).boxed())
            }
            Some(Script::MessagesThenHang(frames)) => Ok(futures::stream::iter(
                frames.into_iter().map(Ok),
            )
            .chain(futures::stream::pending())
            .boxed()),
        }
    }
}

/// The queue broadcast ComfyUI sends first on every new connection.
pub fn status() -> String {
    json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 0}}}}).to_string()
}

pub fn executing(node: Option<&str>) -> String {
    json!({"type": "executing", "data": {"node": node, "prompt_id": PROMPT}}).to_string()
}

pub fn execution_start() -> String {
    json!({"type": "execution_start", "data": {"prompt_id": PROMPT}}).to_string()
}

pub fn progress(value: i64, max: i64) -> String {
    json!({
        "type": "progress",
        "data": {"value": value, "max": max, "node": "17", "prompt_id": PROMPT}
    })
    .to_string()
}

/// What one `fetch_history` call returns.
#[derive(Clone, Copy)]
pub enum HistoryScript {
    Pending,
    Done,
    Failed(&'static str),
    TransportError,
}

/// Backend whose history answers follow a script. The last entry repeats
/// once the script is exhausted.
pub struct FakeBackend {
    history: Mutex<VecDeque<HistoryScript>>,
    history_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(history: Vec<HistoryScript>) -> Self {
        Self {
            history: Mutex::new(history.into()),
            history_calls: AtomicUsize::new(0),
        }
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }
}

pub fn entry(json: Value) -> HistoryEntry {
    serde_json::from_value(json).unwrap()
}

#[async_trait]
impl ComfyUIBackend for FakeBackend {
    async fn upload_asset(
        &self,
        _bytes: Vec<u8>,
        filename: &str,
    ) -> Result<String, ComfyUIApiError> {
        Ok(filename.to_string())
    }

    async fn enqueue(
        &self,
        _workflow: &Value,
        _client_id: &str,
    ) -> Result<String, ComfyUIApiError> {
        Ok(PROMPT.to_string())
    }

    async fn fetch_history(
        &self,
        _prompt_id: &str,
    ) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.history.lock().unwrap();
        let step = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().copied()
        };
        match step.unwrap_or(HistoryScript::Pending) {
            HistoryScript::Pending => Ok(None),
            HistoryScript::Done => Ok(Some(entry(json!({
                "outputs": {OUTPUT_NODE: {"images": [{"filename": "out.png"}]}},
                "status": {"status_str": "success", "completed": true, "messages": []}
            })))),
            HistoryScript::Failed(message) => Ok(Some(entry(json!({
                "outputs": {},
                "status": {"status_str": "error", "completed": false, "messages": [message]}
            })))),
            HistoryScript::TransportError => {
                Err(ComfyUIApiError::Protocol("scripted transport error".into()))
            }
        }
    }

    async fn fetch_artifact(&self, _filename: &str) -> Result<Vec<u8>, ComfyUIApiError> {
        Ok(b"png".to_vec())
    }
}
