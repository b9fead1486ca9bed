//! In-process fake ComfyUI server and pipeline wiring for the job tests.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Multipart, Path as UrlPath, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tinter_comfyui::{
    ComfyUIApi, ComfyUIClient, CompletionRace, ListenerConfig, PollerConfig, ReconnectConfig,
};
use tinter_pipeline::{Pipeline, PipelineConfig};

pub const PROMPT_ID: &str = "prompt-1";

/// How the fake backend resolves the queued prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// History shows the output node; the event stream runs to idle.
    Success,
    /// History reports an execution error; the event stream stays silent.
    RemoteError,
    /// The event stream completes but history holds no output image.
    NoOutput,
    /// The event stream completes but history never lists the prompt.
    Unindexed,
}

struct MockState {
    outcome: Outcome,
    uploads: Mutex<Vec<String>>,
    prompts: Mutex<Vec<Value>>,
}

/// Handle on a running fake server.
pub struct MockComfyUI {
    pub addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockComfyUI {
    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn uploads(&self) -> Vec<String> {
        self.state.uploads.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<Value> {
        self.state.prompts.lock().unwrap().clone()
    }
}

async fn upload(State(state): State<Arc<MockState>>, mut multipart: Multipart) -> Json<Value> {
    let mut name = String::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        if field.name() == Some("image") {
            name = field.file_name().unwrap_or_default().to_string();
            let _ = field.bytes().await.unwrap();
        }
    }
    state.uploads.lock().unwrap().push(name.clone());
    Json(json!({"name": name, "subfolder": "", "type": "input"}))
}

async fn prompt(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Json<Value> {
    state.prompts.lock().unwrap().push(body);
    Json(json!({"prompt_id": PROMPT_ID, "number": 0, "node_errors": {}}))
}

async fn history(
    State(state): State<Arc<MockState>>,
    UrlPath(prompt_id): UrlPath<String>,
) -> Json<Value> {
    if prompt_id != PROMPT_ID || state.outcome == Outcome::Unindexed {
        return Json(json!({}));
    }
    let entry = match state.outcome {
        Outcome::Success => json!({
            "outputs": {
                "1239": {"images": [{"filename": "colorized_00001_.png", "type": "output"}]}
            },
            "status": {"status_str": "success", "completed": true, "messages": []}
        }),
        Outcome::RemoteError => json!({
            "outputs": {},
            "status": {
                "status_str": "error",
                "completed": false,
                "messages": [["execution_error", {"exception_message": "CUDA out of memory"}]]
            }
        }),
        Outcome::NoOutput | Outcome::Unindexed => json!({
            "outputs": {"7": {"images": []}},
            "status": {"status_str": "success", "completed": true, "messages": []}
        }),
    };
    Json(json!({ PROMPT_ID: entry }))
}

async fn view() -> impl IntoResponse {
    b"\x89PNG fake result".to_vec()
}

async fn ws(State(state): State<Arc<MockState>>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(move |mut socket| async move {
        let frames = match state.outcome {
            Outcome::RemoteError => vec![],
            Outcome::Success | Outcome::NoOutput | Outcome::Unindexed => vec![
                json!({"type": "execution_start", "data": {"prompt_id": PROMPT_ID}}),
                json!({
                    "type": "progress",
                    "data": {"value": 5, "max": 10, "node": "17", "prompt_id": PROMPT_ID}
                }),
                json!({"type": "executing", "data": {"node": "1239", "prompt_id": PROMPT_ID}}),
                json!({"type": "executing", "data": {"node": null, "prompt_id": PROMPT_ID}}),
            ],
        };
        for frame in frames {
            if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
                return;
            }
        }
        // Stay connected until the client goes away.
        while let Some(Ok(_)) = socket.recv().await {}
    })
}

pub async fn spawn_mock(outcome: Outcome) -> MockComfyUI {
    let state = Arc::new(MockState {
        outcome,
        uploads: Mutex::new(Vec::new()),
        prompts: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/upload/image", post(upload))
        .route("/prompt", post(prompt))
        .route("/history/{prompt_id}", get(history))
        .route("/view", get(view))
        .route("/ws", get(ws))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockComfyUI { addr, state }
}

/// Minimal colourisation template with the three designated nodes.
pub fn write_workflow(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("workflow.json");
    let graph = json!({
        "1222": {"class_type": "LoadImage", "inputs": {"image": "gray.png"}},
        "1231": {"class_type": "LoadImage", "inputs": {"image": "reference.png"}},
        "1239": {"class_type": "SaveImage", "inputs": {"filename_prefix": "colorized"}}
    });
    std::fs::write(&path, graph.to_string()).unwrap();
    path
}

/// A pipeline pointed at `mock`, storing results under `dir`, with short
/// timings.
pub fn pipeline(mock: &MockComfyUI, dir: &Path) -> Pipeline {
    let backend = Arc::new(ComfyUIApi::new(mock.http_url(), Duration::from_secs(5)).unwrap());
    let connector = Arc::new(ComfyUIClient::new(mock.ws_url()));
    let race = CompletionRace::new(
        connector,
        backend,
        ListenerConfig {
            message_timeout: Duration::from_secs(5),
            reconnect: ReconnectConfig {
                max_attempts: 2,
                delay: Duration::from_millis(50),
            },
            ..ListenerConfig::default()
        },
        PollerConfig {
            interval: Duration::from_millis(50),
            max_attempts: 40,
            ..PollerConfig::default()
        },
    );
    let config = PipelineConfig {
        workflow_path: write_workflow(dir),
        storage_root: dir.join("storage"),
        artifact_attempts: 3,
        artifact_delay: Duration::from_millis(20),
        heartbeat: Duration::from_millis(100),
        ..PipelineConfig::default()
    };
    Pipeline::new(race, config)
}
