use std::path::Path;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::Multipart;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use axum::routing::{self, post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use tinter_api::config::ServerConfig;
use tinter_api::router::build_app_router;
use tinter_api::state::AppState;

pub const PROMPT_ID: &str = "prompt-1";
pub const BOUNDARY: &str = "tinter-test-boundary";

/// Build a test `ServerConfig` with safe defaults.
///
/// Results are stored under `dir`, the workflow template is written there,
/// and ComfyUI is expected at `comfyui_addr`. Detector timings are short.
pub fn test_config(dir: &Path, comfyui_addr: &str) -> ServerConfig {
    let workflow_path = dir.join("workflow.json");
    let graph = json!({
        "1222": {"class_type": "LoadImage", "inputs": {"image": "gray.png"}},
        "1231": {"class_type": "LoadImage", "inputs": {"image": "reference.png"}},
        "1239": {"class_type": "SaveImage", "inputs": {"filename_prefix": "colorized"}}
    });
    std::fs::write(&workflow_path, graph.to_string()).unwrap();

    let vars = [
        ("HOST", "127.0.0.1".to_string()),
        ("PORT", "0".to_string()),
        ("CORS_ORIGINS", "http://localhost:5173".to_string()),
        ("COMFYUI_URL", format!("http://{comfyui_addr}")),
        ("WORKFLOW_PATH", workflow_path.display().to_string()),
        ("STORAGE_PATH", dir.join("storage").display().to_string()),
        ("COMFYUI_REQUEST_TIMEOUT_SECS", "5".to_string()),
        ("WS_MESSAGE_TIMEOUT_SECS", "5".to_string()),
        ("WS_RECONNECT_ATTEMPTS", "2".to_string()),
        ("WS_RECONNECT_DELAY_SECS", "0".to_string()),
        ("POLL_INTERVAL_MS", "50".to_string()),
        ("POLL_MAX_ATTEMPTS", "40".to_string()),
        ("ARTIFACT_FETCH_DELAY_MS", "20".to_string()),
        ("PROGRESS_HEARTBEAT_MS", "100".to_string()),
    ];
    ServerConfig::from_lookup(|key| {
        vars.iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.clone())
    })
    .unwrap()
}

/// Build the full application router with all middleware layers.
///
/// Uses the same builder as `main.rs` so integration tests exercise the
/// production middleware stack.
pub fn build_test_app(config: ServerConfig) -> Router {
    let state = AppState::from_config(config.clone()).unwrap();
    build_app_router(state, &config)
}

/// Send a GET request through the router.
pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    app.oneshot(request).await.unwrap()
}

/// Collect a response body as bytes.
pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

/// Collect a response body and parse it as JSON.
pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// A multipart part: `(field, Some(filename), bytes)` for files,
/// `(field, None, bytes)` for text.
pub type Part<'a> = (&'a str, Option<&'a str>, &'a [u8]);

/// Encode `parts` as a `multipart/form-data` body using [`BOUNDARY`].
pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, bytes) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match filename {
            Some(filename) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; \
                         filename=\"{filename}\"\r\n\
                         Content-Type: image/png\r\n\r\n"
                    )
                    .as_bytes(),
                );
            }
            None => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
            }
        }
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

/// POST a multipart form to `/submit`.
pub async fn submit(app: Router, parts: &[Part<'_>]) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri("/submit")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

/// Read an SSE response to its end and return the JSON of every `data:` line.
pub async fn sse_messages(response: Response<Body>) -> Vec<Value> {
    let bytes = tokio::time::timeout(Duration::from_secs(20), body_bytes(response))
        .await
        .expect("progress stream did not end");
    String::from_utf8(bytes)
        .unwrap()
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

// ---------------------------------------------------------------------------
// Fake ComfyUI
// ---------------------------------------------------------------------------

async fn upload(mut multipart: Multipart) -> Json<Value> {
    let mut name = String::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        if field.name() == Some("image") {
            name = field.file_name().unwrap_or_default().to_string();
            let _ = field.bytes().await.unwrap();
        }
    }
    Json(json!({"name": name, "subfolder": "", "type": "input"}))
}

async fn history() -> Json<Value> {
    Json(json!({
        PROMPT_ID: {
            "outputs": {
                "1239": {"images": [{"filename": "colorized_00001_.png", "type": "output"}]}
            },
            "status": {"status_str": "success", "completed": true, "messages": []}
        }
    }))
}

async fn ws(upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(|mut socket| async move {
        while let Some(Ok(_)) = socket.recv().await {}
    })
}

/// Start a ComfyUI stand-in whose prompts always succeed. Returns its
/// `host:port`.
pub async fn spawn_comfyui() -> String {
    let app = Router::new()
        .route("/upload/image", post(upload))
        .route(
            "/prompt",
            post(|| async { Json(json!({"prompt_id": PROMPT_ID, "number": 0})) }),
        )
        .route("/history/{prompt_id}", routing::get(history))
        .route("/view", routing::get(|| async { b"\x89PNG fake result".to_vec() }))
        .route("/ws", routing::get(ws));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}

/// An address nothing listens on, for tests that never reach ComfyUI.
pub const NO_COMFYUI: &str = "127.0.0.1:9";
