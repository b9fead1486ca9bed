//! Integration tests for the REST and WebSocket clients against an
//! in-process stand-in for a ComfyUI server.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tinter_comfyui::completion::CompletionSignal;
use tinter_comfyui::poller::poll_history;
use tinter_comfyui::{
    ComfyUIApi, ComfyUIApiError, ComfyUIBackend, ComfyUIClient, DetectionError, PollerConfig,
};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Fake ComfyUI server
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

async fn prompt(Json(body): Json<Value>) -> Json<Value> {
    assert!(body["prompt"].is_object());
    assert!(body["client_id"].is_string());
    Json(json!({"prompt_id": "p-1", "number": 0, "node_errors": {}}))
}

async fn history(Path(prompt_id): Path<String>) -> Json<Value> {
    if prompt_id == "p-1" {
        Json(json!({
            "p-1": {
                "outputs": {
                    "1239": {"images": [{"filename": "result_0001.png", "type": "output"}]}
                },
                "status": {"status_str": "success", "completed": true, "messages": []}
            }
        }))
    } else {
        Json(json!({}))
    }
}

#[derive(Deserialize)]
struct ViewQuery {
    filename: String,
    #[serde(rename = "type")]
    kind: String,
}

async fn view(Query(q): Query<ViewQuery>) -> impl IntoResponse {
    assert_eq!(q.kind, "output");
    format!("bytes-of-{}", q.filename)
}

async fn ws(upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(|mut socket| async move {
        let status = json!({
            "type": "status",
            "data": {"status": {"exec_info": {"queue_remaining": 0}}}
        });
        let executing = json!({"type": "executing", "data": {"node": "1239", "prompt_id": "p-1"}});
        let frames = [
            Message::Text(status.to_string().into()),
            Message::Binary(vec![1u8, 2, 3].into()),
            Message::Text(executing.to_string().into()),
            Message::Close(None),
        ];
        for frame in frames {
            if socket.send(frame).await.is_err() {
                return;
            }
        }
    })
}

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}

async fn fake_comfyui() -> String {
    spawn(
        Router::new()
            .route("/upload/image", post(upload))
            .route("/prompt", post(prompt))
            .route("/history/{prompt_id}", get(history))
            .route("/view", get(view))
            .route("/ws", get(ws)),
    )
    .await
}

fn api(addr: &str) -> ComfyUIApi {
    ComfyUIApi::new(format!("http://{addr}"), Duration::from_secs(5)).unwrap()
}

/// A server whose history endpoint accepts the request and never answers.
async fn stalled_history() -> String {
    spawn(Router::new().route(
        "/history/{prompt_id}",
        get(|| std::future::pending::<Json<Value>>()),
    ))
    .await
}

// ---------------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_returns_stored_name() {
    let addr = fake_comfyui().await;
    let api = api(&addr);

    let name = api.upload_asset(b"img".to_vec(), "ab12_gray.png").await.unwrap();
    assert_eq!(name, "ab12_gray.png");
}

#[tokio::test]
async fn enqueue_returns_prompt_id() {
    let addr = fake_comfyui().await;
    let api = api(&addr);

    let prompt_id = api.enqueue(&json!({"1": {}}), "client-1").await.unwrap();
    assert_eq!(prompt_id, "p-1");
}

#[tokio::test]
async fn history_is_absent_until_indexed() {
    let addr = fake_comfyui().await;
    let api = api(&addr);

    assert!(api.fetch_history("unknown").await.unwrap().is_none());

    let entry = api.fetch_history("p-1").await.unwrap().unwrap();
    assert!(entry.has_output("1239"));
    assert_eq!(entry.output_filename("1239"), Some("result_0001.png"));
}

#[tokio::test]
async fn artifact_download_returns_bytes() {
    let addr = fake_comfyui().await;
    let api = api(&addr);

    let bytes = api.fetch_artifact("result_0001.png").await.unwrap();
    assert_eq!(bytes, b"bytes-of-result_0001.png");
}

#[tokio::test]
async fn missing_prompt_id_is_protocol_error() {
    let addr = spawn(Router::new().route(
        "/prompt",
        post(|| async { Json(json!({"error": "no outputs", "node_errors": {}})) }),
    ))
    .await;
    let api = api(&addr);

    let err = api.enqueue(&json!({}), "c").await.unwrap_err();
    assert_matches!(err, ComfyUIApiError::Protocol(msg) if msg.contains("prompt_id"));
}

#[tokio::test]
async fn non_success_status_is_api_error() {
    let addr = spawn(Router::new().route(
        "/prompt",
        post(|| async { (StatusCode::BAD_REQUEST, "invalid prompt") }),
    ))
    .await;
    let api = api(&addr);

    let err = api.enqueue(&json!({}), "c").await.unwrap_err();
    assert_matches!(
        err,
        ComfyUIApiError::ApiError { status: 400, body } if body == "invalid prompt"
    );
}

#[tokio::test]
async fn unreachable_backend_is_transport_error() {
    let api = api("127.0.0.1:9");

    let err = api.fetch_history("p-1").await.unwrap_err();
    assert_matches!(err, ComfyUIApiError::Unreachable(_));
}

// ---------------------------------------------------------------------------
// Request timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stalled_request_fails_after_timeout() {
    let addr = stalled_history().await;
    let api = ComfyUIApi::new(format!("http://{addr}"), Duration::from_millis(200)).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), api.fetch_history("p-1"))
        .await
        .expect("request outlived its timeout");

    assert_matches!(result, Err(ComfyUIApiError::Unreachable(e)) if e.is_timeout());
}

#[tokio::test]
async fn poller_exhausts_attempts_against_stalled_backend() {
    let addr = stalled_history().await;
    let backend = Arc::new(
        ComfyUIApi::new(format!("http://{addr}"), Duration::from_millis(100)).unwrap(),
    );
    let config = PollerConfig {
        output_node: "1239".to_string(),
        interval: Duration::from_millis(10),
        max_attempts: 3,
    };
    let signal = Arc::new(CompletionSignal::new());

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        poll_history(
            backend,
            config,
            "p-1".to_string(),
            Arc::clone(&signal),
            CancellationToken::new(),
        ),
    )
    .await
    .expect("poller hung on a stalled request");

    assert_matches!(result, Err(DetectionError::PollTimeout { attempts: 3 }));
    assert!(!signal.is_fired());
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[tokio::test]
async fn websocket_stream_yields_text_frames_until_close() {
    let addr = fake_comfyui().await;
    let client = ComfyUIClient::new(format!("ws://{addr}"));

    let conn = client.connect("client-1").await.unwrap();
    assert_eq!(conn.client_id, "client-1");

    let frames: Vec<String> = conn
        .into_text_stream()
        .map(|frame| frame.unwrap())
        .collect()
        .await;

    assert_eq!(frames.len(), 2);
    assert!(frames[0].contains("\"status\""));
    assert!(frames[1].contains("1239"));
}
