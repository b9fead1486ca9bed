//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (image upload, workflow submission,
//! history retrieval, output download) using [`reqwest`]. The
//! [`ComfyUIBackend`] trait is the seam the detectors and the job
//! pipeline depend on; [`ComfyUIApi`] is the production implementation.
//!
//! Every request is bounded by the timeout given to [`ComfyUIApi::new`], so
//! a backend that accepts the connection and then stalls surfaces as
//! [`ComfyUIApiError::Unreachable`] instead of hanging its caller.
//!
//! No call is retried here. Callers own their retry shape: the poller
//! swallows transient failures, the artifact download retries on a short
//! fixed spacing, and job submission does not retry at all.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Operations the pipeline needs from a ComfyUI server.
#[async_trait]
pub trait ComfyUIBackend: Send + Sync {
    /// Upload an input image and return the name ComfyUI stored it under.
    async fn upload_asset(&self, bytes: Vec<u8>, filename: &str)
        -> Result<String, ComfyUIApiError>;

    /// Queue a workflow graph and return the server-assigned `prompt_id`.
    ///
    /// `client_id` routes the prompt's WebSocket events to the listener
    /// connected with the same id.
    async fn enqueue(&self, workflow: &Value, client_id: &str) -> Result<String, ComfyUIApiError>;

    /// Fetch the history record of a prompt, `None` while ComfyUI has not
    /// indexed it yet.
    async fn fetch_history(&self, prompt_id: &str)
        -> Result<Option<HistoryEntry>, ComfyUIApiError>;

    /// Download an output file produced by a finished prompt.
    async fn fetch_artifact(&self, filename: &str) -> Result<Vec<u8>, ComfyUIApiError>;
}

/// Ceiling on establishing a TCP connection, below the request timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for a single ComfyUI instance.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// One prompt's entry in the `/history/{prompt_id}` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    /// Execution status block; absent while the prompt is still running.
    #[serde(default)]
    pub status: Option<HistoryStatus>,
    /// Node outputs keyed by node id.
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

/// Status block of a history entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    /// `"success"` or `"error"`.
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
    /// Raw execution messages, e.g. `["execution_error", {...}]`.
    #[serde(default)]
    pub messages: Vec<Value>,
}

impl HistoryEntry {
    /// Whether `node` has produced output for this prompt.
    pub fn has_output(&self, node: &str) -> bool {
        self.outputs.contains_key(node)
    }

    /// Whether ComfyUI reports the prompt as failed.
    pub fn is_error(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.status_str.as_deref())
            .is_some_and(|s| s == "error")
    }

    /// The backend's message list, one string per message.
    pub fn error_messages(&self) -> Vec<String> {
        self.status
            .as_ref()
            .map(|s| s.messages.iter().map(Value::to_string).collect())
            .unwrap_or_default()
    }

    /// File name of the first image written by `node`.
    pub fn output_filename(&self, node: &str) -> Option<&str> {
        self.outputs
            .get(node)?
            .get("images")?
            .get(0)?
            .get("filename")?
            .as_str()
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("ComfyUI unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),

    /// The response was missing an expected field or was not valid JSON.
    #[error("ComfyUI protocol error: {0}")]
    Protocol(String),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    /// * `timeout` - Upper bound on each whole request, body included.
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, ComfyUIApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout.min(CONNECT_TIMEOUT))
            .timeout(timeout)
            .build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    /// HTTP API base URL.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Read a successful response body as a JSON value.
    async fn parse_json(response: reqwest::Response) -> Result<Value, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ComfyUIApiError::Protocol(format!("invalid JSON body: {e}")))
    }
}

#[async_trait]
impl ComfyUIBackend for ComfyUIApi {
    /// Sends a multipart `POST /upload/image` with the bytes in the
    /// `image` field.
    async fn upload_asset(
        &self,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<String, ComfyUIApiError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("image", part);

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .send()
            .await?;

        let body = Self::parse_json(response).await?;
        tracing::debug!(filename, response = %body, "Uploaded image to ComfyUI");

        string_field(&body, "name")
    }

    /// Sends `POST /prompt` with `{"prompt": workflow, "client_id": id}`.
    async fn enqueue(&self, workflow: &Value, client_id: &str) -> Result<String, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        let body = Self::parse_json(response).await?;
        string_field(&body, "prompt_id")
    }

    /// Sends `GET /history/{prompt_id}`. ComfyUI answers `{}` until the
    /// prompt is indexed.
    async fn fetch_history(
        &self,
        prompt_id: &str,
    ) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        let body = Self::parse_json(response).await?;
        let Value::Object(mut entries) = body else {
            return Err(ComfyUIApiError::Protocol(
                "history response is not a JSON object".into(),
            ));
        };

        match entries.remove(prompt_id) {
            None => Ok(None),
            Some(entry) => serde_json::from_value(entry).map(Some).map_err(|e| {
                ComfyUIApiError::Protocol(format!("malformed history for {prompt_id}: {e}"))
            }),
        }
    }

    /// Sends `GET /view?filename=...&type=output`.
    async fn fetch_artifact(&self, filename: &str) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[("filename", filename), ("type", "output")])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Extract a required string field from a JSON response body.
fn string_field(body: &Value, field: &str) -> Result<String, ComfyUIApiError> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ComfyUIApiError::Protocol(format!("No {field} in response: {body}")))
}
