use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tinter_comfyui::{ListenerConfig, PollerConfig, ReconnectConfig};
use tinter_pipeline::PipelineConfig;

/// Server configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8003`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`). Progress streams
    /// are not cut off by it once their headers are sent.
    pub request_timeout_secs: u64,
    /// Grace period for running jobs on shutdown, in seconds (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// Largest accepted request body (default: 50 MiB).
    pub max_upload_bytes: usize,
    /// ComfyUI HTTP base URL.
    pub comfyui_url: String,
    /// ComfyUI WebSocket base URL.
    pub comfyui_ws_url: String,
    /// Ceiling on each ComfyUI REST call (default: 60 s).
    pub comfyui_request_timeout: Duration,
    pub pipeline: PipelineConfig,
    pub listener: ListenerConfig,
    pub poller: PollerConfig,
}

/// A configuration variable that is set but unparseable.
#[derive(Debug, thiserror::Error)]
#[error("{key} must be a valid {expected}, got {value:?}")]
pub struct ConfigError {
    pub key: &'static str,
    pub expected: &'static str,
    pub value: String,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default                      |
    /// |----------------------------|------------------------------|
    /// | `HOST`                     | `0.0.0.0`                    |
    /// | `PORT`                     | `8003`                       |
    /// | `CORS_ORIGINS`             | `http://localhost:5173`      |
    /// | `REQUEST_TIMEOUT_SECS`     | `30`                         |
    /// | `SHUTDOWN_TIMEOUT_SECS`    | `30`                         |
    /// | `MAX_UPLOAD_BYTES`         | `52428800`                   |
    /// | `COMFYUI_URL`              | `http://localhost:8188`      |
    /// | `COMFYUI_WS_URL`           | `COMFYUI_URL` with `ws` scheme |
    /// | `COMFYUI_REQUEST_TIMEOUT_SECS` | `60`                     |
    /// | `WORKFLOW_PATH`            | `workflows/colorize.json`    |
    /// | `STORAGE_PATH`             | `storage`                    |
    /// | `COMFYUI_OUTPUT_NODE`      | `1239`                       |
    /// | `COMFYUI_GRAY_NODE`        | `1222`                       |
    /// | `COMFYUI_REFERENCE_NODE`   | `1231`                       |
    /// | `WS_MESSAGE_TIMEOUT_SECS`  | `300`                        |
    /// | `WS_RECONNECT_ATTEMPTS`    | `10`                         |
    /// | `WS_RECONNECT_DELAY_SECS`  | `2`                          |
    /// | `POLL_INTERVAL_MS`         | `1000`                       |
    /// | `POLL_MAX_ATTEMPTS`        | `300`                        |
    /// | `ARTIFACT_FETCH_ATTEMPTS`  | `10`                         |
    /// | `ARTIFACT_FETCH_DELAY_MS`  | `500`                        |
    /// | `PROGRESS_HEARTBEAT_MS`    | `1000`                       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let host = env.string("HOST", "0.0.0.0");
        let port = env.parse("PORT", 8003u16, "u16")?;

        let cors_origins: Vec<String> = env
            .string("CORS_ORIGINS", "http://localhost:5173")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs = env.parse("REQUEST_TIMEOUT_SECS", 30u64, "u64")?;
        let shutdown_timeout_secs = env.parse("SHUTDOWN_TIMEOUT_SECS", 30u64, "u64")?;
        let max_upload_bytes = env.parse("MAX_UPLOAD_BYTES", 50 * 1024 * 1024usize, "usize")?;

        let comfyui_url = env
            .string("COMFYUI_URL", "http://localhost:8188")
            .trim_end_matches('/')
            .to_string();
        let comfyui_ws_url = lookup("COMFYUI_WS_URL").unwrap_or_else(|| ws_url_for(&comfyui_url));
        let comfyui_request_timeout =
            Duration::from_secs(env.parse("COMFYUI_REQUEST_TIMEOUT_SECS", 60u64, "u64")?);

        let output_node = env.string("COMFYUI_OUTPUT_NODE", "1239");

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            workflow_path: PathBuf::from(env.string("WORKFLOW_PATH", "workflows/colorize.json")),
            storage_root: PathBuf::from(env.string("STORAGE_PATH", "storage")),
            gray_node: env.string("COMFYUI_GRAY_NODE", &defaults.gray_node),
            reference_node: env.string("COMFYUI_REFERENCE_NODE", &defaults.reference_node),
            output_node: output_node.clone(),
            artifact_attempts: env.parse("ARTIFACT_FETCH_ATTEMPTS", 10u32, "u32")?,
            artifact_delay: Duration::from_millis(env.parse(
                "ARTIFACT_FETCH_DELAY_MS",
                500u64,
                "u64",
            )?),
            heartbeat: Duration::from_millis(env.parse("PROGRESS_HEARTBEAT_MS", 1000u64, "u64")?),
        };

        let listener = ListenerConfig {
            output_node: output_node.clone(),
            message_timeout: Duration::from_secs(env.parse(
                "WS_MESSAGE_TIMEOUT_SECS",
                300u64,
                "u64",
            )?),
            reconnect: ReconnectConfig {
                max_attempts: env.parse("WS_RECONNECT_ATTEMPTS", 10u32, "u32")?,
                delay: Duration::from_secs(env.parse("WS_RECONNECT_DELAY_SECS", 2u64, "u64")?),
            },
        };

        let poller = PollerConfig {
            output_node,
            interval: Duration::from_millis(env.parse("POLL_INTERVAL_MS", 1000u64, "u64")?),
            max_attempts: env.parse("POLL_MAX_ATTEMPTS", 300u32, "u32")?,
        };

        Ok(Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
            max_upload_bytes,
            comfyui_url,
            comfyui_ws_url,
            comfyui_request_timeout,
            pipeline,
            listener,
            poller,
        })
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str, default: &str) -> String {
        (self.0)(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(
        &self,
        key: &'static str,
        default: T,
        expected: &'static str,
    ) -> Result<T, ConfigError> {
        match (self.0)(key) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|_| ConfigError {
                key,
                expected,
                value,
            }),
        }
    }
}

/// `http://host` → `ws://host`, `https://host` → `wss://host`.
fn ws_url_for(http_url: &str) -> String {
    if let Some(rest) = http_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{http_url}")
    }
}
