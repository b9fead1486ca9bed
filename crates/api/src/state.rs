use std::sync::Arc;

use tinter_comfyui::{ComfyUIApi, ComfyUIApiError, ComfyUIClient, CompletionRace};
use tinter_pipeline::{JobRegistry, Pipeline};

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Every job submitted to this process, plus the pipeline running them.
    pub registry: Arc<JobRegistry>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wire the ComfyUI clients, the completion race and the job registry
    /// from configuration.
    ///
    /// Fails only if the HTTP client cannot be built.
    pub fn from_config(config: ServerConfig) -> Result<Self, ComfyUIApiError> {
        let backend = Arc::new(ComfyUIApi::new(
            config.comfyui_url.clone(),
            config.comfyui_request_timeout,
        )?);
        let connector = Arc::new(ComfyUIClient::new(config.comfyui_ws_url.clone()));
        let race = CompletionRace::new(
            connector,
            backend,
            config.listener.clone(),
            config.poller.clone(),
        );
        let pipeline = Pipeline::new(race, config.pipeline.clone());

        Ok(Self {
            registry: Arc::new(JobRegistry::new(pipeline)),
            config: Arc::new(config),
        })
    }
}
