use tinter_comfyui::{ComfyUIApiError, DetectionError};
use tinter_core::error::CoreError;

/// Everything that can fail a job.
///
/// The orchestration task turns any of these into the job's terminal
/// `failed` state; the `Display` text is what observers see.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Backend(#[from] ComfyUIApiError),

    #[error(transparent)]
    Detection(#[from] DetectionError),

    /// The workflow template is unreadable or lacks a required slot.
    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// History never showed up while fetching the result.
    #[error("History for prompt {prompt_id} not found after {attempts} attempts")]
    ArtifactUnavailable { prompt_id: String, attempts: u32 },

    /// History exists but the output node produced no image.
    #[error("Node {node} not found in outputs of prompt {prompt_id}")]
    MissingOutput { prompt_id: String, node: String },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Job cancelled")]
    Cancelled,
}
