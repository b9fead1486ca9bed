use std::path::PathBuf;
use std::time::Duration;

/// Tuning for the per-job orchestration task and the progress relay.
///
/// The completion race carries its own listener and poller configs; the
/// output node here must match theirs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Workflow template JSON, re-read for every job.
    pub workflow_path: PathBuf,
    /// Root directory for persisted results.
    pub storage_root: PathBuf,
    /// Template node receiving the grayscale image.
    pub gray_node: String,
    /// Template node receiving the colour reference image.
    pub reference_node: String,
    /// Node whose first image is the job's result.
    pub output_node: String,
    /// History lookups before giving up on the result artifact.
    pub artifact_attempts: u32,
    pub artifact_delay: Duration,
    /// Longest quiet period before the relay emits a heartbeat.
    pub heartbeat: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workflow_path: PathBuf::from("workflows/colorize.json"),
            storage_root: PathBuf::from("storage"),
            gray_node: "1222".to_string(),
            reference_node: "1231".to_string(),
            output_node: "1239".to_string(),
            artifact_attempts: 10,
            artifact_delay: Duration::from_millis(500),
            heartbeat: Duration::from_secs(1),
        }
    }
}
