//! History-polling completion detector.
//!
//! Re-queries `GET /history/{prompt_id}` on a fixed interval until the
//! output node shows up in the prompt's outputs, ComfyUI reports the prompt
//! as failed, or the attempt ceiling is reached. A failed fetch only costs
//! one attempt: a network blip must not fail a job that is otherwise
//! running fine.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::ComfyUIBackend;
use crate::completion::{CompletionSignal, DetectionError, Detector};

/// Poller tuning.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Node whose output marks the prompt as done.
    pub output_node: String,
    /// Delay between polls. The first poll is immediate.
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            output_node: "1239".to_string(),
            interval: Duration::from_secs(1),
            max_attempts: 300,
        }
    }
}

/// Poll the history of `prompt_id` until it completes or fails.
pub async fn poll_history(
    backend: Arc<dyn ComfyUIBackend>,
    config: PollerConfig,
    prompt_id: String,
    signal: Arc<CompletionSignal>,
    cancel: CancellationToken,
) -> Result<(), DetectionError> {
    for attempt in 0..config.max_attempts {
        if attempt > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return Err(DetectionError::Cancelled),
                _ = tokio::time::sleep(config.interval) => {}
            }
        }

        let history = tokio::select! {
            _ = cancel.cancelled() => return Err(DetectionError::Cancelled),
            history = backend.fetch_history(&prompt_id) => history,
        };

        match history {
            Ok(Some(entry)) if entry.has_output(&config.output_node) => {
                tracing::info!(
                    prompt_id = %prompt_id,
                    attempt = attempt + 1,
                    "Workflow completed (detected via polling)",
                );
                signal.fire(Detector::Poller);
                return Ok(());
            }
            Ok(Some(entry)) if entry.is_error() => {
                let messages = entry.error_messages();
                tracing::error!(
                    prompt_id = %prompt_id,
                    ?messages,
                    "ComfyUI reported execution error",
                );
                return Err(DetectionError::RemoteExecution { messages });
            }
            Ok(_) => {
                tracing::trace!(
                    prompt_id = %prompt_id,
                    attempt = attempt + 1,
                    "Prompt not finished yet",
                );
            }
            Err(e) => {
                tracing::warn!(
                    prompt_id = %prompt_id,
                    attempt = attempt + 1,
                    error = %e,
                    "Polling error",
                );
            }
        }
    }

    tracing::warn!(
        prompt_id = %prompt_id,
        attempts = config.max_attempts,
        "Workflow did not complete before the poll ceiling",
    );
    Err(DetectionError::PollTimeout {
        attempts: config.max_attempts,
    })
}
