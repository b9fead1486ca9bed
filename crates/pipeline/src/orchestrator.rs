//! Per-job orchestration task.
//!
//! Drives one job from uploaded assets to a stored result: upload both
//! images, bind them into the workflow template, enqueue, race the two
//! completion detectors, download the output artifact and persist it.
//! Every step announces itself on the job's progress channel first. The
//! task is the only writer of its [`JobEntry`].
//!
//! Cancellation is observed step by step. The completion race is never
//! dropped mid-flight: it stops its own detectors and reports back.

use std::future::Future;
use std::sync::Arc;

use tinter_comfyui::{ComfyUIBackend, CompletionRace, DetectionError};
use tinter_core::job_events::{ProgressEvent, ProgressSink};
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::registry::{Asset, JobEntry, JobResult};
use crate::storage::ResultStore;
use crate::workflow::WorkflowTemplate;

/// Shared dependencies of every orchestration task.
pub struct Pipeline {
    pub race: CompletionRace,
    pub store: ResultStore,
    pub config: PipelineConfig,
}

impl Pipeline {
    /// The REST client is shared with the race's poller.
    pub fn new(race: CompletionRace, config: PipelineConfig) -> Self {
        let store = ResultStore::new(config.storage_root.clone());
        Self {
            race,
            store,
            config,
        }
    }

    fn backend(&self) -> &dyn ComfyUIBackend {
        self.race.backend.as_ref()
    }

    async fn execute(
        &self,
        entry: &Arc<JobEntry>,
        gray: Asset,
        reference: Asset,
        cancel: &CancellationToken,
    ) -> Result<JobResult, PipelineError> {
        let sink: Arc<dyn ProgressSink> = entry.clone();
        let job_id = entry.id.as_str();

        // (a) uploads
        sink.publish(ProgressEvent::status("Uploading images to ComfyUI"));
        let gray_name = step(
            cancel,
            self.backend().upload_asset(gray.bytes, &gray.filename),
        )
        .await?;
        let reference_name = step(
            cancel,
            self.backend().upload_asset(reference.bytes, &reference.filename),
        )
        .await?;
        tracing::debug!(job_id, %gray_name, %reference_name, "Images uploaded");
        sink.publish(ProgressEvent::status("Images uploaded successfully"));

        // (b) template
        let mut workflow = step(cancel, WorkflowTemplate::load(&self.config.workflow_path)).await?;
        workflow.bind_image(&self.config.gray_node, &gray_name)?;
        workflow.bind_image(&self.config.reference_node, &reference_name)?;

        // (c) enqueue
        sink.publish(ProgressEvent::status("Queueing workflow"));
        let client_id = uuid::Uuid::new_v4().to_string();
        let graph = workflow.into_graph();
        let prompt_id = step(cancel, self.backend().enqueue(&graph, &client_id)).await?;
        tracing::info!(job_id, %prompt_id, "Workflow queued");
        sink.publish(ProgressEvent::queued(&prompt_id));

        // (d) completion
        sink.publish(ProgressEvent::status("Waiting for completion"));
        let detector = self
            .race
            .run(&prompt_id, &client_id, Arc::clone(&sink), cancel)
            .await
            .map_err(|e| match e {
                DetectionError::Cancelled => PipelineError::Cancelled,
                e => e.into(),
            })?;
        tracing::info!(job_id, %prompt_id, %detector, "Workflow finished");

        // (e) artifact
        sink.publish(ProgressEvent::status("Downloading result"));
        let bytes = step(cancel, self.download_result(&prompt_id)).await?;

        // (f) persist
        self.store.save(&entry.submitter, &prompt_id, &bytes).await?;

        Ok(JobResult {
            result_url: ResultStore::result_url(&entry.submitter, &prompt_id),
            prompt_id,
        })
    }

    /// Fetch the output node's first image, retrying while the prompt is
    /// missing from history.
    async fn download_result(&self, prompt_id: &str) -> Result<Vec<u8>, PipelineError> {
        let attempts = self.config.artifact_attempts;
        let node = &self.config.output_node;

        for attempt in 1..=attempts {
            match self.backend().fetch_history(prompt_id).await? {
                Some(history) => {
                    tracing::debug!(prompt_id, attempt, "History found");
                    let filename = history.output_filename(node).ok_or_else(|| {
                        PipelineError::MissingOutput {
                            prompt_id: prompt_id.to_string(),
                            node: node.clone(),
                        }
                    })?;
                    return Ok(self.backend().fetch_artifact(filename).await?);
                }
                None => {
                    tracing::debug!(prompt_id, attempt, attempts, "History not ready yet");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.artifact_delay).await;
                    }
                }
            }
        }

        Err(PipelineError::ArtifactUnavailable {
            prompt_id: prompt_id.to_string(),
            attempts,
        })
    }
}

/// Await one pipeline step unless the job is cancelled first.
async fn step<T, E>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, E>>,
) -> Result<T, PipelineError>
where
    PipelineError: From<E>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        res = work => Ok(res?),
    }
}

/// Run one job to its terminal state.
///
/// The terminal event is published before the state flips, so a relay
/// that sees the state change has already been handed the event.
pub(crate) async fn run_job(
    pipeline: Arc<Pipeline>,
    entry: Arc<JobEntry>,
    gray: Asset,
    reference: Asset,
    cancel: CancellationToken,
) {
    match pipeline.execute(&entry, gray, reference, &cancel).await {
        Ok(result) => {
            tracing::info!(
                job_id = %entry.id,
                prompt_id = %result.prompt_id,
                result_url = %result.result_url,
                "Job completed",
            );
            entry.publish(ProgressEvent::completed(&result.prompt_id, &result.result_url));
            entry.complete(result);
        }
        Err(e) => {
            tracing::error!(job_id = %entry.id, error = %e, "Job failed");
            let message = e.to_string();
            entry.publish(ProgressEvent::error(message.clone()));
            entry.fail(message);
        }
    }
}
