//! Handlers for job submission and job snapshots.

use axum::extract::multipart::Field;
use axum::extract::{Multipart, Path, State};
use axum::Json;
use serde::Serialize;
use tinter_core::error::CoreError;
use tinter_core::types::{JobId, Timestamp};
use tinter_pipeline::{Asset, JobResult, JobState};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Response body of `POST /submit`.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub message: &'static str,
}

/// Point-in-time view of a job.
#[derive(Debug, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: &'static str,
    pub submitter: String,
    pub created_at: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /submit
///
/// Multipart form with `gray_image` and `reference_image` files and a
/// `user_id` text field. Starts the job and returns its id right away;
/// progress is observed through `/progress/{job_id}`.
pub async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<SubmitResponse>> {
    let mut gray = None;
    let mut reference = None;
    let mut user_id = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "gray_image" => gray = Some(read_asset(field).await?),
            "reference_image" => reference = Some(read_asset(field).await?),
            "user_id" => user_id = Some(field.text().await?.trim().to_string()),
            other => tracing::debug!(field = other, "Ignoring unknown multipart field"),
        }
    }

    let gray = gray.ok_or_else(|| missing("gray_image"))?;
    let reference = reference.ok_or_else(|| missing("reference_image"))?;
    let user_id = user_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| missing("user_id"))?;

    let job_id = state.registry.submit(gray, reference, &user_id).await?;

    Ok(Json(SubmitResponse {
        job_id,
        message: "Workflow submitted",
    }))
}

async fn read_asset(field: Field<'_>) -> AppResult<Asset> {
    let filename = field.file_name().unwrap_or("image.png").to_string();
    let bytes = field.bytes().await?;
    if bytes.is_empty() {
        return Err(AppError::BadRequest(format!("{filename} is empty")));
    }
    Ok(Asset::new(filename, bytes.to_vec()))
}

fn missing(field: &str) -> AppError {
    AppError::BadRequest(format!("Missing multipart field: {field}"))
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// GET /jobs/{job_id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<JobSnapshot>> {
    let entry = state
        .registry
        .get(&job_id)
        .await
        .ok_or(CoreError::NotFound {
            entity: "Job",
            id: job_id,
        })?;

    let job_state = entry.state();
    let (result, error) = match &job_state {
        JobState::Processing => (None, None),
        JobState::Completed(result) => (Some(result.clone()), None),
        JobState::Failed(message) => (None, Some(message.clone())),
    };

    Ok(Json(JobSnapshot {
        job_id: entry.id.clone(),
        status: job_state.as_str(),
        submitter: entry.submitter.clone(),
        created_at: entry.created_at,
        result,
        error,
    }))
}
