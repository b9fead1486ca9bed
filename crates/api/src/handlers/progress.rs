//! Server-Sent Events view of a job's progress.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::header::CACHE_CONTROL;
use axum::http::HeaderName;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use futures::StreamExt;
use tinter_core::error::CoreError;
use tinter_pipeline::{stream_progress, RelayMessage};

use crate::error::AppResult;
use crate::state::AppState;

/// Tells nginx-style proxies not to buffer the stream.
static X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// GET /progress/{job_id}
///
/// One `data:` frame per relay message, ending after `done` or `error`.
pub async fn stream_job_progress(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let entry = state
        .registry
        .get(&job_id)
        .await
        .ok_or(CoreError::NotFound {
            entity: "Job",
            id: job_id.clone(),
        })?;

    tracing::info!(job_id = %job_id, "Progress stream opened");

    let heartbeat = state.registry.pipeline().config.heartbeat;
    let events = stream_progress(entry, heartbeat)
        .map(|message| Ok::<_, Infallible>(to_sse_event(&message)));

    Ok((
        [
            (CACHE_CONTROL, "no-cache"),
            (X_ACCEL_BUFFERING.clone(), "no"),
        ],
        Sse::new(events),
    ))
}

fn to_sse_event(message: &RelayMessage) -> Event {
    Event::default().data(message.to_json().to_string())
}
