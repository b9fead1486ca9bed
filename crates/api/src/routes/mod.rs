pub mod health;

use axum::routing::{get, post};
use axum::Router;

use crate::handlers;
use crate::state::AppState;

/// Build the job route tree.
///
/// ```text
/// /submit                          submit a job (POST, multipart)
/// /progress/{job_id}               progress stream (GET, SSE)
/// /jobs/{job_id}                   job snapshot (GET)
/// /download/{user_id}/{filename}   stored result (GET)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/submit", post(handlers::jobs::submit_job))
        .route("/progress/{job_id}", get(handlers::progress::stream_job_progress))
        .route("/jobs/{job_id}", get(handlers::jobs::get_job))
        .route(
            "/download/{user_id}/{filename}",
            get(handlers::download::download_result),
        )
}
