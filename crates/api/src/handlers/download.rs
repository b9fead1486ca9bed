use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;

use crate::error::AppResult;
use crate::state::AppState;

/// GET /download/{user_id}/{filename}
///
/// Serves a stored result. Names that would leave the user's result
/// directory are rejected with 400.
pub async fn download_result(
    State(state): State<AppState>,
    Path((user_id, filename)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let bytes = state
        .registry
        .pipeline()
        .store
        .fetch_result(&user_id, &filename)
        .await?;

    Ok(([(CONTENT_TYPE, "image/png")], bytes))
}
