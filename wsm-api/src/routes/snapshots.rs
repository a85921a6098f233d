use crate::{error::ApiResult, state::AppState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::delete,
    Router,
};

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/snapshots/{id}", delete(delete_snapshot))
}

/// Delete a stored snapshot and its image
#[utoipa::path(
    delete,
    path = "/api/v1/snapshots/{id}",
    tag = "snapshots",
    params(("id" = String, Path, description = "Snapshot id")),
    responses(
        (status = 204, description = "Snapshot deleted"),
        (status = 404, description = "Unknown snapshot", body = crate::error::ErrorBody)
    )
)]
pub(crate) async fn delete_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.delete_snapshot(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
