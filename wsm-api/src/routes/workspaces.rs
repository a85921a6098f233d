use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use wsm_orchestrator::{Machine, Snapshot};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/workspaces/{id}/machine", get(workspace_machine))
        .route("/api/v1/workspaces/{id}/snapshots", get(list_snapshots))
        .route("/api/v1/workspaces/{id}/activity", post(record_activity))
}

/// The workspace's running machine, or its most recent one
#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{id}/machine",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace id")),
    responses(
        (status = 200, description = "Machine backing the workspace", body = Machine),
        (status = 404, description = "Workspace has no machine", body = crate::error::ErrorBody)
    )
)]
pub(crate) async fn workspace_machine(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<Machine>> {
    state
        .orchestrator
        .machine_for_workspace(&workspace_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No machine for workspace {workspace_id}")))
}

/// Stored snapshots of a workspace, newest first
#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{id}/snapshots",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace id")),
    responses((status = 200, description = "Snapshots", body = [Snapshot]))
)]
pub(crate) async fn list_snapshots(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<Json<Vec<Snapshot>>> {
    let snapshots = state.orchestrator.list_snapshots(&workspace_id).await?;
    Ok(Json(snapshots))
}

/// Mark the workspace as in use, postponing its idle timeout
#[utoipa::path(
    post,
    path = "/api/v1/workspaces/{id}/activity",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace id")),
    responses(
        (status = 204, description = "Activity recorded"),
        (status = 404, description = "Workspace has no machine", body = crate::error::ErrorBody)
    )
)]
pub(crate) async fn record_activity(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.orchestrator.machine_for_workspace(&workspace_id).is_none() {
        return Err(ApiError::NotFound(format!(
            "No machine for workspace {workspace_id}"
        )));
    }
    state.activity.record_activity(&workspace_id);
    Ok(StatusCode::NO_CONTENT)
}
