use crate::{error::ApiResult, state::AppState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use wsm_orchestrator::{Machine, MachineFilter, Snapshot, StartMachineRequest, StopOptions};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/machines", get(list_machines).post(start_machine))
        .route(
            "/api/v1/machines/{id}",
            get(get_machine).delete(remove_machine),
        )
        .route("/api/v1/machines/{id}/stop", post(stop_machine))
        .route("/api/v1/machines/{id}/snapshot", post(snapshot_machine))
        .route("/api/v1/machines/{id}/restart", post(restart_machine))
}

#[utoipa::path(
    get,
    path = "/api/v1/machines",
    tag = "machines",
    params(MachineFilter),
    responses((status = 200, description = "Machines, oldest first", body = [Machine]))
)]
pub(crate) async fn list_machines(
    State(state): State<AppState>,
    Query(filter): Query<MachineFilter>,
) -> Json<Vec<Machine>> {
    Json(state.orchestrator.list_machines(&filter))
}

/// Create (or restore) a machine and start it
#[utoipa::path(
    post,
    path = "/api/v1/machines",
    tag = "machines",
    request_body = StartMachineRequest,
    responses(
        (status = 201, description = "Machine running", body = Machine),
        (status = 404, description = "Snapshot to restore is gone", body = crate::error::ErrorBody),
        (status = 504, description = "Deadline exceeded", body = crate::error::ErrorBody)
    )
)]
pub(crate) async fn start_machine(
    State(state): State<AppState>,
    Json(req): Json<StartMachineRequest>,
) -> ApiResult<(StatusCode, Json<Machine>)> {
    let machine = state.orchestrator.start_machine(req).await?;
    Ok((StatusCode::CREATED, Json(machine)))
}

#[utoipa::path(
    get,
    path = "/api/v1/machines/{id}",
    tag = "machines",
    params(("id" = String, Path, description = "Machine id")),
    responses(
        (status = 200, description = "Machine found", body = Machine),
        (status = 404, description = "Unknown machine", body = crate::error::ErrorBody)
    )
)]
pub(crate) async fn get_machine(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Machine>> {
    let machine = state.orchestrator.get_machine(&id)?;
    Ok(Json(machine))
}

/// Destroy a stopped, crashed or failed machine
#[utoipa::path(
    delete,
    path = "/api/v1/machines/{id}",
    tag = "machines",
    params(("id" = String, Path, description = "Machine id")),
    responses(
        (status = 204, description = "Machine removed"),
        (status = 409, description = "Machine must be stopped first", body = crate::error::ErrorBody)
    )
)]
pub(crate) async fn remove_machine(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.remove_machine(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/machines/{id}/stop",
    tag = "machines",
    params(("id" = String, Path, description = "Machine id")),
    request_body(content = StopOptions, description = "Omit to stop without a snapshot"),
    responses(
        (status = 200, description = "Machine stopped", body = Machine),
        (status = 409, description = "Machine is not running", body = crate::error::ErrorBody)
    )
)]
pub(crate) async fn stop_machine(
    State(state): State<AppState>,
    Path(id): Path<String>,
    options: Option<Json<StopOptions>>,
) -> ApiResult<Json<Machine>> {
    let options = options.map(|Json(options)| options).unwrap_or_default();
    let machine = state.orchestrator.stop_machine(&id, options).await?;
    Ok(Json(machine))
}

#[utoipa::path(
    post,
    path = "/api/v1/machines/{id}/snapshot",
    tag = "machines",
    params(("id" = String, Path, description = "Machine id")),
    responses(
        (status = 201, description = "Snapshot stored", body = Snapshot),
        (status = 409, description = "Machine is not running", body = crate::error::ErrorBody)
    )
)]
pub(crate) async fn snapshot_machine(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Snapshot>)> {
    let snapshot = state.orchestrator.snapshot_machine(&id, None).await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

#[utoipa::path(
    post,
    path = "/api/v1/machines/{id}/restart",
    tag = "machines",
    params(("id" = String, Path, description = "Machine id")),
    responses(
        (status = 200, description = "Machine running again", body = Machine),
        (status = 409, description = "Machine is not stopped or crashed", body = crate::error::ErrorBody)
    )
)]
pub(crate) async fn restart_machine(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Machine>> {
    let machine = state.orchestrator.restart_machine(&id).await?;
    Ok(Json(machine))
}
