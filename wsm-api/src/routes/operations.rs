use crate::{error::ApiResult, state::AppState};
use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use wsm_orchestrator::{Operation, OperationFilter};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/operations", get(list_operations))
        .route("/api/v1/operations/{id}", get(get_operation))
}

#[utoipa::path(
    get,
    path = "/api/v1/operations",
    tag = "operations",
    params(OperationFilter),
    responses((status = 200, description = "Operations, newest first", body = [Operation]))
)]
pub(crate) async fn list_operations(
    State(state): State<AppState>,
    Query(filter): Query<OperationFilter>,
) -> ApiResult<Json<Vec<Operation>>> {
    let operations = state.orchestrator.operations(&filter).await?;

    Ok(Json(operations))
}

#[utoipa::path(
    get,
    path = "/api/v1/operations/{id}",
    tag = "operations",
    params(("id" = String, Path, description = "Operation id")),
    responses(
        (status = 200, description = "Operation found", body = Operation),
        (status = 404, description = "Unknown operation", body = crate::error::ErrorBody)
    )
)]
pub(crate) async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Operation>> {
    let operation = state.orchestrator.get_operation(&id).await?;

    Ok(Json(operation))
}
