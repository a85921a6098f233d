use crate::state::AppState;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "Service is up"))
)]
pub(crate) async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "wsm-api",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Database reachable"),
        (status = 503, description = "Database unreachable")
    )
)]
pub(crate) async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    // Check database connectivity
    let db_ok = sqlx::query("SELECT 1")
        .fetch_one(state.orchestrator.pool())
        .await
        .is_ok();

    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if db_ok { "ready" } else { "not_ready" },
            "service": "wsm-api",
            "version": env!("CARGO_PKG_VERSION"),
            "database": if db_ok { "connected" } else { "disconnected" },
            "provider": state.orchestrator.infrastructure().name()
        })),
    )
}
