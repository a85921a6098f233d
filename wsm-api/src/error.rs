use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;
use wsm_orchestrator::OrchestratorError;
use wsm_provider::InfraError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Body of every error response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    /// Stable error class, e.g. `stale_state` or `source_not_found`.
    pub kind: String,
    pub error: String,
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    SourceNotFound(String),
    BadRequest(String),
    StaleState(String),
    Unauthorized(String),
    Infrastructure(String),
    Timeout(String),
    Internal(String),
}

impl ApiError {
    fn parts(self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::SourceNotFound(msg) => (StatusCode::NOT_FOUND, "source_not_found", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_input", msg),
            ApiError::StaleState(msg) => (StatusCode::CONFLICT, "stale_state", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            ApiError::Infrastructure(msg) => (StatusCode::BAD_GATEWAY, "infrastructure", msg),
            ApiError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "timeout", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = self.parts();

        let body = ErrorBody {
            kind: kind.to_string(),
            error: message,
        };
        (status, Json(body)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let message = err.to_string();
        match err {
            OrchestratorError::NotFound(_) => ApiError::NotFound(message),
            OrchestratorError::InvalidInput(msg) => ApiError::BadRequest(msg),
            OrchestratorError::StaleState { .. } => ApiError::StaleState(message),
            OrchestratorError::Timeout { .. } => ApiError::Timeout(message),
            OrchestratorError::Infrastructure(InfraError::SourceNotFound(_)) => {
                ApiError::SourceNotFound(message)
            }
            OrchestratorError::Infrastructure(InfraError::Unauthorized(_)) => {
                ApiError::Unauthorized(message)
            }
            OrchestratorError::Infrastructure(_) => ApiError::Infrastructure(message),
            other => {
                error!("Internal error: {}", other);
                ApiError::Internal(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wsm_orchestrator::MachineState;

    fn status_of(err: OrchestratorError) -> (StatusCode, &'static str) {
        let (status, kind, _) = ApiError::from(err).parts();
        (status, kind)
    }

    #[test]
    fn orchestrator_errors_map_to_status_and_kind() {
        assert_eq!(
            status_of(OrchestratorError::NotFound("Machine m1".into())),
            (StatusCode::NOT_FOUND, "not_found")
        );
        assert_eq!(
            status_of(OrchestratorError::Infrastructure(InfraError::SourceNotFound(
                "wsm-snapshots:gone".into()
            ))),
            (StatusCode::NOT_FOUND, "source_not_found")
        );
        assert_eq!(
            status_of(OrchestratorError::StaleState {
                machine_id: "m1".into(),
                expected: "running".into(),
                actual: MachineState::Stopped,
            }),
            (StatusCode::CONFLICT, "stale_state")
        );
        assert_eq!(
            status_of(OrchestratorError::Timeout {
                machine_id: "m1".into(),
                phase: "stopping",
            }),
            (StatusCode::GATEWAY_TIMEOUT, "timeout")
        );
        assert_eq!(
            status_of(OrchestratorError::Infrastructure(InfraError::Transient(
                "daemon restarting".into()
            ))),
            (StatusCode::BAD_GATEWAY, "infrastructure")
        );
        assert_eq!(
            status_of(OrchestratorError::Infrastructure(InfraError::Unauthorized(
                "registry login required".into()
            ))),
            (StatusCode::UNAUTHORIZED, "unauthorized")
        );
        assert_eq!(
            status_of(OrchestratorError::InvalidInput("empty".into())),
            (StatusCode::BAD_REQUEST, "invalid_input")
        );
    }
}
