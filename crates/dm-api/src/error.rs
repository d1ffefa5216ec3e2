use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use dm_common::DmError;
use serde_json::json;

/// HTTP-facing wrapper: every failure is rendered as `{detail: string}`.
pub struct ApiError(pub DmError);

impl From<DmError> for ApiError {
    fn from(e: DmError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DmError::Validation(_) | DmError::ValidationRegex(_) | DmError::ValidationSize(_) => {
                StatusCode::BAD_REQUEST
            }
            DmError::NotFound(_) => StatusCode::NOT_FOUND,
            DmError::Conflict(_) => StatusCode::CONFLICT,
            DmError::Auth(_) => StatusCode::UNAUTHORIZED,
            DmError::Forbidden(_) => StatusCode::FORBIDDEN,
            DmError::AgentUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DmError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            DmError::Engine { status, .. } => status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"detail": self.0.to_string()}))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
