//! API error mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crucible_core::Error;

/// Wrapper turning core errors into HTTP responses carrying the stable
/// error kind.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            "not-found" | "pipeline-not-found" => StatusCode::NOT_FOUND,
            "invalid-input" | "pipeline-invalid" | "matrix-explosion" | "dag-cycle"
            | "dag-unresolved" => StatusCode::BAD_REQUEST,
            "agent-auth-failed" => StatusCode::UNAUTHORIZED,
            "store-conflict" => StatusCode::CONFLICT,
            "no-agent-available" | "breaker-open" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
