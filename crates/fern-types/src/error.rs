// Error kinds shared across the host (spec §7). Every crate's own error
// type converts into this one at its public boundary; `fern-webhook` maps it
// onto HTTP status codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum FernError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("signature verification failed: {0}")]
    Signature(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("turn exceeded {elapsed_ms}ms budget")]
    Timeout { elapsed_ms: u64 },

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl FernError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            FernError::Validation(_) => StatusCode::BAD_REQUEST,
            FernError::Signature(_) => StatusCode::FORBIDDEN,
            FernError::NotFound(_) => StatusCode::NOT_FOUND,
            FernError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            FernError::StateConflict(_) => StatusCode::CONFLICT,
            FernError::Transient(_) => StatusCode::BAD_GATEWAY,
            FernError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for FernError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
