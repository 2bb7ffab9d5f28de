use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("node is already running")]
    AlreadyRunning,
}

/// Rejections on the mobile bridge, all surfaced as HTTP 401
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MobileAuthError {
    #[error("Authorization required")]
    MissingAuthorization,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    Expired,
}

impl IntoResponse for MobileAuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}
