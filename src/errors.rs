use crate::{backends::BackendError, models::upload::InvalidTransition};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Failures of the orchestration core, classified by how a caller should
/// react to them.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or missing request input.
    #[error("{0}")]
    Validation(String),
    #[error("authentication required")]
    Unauthorized,
    /// The caller's role is insufficient.
    #[error("{0}")]
    Forbidden(String),
    /// The operation collides with one already in flight.
    #[error("{0}")]
    Conflict(String),
    #[error("insufficient quota: {required} bytes required, {available} available")]
    ResourceExhausted { required: i64, available: i64 },
    #[error(transparent)]
    Upstream(#[from] BackendError),
    /// A saga step failed after earlier steps had side effects. Those were
    /// compensated before this error was returned.
    #[error("{phase} failed: {source}")]
    PartialFailure {
        phase: String,
        #[source]
        source: Box<GatewayError>,
    },
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn partial(phase: impl fmt::Display, source: impl Into<GatewayError>) -> Self {
        GatewayError::PartialFailure {
            phase: phase.to_string(),
            source: Box::new(source.into()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::ResourceExhausted { .. } => StatusCode::INSUFFICIENT_STORAGE,
            GatewayError::Upstream(err) => backend_status(err),
            GatewayError::PartialFailure { source, .. } => source.status(),
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// HTTP status reflecting the nearest backend error code.
fn backend_status(err: &BackendError) -> StatusCode {
    match err {
        BackendError::NotFound(_) => StatusCode::NOT_FOUND,
        BackendError::AlreadyExists(_) => StatusCode::CONFLICT,
        BackendError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        BackendError::ResourceExhausted(_) => StatusCode::INSUFFICIENT_STORAGE,
        BackendError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        BackendError::Internal(_) | BackendError::Sqlx(_) | BackendError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<InvalidTransition> for GatewayError {
    fn from(err: InvalidTransition) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// A lightweight wrapper for errors leaving the HTTP layer.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let status = err.status();
        if status.is_server_error() {
            tracing::warn!("request failed: {}", err);
        }
        AppError::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_errors_map_to_nearest_status() {
        let not_found = GatewayError::from(BackendError::NotFound("file `x`".into()));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let quota = GatewayError::from(BackendError::ResourceExhausted("quota".into()));
        assert_eq!(quota.status(), StatusCode::INSUFFICIENT_STORAGE);

        let io = GatewayError::from(BackendError::Io(std::io::Error::other("disk")));
        assert_eq!(io.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn partial_failure_reports_its_cause() {
        let err = GatewayError::partial(
            "storage_copy",
            BackendError::Unavailable("storage".into()),
        );
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.to_string().starts_with("storage_copy failed"));
    }

    #[test]
    fn app_error_carries_status() {
        let app: AppError = GatewayError::Forbidden("no".into()).into();
        assert_eq!(app.status, StatusCode::FORBIDDEN);
        assert_eq!(app.message, "no");
    }
}
