//! Error handling module

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Daemon-wide error taxonomy. Every mutation surfaces one of these kinds;
/// callers switch on the kind rather than on message text.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// `nginx -t` rejected a generated fragment. Carries the combined
    /// nginx diagnostic; the orchestrator has already rolled back.
    #[error("Nginx configuration invalid: {0}")]
    ConfigInvalid(String),

    /// `nginx -t` passed but `nginx -s reload` did not. State is committed;
    /// the caller may retry the reload independently.
    #[error("Nginx reload failed: {0}")]
    ReloadFailed(String),

    /// Filesystem or scrape I/O failure. Surfaced but never blocks state
    /// changes that have already passed validation.
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("ACME error: {0}")]
    Acme(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable kind string for API consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::ConfigInvalid(_) => "config_invalid",
            AppError::ReloadFailed(_) => "reload_failed",
            AppError::Transient(_) => "transient",
            AppError::Acme(_) => "acme",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ConfigInvalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ReloadFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::Acme(_) => StatusCode::BAD_GATEWAY,
            AppError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(AppError::Validation("x".into()).kind(), "validation");
        assert_eq!(AppError::ConfigInvalid("x".into()).kind(), "config_invalid");
        assert_eq!(AppError::ReloadFailed("x".into()).kind(), "reload_failed");
    }

    #[test]
    fn test_config_invalid_carries_diagnostic() {
        let err = AppError::ConfigInvalid("nginx: [emerg] unknown directive".into());
        assert!(err.to_string().contains("unknown directive"));
    }
}
