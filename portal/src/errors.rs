//! Error types for the deploy portal

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use openapi_server::models::ErrorResponse;
use thiserror::Error;

/// Main error type for the deploy portal
#[derive(Error, Debug)]
pub enum PortalError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Malformed request, rejected before any remote action
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Unreachable host, authentication failure or connect timeout
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A remote command exited with a non-zero status
    #[error("step `{command}` exited with status {exit_code}: {detail}")]
    RemoteCommandError {
        command: String,
        exit_code: u32,
        detail: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("deployment cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PortalError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PortalError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PortalError::NotFound(_) => StatusCode::NOT_FOUND,
            PortalError::LockTimeout(_) => StatusCode::CONFLICT,
            PortalError::ConnectionError(_) | PortalError::RemoteCommandError { .. } => {
                StatusCode::BAD_GATEWAY
            }
            PortalError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Human-readable message, without the category prefix where the
    /// category is already conveyed by the status code
    pub fn detail(&self) -> String {
        match self {
            PortalError::ValidationError(msg)
            | PortalError::NotFound(msg)
            | PortalError::LockTimeout(msg)
            | PortalError::Timeout(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for PortalError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!("Request failed with {}: {}", status, self);
        }
        (
            status,
            Json(ErrorResponse {
                detail: self.detail(),
            }),
        )
            .into_response()
    }
}
