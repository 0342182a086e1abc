//! Common error types for the studio

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Classification of failures reported by the image provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// Key rejected or deployment not accessible
    Authentication,
    /// Provider-side quota or rate limit hit (HTTP 429)
    QuotaExceeded,
    /// Prompt or output blocked by the content filter
    ContentPolicy,
    /// Provider rejected a parameter
    InvalidParameter,
    /// Server-side or network failure
    Transient,
    /// The provider answered with something we could not interpret
    InvalidResponse,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Authentication => "authentication",
            Self::QuotaExceeded => "quota exceeded",
            Self::ContentPolicy => "content policy violation",
            Self::InvalidParameter => "invalid parameter",
            Self::Transient => "transient failure",
            Self::InvalidResponse => "invalid response",
        };
        f.write_str(s)
    }
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Remote service error ({kind}{}): {message}", .status.map(|s| format!(", HTTP {}", s)).unwrap_or_default())]
    RemoteService {
        kind: RemoteErrorKind,
        status: Option<u16>,
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("No active session, connect to a deployment first")]
    NoSession,

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid job state: {0}")]
    InvalidState(String),

    #[error("Request queue is full")]
    QueueFull,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Shorthand for a provider failure without a status code
    pub fn remote(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self::RemoteService {
            kind,
            status: None,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    fn classify(&self) -> (StatusCode, &'static str, Option<String>) {
        match self {
            AppError::Settings(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None),
            AppError::Configuration(_) => (
                StatusCode::BAD_REQUEST,
                "configuration_error",
                Some("invalid_configuration".into()),
            ),
            AppError::NoSession => (
                StatusCode::BAD_REQUEST,
                "configuration_error",
                Some("no_session".into()),
            ),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error", None),
            AppError::RemoteService { kind, .. } => {
                let status = match kind {
                    RemoteErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
                    RemoteErrorKind::ContentPolicy | RemoteErrorKind::InvalidParameter => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    _ => StatusCode::BAD_GATEWAY,
                };
                let code = serde_json::to_value(kind)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from));
                (status, "remote_service_error", code)
            }
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout_error", None),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None),
            AppError::Json(_) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                Some("invalid_json".into()),
            ),
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, "remote_service_error", None),
            AppError::JobNotFound(_) => (
                StatusCode::NOT_FOUND,
                "not_found_error",
                Some("job_not_found".into()),
            ),
            AppError::InvalidState(_) => (StatusCode::CONFLICT, "invalid_state_error", None),
            AppError::QueueFull => (
                StatusCode::SERVICE_UNAVAILABLE,
                "server_error",
                Some("queue_full".into()),
            ),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None),
        }
    }

    /// JSON body describing this error, shared by HTTP responses and job views
    pub fn detail(&self) -> ErrorDetail {
        let (_, error_type, code) = self.classify();
        ErrorDetail {
            message: self.to_string(),
            r#type: error_type.to_string(),
            code,
        }
    }
}

/// Error response format
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
    pub code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, _, _) = self.classify();
        let body = Json(ErrorResponse {
            error: self.detail(),
        });

        (status, body).into_response()
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;
