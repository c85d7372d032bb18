// Error handling module
// Defines the structured error discriminator and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::oidc::OidcError;
use crate::store::StoreError;

/// Machine-readable error discriminator carried in the `error` field of every
/// error body. Clients branch on this value only, never on the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The SSO browser step is unfinished or the stored token is unusable
    SsoLoginRequired,
    DeviceCodeExpired,
    AccessDenied,
    NotFound,
    ValidationError,
    UpstreamError,
    Unauthorized,
    InternalError,
    /// Any discriminator this build does not know about
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SsoLoginRequired => "SSO_LOGIN_REQUIRED",
            ErrorCode::DeviceCodeExpired => "DEVICE_CODE_EXPIRED",
            ErrorCode::AccessDenied => "ACCESS_DENIED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::UpstreamError => "UPSTREAM_ERROR",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire shape of an error response: `{"message": ..., "error": ...}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

/// API errors that can occur during request processing
#[derive(Error, Debug)]
pub enum ApiError {
    /// SSO login must be (re)done before this operation can succeed
    #[error("SSO login required: {0}")]
    SsoLoginRequired(String),

    /// The device code outlived its validity window
    #[error("Device code expired: {0}")]
    DeviceCodeExpired(String),

    /// The user denied the device authorization
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Missing or invalid API key
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Error from an AWS endpoint
    #[error("AWS API error: {status} - {message}")]
    UpstreamError { status: u16, message: String },

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::SsoLoginRequired(_) => ErrorCode::SsoLoginRequired,
            ApiError::DeviceCodeExpired(_) => ErrorCode::DeviceCodeExpired,
            ApiError::AccessDenied(_) => ErrorCode::AccessDenied,
            ApiError::NotFound(_) => ErrorCode::NotFound,
            ApiError::ValidationError(_) => ErrorCode::ValidationError,
            ApiError::AuthError(_) => ErrorCode::Unauthorized,
            ApiError::UpstreamError { .. } => ErrorCode::UpstreamError,
            ApiError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::SsoLoginRequired(_) => StatusCode::UNAUTHORIZED,
            ApiError::DeviceCodeExpired(_) => StatusCode::BAD_REQUEST,
            ApiError::AccessDenied(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::AuthError(_) => StatusCode::UNAUTHORIZED,
            ApiError::UpstreamError { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let message = match self {
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                "Internal server error".to_string()
            }
            ApiError::UpstreamError { status, message } => {
                tracing::warn!(upstream_status = status, "AWS API error: {}", message);
                format!("AWS returned {}: {}", status, message)
            }
            ApiError::SsoLoginRequired(msg)
            | ApiError::DeviceCodeExpired(msg)
            | ApiError::AccessDenied(msg)
            | ApiError::NotFound(msg)
            | ApiError::ValidationError(msg)
            | ApiError::AuthError(msg) => msg,
        };

        let body = Json(json!({
            "message": message,
            "error": code,
        }));

        (status, body).into_response()
    }
}

impl From<OidcError> for ApiError {
    fn from(err: OidcError) -> Self {
        match err {
            OidcError::AuthorizationPending(msg) => ApiError::SsoLoginRequired(msg),
            OidcError::Unauthorized(msg) => ApiError::SsoLoginRequired(msg),
            OidcError::ExpiredToken(msg) => ApiError::DeviceCodeExpired(msg),
            OidcError::AccessDenied(msg) => ApiError::AccessDenied(msg),
            OidcError::Api { status, message } => ApiError::UpstreamError { status, message },
            OidcError::Transport(e) => {
                ApiError::Internal(anyhow::anyhow!("AWS request failed: {}", e))
            }
            OidcError::Decode(msg) => {
                ApiError::Internal(anyhow::anyhow!("Unexpected AWS response: {}", msg))
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionNotFound(name) => {
                ApiError::NotFound(format!("SSO session '{}' not found", name))
            }
            StoreError::MappingNotFound(name) => {
                ApiError::NotFound(format!("No mapping for context '{}'", name))
            }
            StoreError::SessionExists(name) => {
                ApiError::ValidationError(format!("SSO session '{}' already exists", name))
            }
            other => ApiError::Internal(anyhow::Error::new(other)),
        }
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
