use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Unified application error type following OpenAI error format.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid model identifier: {0}")]
    InvalidModel(String),

    #[error("No provider available for model: {0}")]
    NoProviderAvailable(String),

    #[error("Insufficient balance: required {required:.6} MULE, available {available:.6} MULE")]
    InsufficientBalance { required: f64, available: f64 },

    #[error("Provider timed out after {timeout_secs}s")]
    ProviderTimeout { timeout_secs: u64 },

    #[error("Provider transport error: {0}")]
    ProviderTransport(String),

    #[error("Provider returned a bad response: {0}")]
    ProviderBadResponse(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// OpenAI-compatible error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    r#type: String,
    code: Option<String>,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::InvalidModel(_) | Self::NoProviderAvailable(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::ProviderTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::ProviderTransport(_) | Self::ProviderBadResponse(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Unauthorized(_) => "authentication_error",
            Self::Forbidden(_) => "permission_error",
            Self::NotFound(_) => "not_found_error",
            Self::BadRequest(_) | Self::InvalidModel(_) => "invalid_request_error",
            Self::NoProviderAvailable(_) => "invalid_request_error",
            Self::InsufficientBalance { .. } => "insufficient_quota",
            Self::ProviderTimeout { .. } | Self::ProviderTransport(_) | Self::ProviderBadResponse(_) => {
                "api_error"
            }
            Self::Database(_) | Self::Internal(_) => "server_error",
        }
    }

    fn error_code(&self) -> Option<&str> {
        match self {
            Self::Unauthorized(_) => Some("invalid_api_key"),
            Self::InvalidModel(_) => Some("invalid_model"),
            Self::NoProviderAvailable(_) => Some("model_not_available"),
            Self::InsufficientBalance { .. } => Some("insufficient_balance"),
            Self::ProviderTimeout { .. } => Some("provider_timeout"),
            Self::ProviderTransport(_) => Some("provider_transport_error"),
            Self::ProviderBadResponse(_) => Some("provider_bad_response"),
            Self::Database(_) | Self::Internal(_) => Some("internal_error"),
            _ => None,
        }
    }

    /// Message exposed to the client. Internal errors are reduced to a
    /// generic line so details stay in the server logs.
    fn user_message(&self) -> String {
        match self {
            Self::Database(_) | Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Database(_) | AppError::Internal(_) => {
                tracing::error!(error = %self, "Internal error");
            }
            AppError::ProviderTimeout { .. }
            | AppError::ProviderTransport(_)
            | AppError::ProviderBadResponse(_) => {
                tracing::warn!(error = %self, "Provider error");
            }
            _ => {
                tracing::debug!(error = %self, "Client error");
            }
        }

        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorDetail {
                message: self.user_message(),
                r#type: self.error_type().to_string(),
                code: self.error_code().map(String::from),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        tracing::error!(error = %err, "Database error");
        Self::Database(err.to_string())
    }
}
