// Gateway error taxonomy and the JSON envelope returned to clients

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};

/// Errors surfaced by the gateway.
///
/// Every variant maps onto one of the wire-level error kinds; the
/// `IntoResponse` impl renders the envelope
/// `{error, message, error_code?, client_operation?, details?}`.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{message}")]
    InvalidRequest { message: String },

    #[error("{message}")]
    Validation {
        message: String,
        error_code: &'static str,
        client_operation: Option<String>,
        details: Option<Value>,
    },

    #[error("conversation message limit reached ({limit})")]
    LimitExceeded { limit: usize },

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("provider error: {message}")]
    Provider {
        message: String,
        status: Option<u16>,
    },

    #[error("tool orchestration error: {0}")]
    ToolOrchestration(String),

    #[error("upstream connection error: {0}")]
    Upstream(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn validation(
        error_code: &'static str,
        message: impl Into<String>,
        client_operation: Option<String>,
        details: Option<Value>,
    ) -> Self {
        Self::Validation {
            message: message.into(),
            error_code,
            client_operation,
            details,
        }
    }

    /// The wire-level error kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request_error",
            Self::Validation { .. } => "validation_error",
            Self::LimitExceeded { .. } => "limit_exceeded",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::Provider { .. } => "provider_error",
            Self::ToolOrchestration(_) => "tool_orchestration_error",
            Self::Upstream(_) => "upstream_error",
            Self::Database(_) | Self::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } | Self::Validation { .. } | Self::LimitExceeded { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Provider { status, .. } => status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::ToolOrchestration(_) | Self::Database(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The JSON body sent to the client.
    pub fn envelope(&self) -> Value {
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });

        if let Self::Validation {
            error_code,
            client_operation,
            details,
            ..
        } = self
        {
            body["success"] = json!(false);
            body["error_code"] = json!(error_code);
            if let Some(op) = client_operation {
                body["client_operation"] = json!(op);
            }
            if let Some(details) = details {
                body["details"] = details.clone();
            }
        }

        if let Self::Provider {
            status: Some(status),
            ..
        } = self
        {
            body["details"] = json!({ "upstream_status": status });
        }

        body
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, Json(self.envelope())).into_response();

        if let Self::RateLimitExceeded { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}

/// Failure to list a provider's models; carries the upstream status and
/// body so auth problems are diagnosable from the client side.
#[derive(Debug, thiserror::Error)]
#[error("provider models error (HTTP {status}): {body}")]
pub struct ProviderModelsError {
    pub status: u16,
    pub body: String,
}
