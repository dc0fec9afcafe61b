//! Standardized error handling for the gatekeeper API
//!
//! Every handler returns `AppError`, which maps onto a consistent HTTP
//! response. Policy denials get the structured `policy_violation` envelope;
//! everything else gets the flat `{code, message}` shape.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gatekeeper_shared::{ErrorEnvelope, PolicyError};
use serde::{Deserialize, Serialize};

/// Flat API error response used for everything except policy denials.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    /// ISO 8601 timestamp
    pub timestamp: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// A rule decided to deny the request. Rendered as the structured
/// `policy_violation` envelope with HTTP 403.
#[derive(Debug, Clone)]
pub struct PolicyViolation {
    pub rule_id: String,
    pub reason: String,
    pub message: String,
    pub remediation: String,
    pub docs_url: String,
    pub owners: Vec<String>,
    pub correlation_id: String,
}

impl PolicyViolation {
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: PolicyError {
                code: "policy_violation".to_string(),
                rule_id: self.rule_id.clone(),
                reason: self.reason.clone(),
                message: self.message.clone(),
                remediation: self.remediation.clone(),
                docs_url: self.docs_url.clone(),
                owners: self.owners.clone(),
                correlation_id: self.correlation_id.clone(),
            },
        }
    }
}

/// Application error type that can be converted to HTTP responses
#[derive(Debug)]
pub enum AppError {
    // Request errors
    BadRequest(String),
    Forbidden(String),
    NotFound(String),

    // Lifecycle errors
    Conflict(String),
    TooManyRequests { retry_after: u64 },

    // Rule outcomes
    PolicyViolation(Box<PolicyViolation>),

    // Server errors
    InternalError(String),
    DatabaseError(String),
    ExternalServiceError { service: String, message: String },
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::PolicyViolation(_) => StatusCode::FORBIDDEN,
            Self::InternalError(_) | Self::DatabaseError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ExternalServiceError { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::TooManyRequests { .. } => "TOO_MANY_REQUESTS",
            Self::PolicyViolation(_) => "POLICY_VIOLATION",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::DatabaseError(_) => "DATABASE_ERROR",
            Self::ExternalServiceError { .. } => "EXTERNAL_SERVICE_ERROR",
        }
    }

    /// Get the error message
    pub fn message(&self) -> String {
        match self {
            Self::BadRequest(msg) | Self::Forbidden(msg) | Self::Conflict(msg) => msg.clone(),
            Self::NotFound(resource) => format!("{} not found", resource),
            Self::TooManyRequests { retry_after } => {
                format!("Too many requests. Retry after {} seconds", retry_after)
            }
            Self::PolicyViolation(v) => v.message.clone(),
            Self::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            Self::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                "A database error occurred".to_string()
            }
            Self::ExternalServiceError { service, message } => {
                tracing::error!("External service error ({}): {}", service, message);
                format!("External service '{}' is unavailable", service)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Policy denials carry their own envelope shape.
        if let Self::PolicyViolation(v) = &self {
            return (status, Json(v.envelope())).into_response();
        }

        if let Self::TooManyRequests { retry_after } = &self {
            let error = ApiError::new(self.error_code(), self.message());
            return (
                status,
                [("Retry-After", retry_after.to_string())],
                Json(error),
            )
                .into_response();
        }

        let error = ApiError::new(self.error_code(), self.message());
        (status, Json(error)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("Resource".to_string()),
            _ => Self::DatabaseError(err.to_string()),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code(), self.message())
    }
}

impl std::error::Error for AppError {}

/// Result type alias for handlers
pub type ApiResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::Forbidden("nope".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::TooManyRequests { retry_after: 1800 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::Conflict("not approved".into()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_policy_violation_envelope() {
        let violation = PolicyViolation {
            rule_id: "mirror_class_limit".into(),
            reason: "mirror_class_limit".into(),
            message: "Mirroring secret-class resources is not permitted.".into(),
            remediation: "Request an exception.".into(),
            docs_url: String::new(),
            owners: vec!["secops".into()],
            correlation_id: "corr-1".into(),
        };
        let env = violation.envelope();
        assert_eq!(env.error.code, "policy_violation");
        assert_eq!(env.error.rule_id, "mirror_class_limit");
        assert_eq!(env.error.correlation_id, "corr-1");
    }

    #[test]
    fn test_row_not_found_maps_to_404() {
        let err: AppError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
