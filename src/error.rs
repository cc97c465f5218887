/// Unified error types for the Tollgate entitlement engine
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Store errors (transient, retryable by the caller)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Store operation exceeded its deadline; the transaction was rolled back
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// Structurally invalid input, rejected before touching the store
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Account, key or plan absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Key bound elsewhere, account already holding a key, plan not sellable
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Key past expiry or nonexistent
    #[error("Activation key is invalid or expired")]
    ExpiredOrInvalid,

    /// One or more access conditions failed
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// The used/bound invariant was observed violated
    #[error("State corruption: {0}")]
    StateCorruption(String),

    /// Missing or unknown credential
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Credential valid but lacking privilege
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Request or configuration validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Rate limiting errors
    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: Duration },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the caller may retry the same operation with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Database(_) | EngineError::Timeout(_))
    }
}

/// JSON error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert EngineError to HTTP response
impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            EngineError::MalformedInput(_) | EngineError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                "InvalidRequest",
                self.to_string(),
            ),
            EngineError::Authentication(_) => (
                StatusCode::UNAUTHORIZED,
                "AuthenticationRequired",
                self.to_string(),
            ),
            EngineError::AccessDenied(_) => (
                StatusCode::FORBIDDEN,
                "AccessDenied",
                self.to_string(),
            ),
            EngineError::Authorization(_) => (
                StatusCode::FORBIDDEN,
                "Forbidden",
                self.to_string(),
            ),
            EngineError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                "NotFound",
                self.to_string(),
            ),
            EngineError::Conflict(_) => (
                StatusCode::CONFLICT,
                "Conflict",
                self.to_string(),
            ),
            EngineError::ExpiredOrInvalid => (
                StatusCode::GONE,
                "InvalidOrExpiredKey",
                self.to_string(),
            ),
            EngineError::RateLimitExceeded { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RateLimitExceeded",
                "Rate limit exceeded".to_string(),
            ),
            EngineError::Database(_) | EngineError::Timeout(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "StoreUnavailable",
                "Store temporarily unavailable".to_string(), // Don't leak details
            ),
            EngineError::StateCorruption(_) | EngineError::Internal(_) | EngineError::Io(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                "Internal server error".to_string(),
            ),
        };

        let mut response = (
            status,
            Json(ErrorResponse {
                error: error_code.to_string(),
                message,
            }),
        )
            .into_response();

        if let EngineError::RateLimitExceeded { retry_after } = self {
            if let Ok(value) = retry_after.as_secs().max(1).to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_retryable() {
        assert!(EngineError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(EngineError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!EngineError::ExpiredOrInvalid.is_retryable());
        assert!(!EngineError::StateCorruption("key 1".to_string()).is_retryable());
    }

    #[test]
    fn test_status_codes() {
        let cases = [
            (EngineError::MalformedInput("x".into()), StatusCode::BAD_REQUEST),
            (EngineError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (EngineError::Conflict("x".into()), StatusCode::CONFLICT),
            (EngineError::ExpiredOrInvalid, StatusCode::GONE),
            (EngineError::AccessDenied("quota exhausted".into()), StatusCode::FORBIDDEN),
            (EngineError::Timeout(Duration::from_secs(1)), StatusCode::SERVICE_UNAVAILABLE),
            (EngineError::StateCorruption("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
