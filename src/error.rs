use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),

    #[error("Circuit breaker open for {0}")]
    BreakerOpen(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("No healthy backend available")]
    NoHealthyBackend,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BreakerOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NoHealthyBackend => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::StoreUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Json(_) => StatusCode::BAD_REQUEST,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "BAD_REQUEST",
            GatewayError::Unauthorized(_) => "UNAUTHORIZED",
            GatewayError::Forbidden(_) => "FORBIDDEN",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::RateLimited => "RATE_LIMITED",
            GatewayError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            GatewayError::GatewayTimeout(_) => "GATEWAY_TIMEOUT",
            GatewayError::BreakerOpen(_) => "CIRCUIT_BREAKER_OPEN",
            GatewayError::Upstream(_) => "UPSTREAM_ERROR",
            GatewayError::NoHealthyBackend => "NO_HEALTHY_BACKEND",
            GatewayError::Conflict(_) => "CONFLICT",
            GatewayError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            GatewayError::Database(_) => "DATABASE_ERROR",
            GatewayError::Json(_) => "JSON_ERROR",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Translate a store-level failure into the error surfaced by CRUD
    /// handlers. Transport problems stay 500s without leaking pool details.
    pub fn from_store(err: sqlx::Error, entity: &str) -> Self {
        match err {
            sqlx::Error::RowNotFound => GatewayError::NotFound(format!("{} not found", entity)),
            sqlx::Error::Database(ref db_err) if db_err.code().as_deref() == Some("23505") => {
                GatewayError::Conflict(format!("{} already exists", entity))
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                GatewayError::StoreUnavailable(err.to_string())
            }
            other => GatewayError::Database(other),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        let body = Json(json!({
            "success": false,
            "error": message,
            "code": error_code,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_kinds() {
        assert_eq!(
            GatewayError::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::BreakerOpen("http://b".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::GatewayTimeout("30s".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::Conflict("route".into()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn store_errors_are_translated() {
        let err = GatewayError::from_store(sqlx::Error::RowNotFound, "route");
        assert!(matches!(err, GatewayError::NotFound(_)));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = GatewayError::from_store(sqlx::Error::PoolTimedOut, "route");
        assert!(matches!(err, GatewayError::StoreUnavailable(_)));
    }
}
