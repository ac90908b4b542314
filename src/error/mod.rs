use crate::proxy::GATEWAY_HEADER;
use crate::rate_limit::headers::{RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING};
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error types
///
/// The `Display` text of request-time variants is the message shown to the
/// caller; internal detail is carried in the variant fields and only logged.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Route not found")]
    RouteNotFound { method: String, path: String },

    #[error("Failed to resolve route")]
    RouteLookupFailed(String),

    #[error("API key is required in Authorization header")]
    ApiKeyMissing,

    #[error("Invalid authorization header format")]
    InvalidAuthorizationHeader,

    #[error("{0}")]
    InvalidApiKey(String),

    #[error("Authentication required")]
    SessionRequired { login_url: String },

    #[error("Insufficient permissions")]
    InsufficientScope { missing: Vec<String> },

    #[error("Authentication service unavailable")]
    AuthUnavailable(String),

    #[error("Too many requests")]
    RateLimitExceeded { limit: u32, retry_after: u64 },

    #[error("Invalid service configuration")]
    InvalidTargetConfiguration(String),

    #[error("Service unavailable")]
    UpstreamUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::RouteLookupFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ApiKeyMissing => StatusCode::UNAUTHORIZED,
            GatewayError::InvalidAuthorizationHeader => StatusCode::UNAUTHORIZED,
            GatewayError::InvalidApiKey(_) => StatusCode::UNAUTHORIZED,
            GatewayError::SessionRequired { .. } => StatusCode::TEMPORARY_REDIRECT,
            GatewayError::InsufficientScope { .. } => StatusCode::FORBIDDEN,
            GatewayError::AuthUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::InvalidTargetConfiguration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to the caller
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Config(_) | GatewayError::Internal(_) | GatewayError::Io(_) => {
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Short label used for metrics and audit records
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config",
            GatewayError::RouteNotFound { .. } => "route_not_found",
            GatewayError::RouteLookupFailed(_) => "route_lookup_failed",
            GatewayError::ApiKeyMissing => "api_key_missing",
            GatewayError::InvalidAuthorizationHeader => "invalid_authorization_header",
            GatewayError::InvalidApiKey(_) => "invalid_api_key",
            GatewayError::SessionRequired { .. } => "session_required",
            GatewayError::InsufficientScope { .. } => "insufficient_scope",
            GatewayError::AuthUnavailable(_) => "auth_unavailable",
            GatewayError::RateLimitExceeded { .. } => "rate_limited",
            GatewayError::InvalidTargetConfiguration(_) => "invalid_target",
            GatewayError::UpstreamUnavailable(_) => "upstream_unavailable",
            GatewayError::Internal(_) => "internal",
            GatewayError::Io(_) => "io",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let mut response = match &self {
            GatewayError::SessionRequired { login_url } => {
                Redirect::temporary(login_url).into_response()
            }
            _ => (status, Json(json!({ "error": self.public_message() }))).into_response(),
        };

        let headers = response.headers_mut();
        headers.insert(GATEWAY_HEADER, HeaderValue::from_static("true"));

        if let GatewayError::RateLimitExceeded { limit, retry_after } = self {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit));
            headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from_static("0"));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::RouteNotFound {
                method: "GET".to_string(),
                path: "/missing".to_string()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::RouteLookupFailed("db down".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::InsufficientScope { missing: vec![] }.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::UpstreamUnavailable("timeout".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_public_message_hides_internal_detail() {
        let err = GatewayError::Internal("pool exhausted".to_string());
        assert_eq!(err.public_message(), "Internal server error");

        let err = GatewayError::UpstreamUnavailable("connect refused".to_string());
        assert_eq!(err.public_message(), "Service unavailable");

        let err = GatewayError::InvalidApiKey("API key has expired".to_string());
        assert_eq!(err.public_message(), "API key has expired");
    }

    #[test]
    fn test_rate_limit_response_headers() {
        let response = GatewayError::RateLimitExceeded {
            limit: 10,
            retry_after: 60,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
        assert_eq!(response.headers()[RATE_LIMIT_LIMIT], "10");
        assert_eq!(response.headers()[RATE_LIMIT_REMAINING], "0");
        assert_eq!(response.headers()[GATEWAY_HEADER], "true");
    }

    #[test]
    fn test_session_required_redirects() {
        let response = GatewayError::SessionRequired {
            login_url: "/auth/signin?callbackUrl=%2Fapi%2Fme".to_string(),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers()[header::LOCATION],
            "/auth/signin?callbackUrl=%2Fapi%2Fme"
        );
    }
}
