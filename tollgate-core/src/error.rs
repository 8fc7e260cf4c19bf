//! Gateway error taxonomy and the standardized client-facing error body.
//!
//! Every rejection the gateway originates itself (as opposed to a backend
//! response relayed verbatim) is a [`GatewayError`]. Each error carries a
//! machine-readable [`ErrorCode`] which fixes its HTTP status, its category
//! and the level it is logged at.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::Level;

/// Broad classes of failure, used for log levels and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed request, bad body, unknown route.
    Client,
    /// Missing/invalid credentials, insufficient role, blocked address.
    Auth,
    /// Rate limiter or circuit breaker rejections.
    TrafficShaping,
    /// Backend unreachable or timed out.
    Backend,
    /// Bugs and unexpected failures inside the gateway.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Client => write!(f, "client"),
            ErrorCategory::Auth => write!(f, "auth"),
            ErrorCategory::TrafficShaping => write!(f, "traffic_shaping"),
            ErrorCategory::Backend => write!(f, "backend"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

/// Machine-readable error codes emitted by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidToken,
    AuthenticationRequired,
    InsufficientPermissions,
    IpBlocked,
    RateLimitExceeded,
    ServiceUnavailable,
    NotFound,
    InvalidJsonBody,
    PayloadTooLarge,
    BadRequest,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidToken => "invalid-token",
            ErrorCode::AuthenticationRequired => "authentication-required",
            ErrorCode::InsufficientPermissions => "insufficient-permissions",
            ErrorCode::IpBlocked => "ip-blocked",
            ErrorCode::RateLimitExceeded => "rate-limit-exceeded",
            ErrorCode::ServiceUnavailable => "service-unavailable",
            ErrorCode::NotFound => "not-found",
            ErrorCode::InvalidJsonBody => "invalid-json-body",
            ErrorCode::PayloadTooLarge => "payload-too-large",
            ErrorCode::BadRequest => "bad-request",
            ErrorCode::InternalError => "internal-error",
        }
    }

    /// HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::InvalidToken | ErrorCode::AuthenticationRequired => 401,
            ErrorCode::InsufficientPermissions | ErrorCode::IpBlocked => 403,
            ErrorCode::RateLimitExceeded => 429,
            ErrorCode::ServiceUnavailable => 503,
            ErrorCode::NotFound => 404,
            ErrorCode::InvalidJsonBody | ErrorCode::BadRequest => 400,
            ErrorCode::PayloadTooLarge => 413,
            ErrorCode::InternalError => 500,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorCode::InvalidToken
            | ErrorCode::AuthenticationRequired
            | ErrorCode::InsufficientPermissions
            | ErrorCode::IpBlocked => ErrorCategory::Auth,
            ErrorCode::RateLimitExceeded => ErrorCategory::TrafficShaping,
            ErrorCode::ServiceUnavailable => ErrorCategory::Backend,
            ErrorCode::NotFound
            | ErrorCode::InvalidJsonBody
            | ErrorCode::PayloadTooLarge
            | ErrorCode::BadRequest => ErrorCategory::Client,
            ErrorCode::InternalError => ErrorCategory::Internal,
        }
    }

    /// Default human-readable message.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::InvalidToken => "Invalid or expired token",
            ErrorCode::AuthenticationRequired => "Authentication required",
            ErrorCode::InsufficientPermissions => "Insufficient permissions",
            ErrorCode::IpBlocked => "Too many failed login attempts, try again later",
            ErrorCode::RateLimitExceeded => "Rate limit exceeded, slow down",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
            ErrorCode::NotFound => "Resource not found",
            ErrorCode::InvalidJsonBody => "Request body is not valid JSON",
            ErrorCode::PayloadTooLarge => "Request body too large",
            ErrorCode::BadRequest => "Bad request",
            ErrorCode::InternalError => "Internal server error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejection produced by the gateway itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{}] {}: {}{}", .code.category(), .code, .message, context_suffix(.context))]
pub struct GatewayError {
    pub code: ErrorCode,
    /// Message shown to the client.
    pub message: String,
    /// Seconds after which a retry may succeed (`Retry-After`).
    pub retry_after: Option<u64>,
    /// Extra key/value pairs for logs only, never sent to the client.
    pub context: Vec<(String, String)>,
}

impl GatewayError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
            retry_after: None,
            context: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.push((key.into(), value.into()));
        self
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Whether the client may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::RateLimitExceeded | ErrorCode::ServiceUnavailable | ErrorCode::IpBlocked
        )
    }

    /// Level this error is logged at.
    pub fn log_level(&self) -> Level {
        match self.code {
            ErrorCode::ServiceUnavailable | ErrorCode::InternalError => Level::ERROR,
            ErrorCode::RateLimitExceeded => Level::INFO,
            _ => match self.category() {
                ErrorCategory::Auth => Level::WARN,
                _ => Level::INFO,
            },
        }
    }

    /// Build the JSON body sent to the client.
    pub fn body_at(&self, now: DateTime<Utc>) -> ErrorBody {
        ErrorBody {
            error: self.code.as_str().to_string(),
            message: self.message.clone(),
            code: self.code.as_str().to_string(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn body(&self) -> ErrorBody {
        self.body_at(Utc::now())
    }

    pub fn invalid_token() -> Self {
        Self::new(ErrorCode::InvalidToken)
    }

    pub fn authentication_required() -> Self {
        Self::new(ErrorCode::AuthenticationRequired)
    }

    pub fn insufficient_permissions() -> Self {
        Self::new(ErrorCode::InsufficientPermissions)
    }

    pub fn ip_blocked() -> Self {
        Self::new(ErrorCode::IpBlocked)
    }

    pub fn rate_limited(retry_after: u64) -> Self {
        Self::new(ErrorCode::RateLimitExceeded).with_retry_after(retry_after)
    }

    pub fn service_unavailable() -> Self {
        Self::new(ErrorCode::ServiceUnavailable)
    }

    pub fn not_found() -> Self {
        Self::new(ErrorCode::NotFound)
    }

    pub fn invalid_json_body() -> Self {
        Self::new(ErrorCode::InvalidJsonBody)
    }

    pub fn payload_too_large() -> Self {
        Self::new(ErrorCode::PayloadTooLarge)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest).with_message(message)
    }

    pub fn internal() -> Self {
        Self::new(ErrorCode::InternalError)
    }
}

/// ` (k=v, k=v)` for log lines, empty without context.
fn context_suffix(context: &[(String, String)]) -> String {
    if context.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = context.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!(" ({})", pairs.join(", "))
}

impl From<ErrorCode> for GatewayError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

/// Standardized error body.
///
/// `code` duplicates `error` for clients written against older responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub code: String,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_error_display() {
        let err = GatewayError::ip_blocked()
            .with_context("ip", "1.2.3.4")
            .with_context("failures", "5");

        let display = err.to_string();
        assert!(display.contains("[auth]"));
        assert!(display.contains("ip-blocked"));
        assert!(display.contains("ip=1.2.3.4"));
        assert!(display.contains("failures=5"));
        assert_eq!(
            display,
            "[auth] ip-blocked: Too many failed login attempts, try again later (ip=1.2.3.4, failures=5)"
        );

        assert_eq!(
            GatewayError::not_found().to_string(),
            "[client] not-found: Resource not found"
        );
        let boxed: Box<dyn std::error::Error> = Box::new(GatewayError::internal());
        assert!(boxed.to_string().starts_with("[internal]"));
    }

    #[test]
    fn test_http_status() {
        assert_eq!(GatewayError::invalid_token().http_status(), 401);
        assert_eq!(GatewayError::authentication_required().http_status(), 401);
        assert_eq!(GatewayError::insufficient_permissions().http_status(), 403);
        assert_eq!(GatewayError::ip_blocked().http_status(), 403);
        assert_eq!(GatewayError::rate_limited(5).http_status(), 429);
        assert_eq!(GatewayError::service_unavailable().http_status(), 503);
        assert_eq!(GatewayError::not_found().http_status(), 404);
        assert_eq!(GatewayError::invalid_json_body().http_status(), 400);
        assert_eq!(GatewayError::payload_too_large().http_status(), 413);
        assert_eq!(GatewayError::internal().http_status(), 500);
    }

    #[test]
    fn test_error_retryable() {
        assert!(GatewayError::rate_limited(1).is_retryable());
        assert!(GatewayError::service_unavailable().is_retryable());
        assert!(!GatewayError::invalid_token().is_retryable());
        assert!(!GatewayError::not_found().is_retryable());
    }

    #[test]
    fn test_log_levels_follow_taxonomy() {
        assert_eq!(GatewayError::invalid_token().log_level(), Level::WARN);
        assert_eq!(GatewayError::ip_blocked().log_level(), Level::WARN);
        assert_eq!(GatewayError::not_found().log_level(), Level::INFO);
        assert_eq!(GatewayError::rate_limited(1).log_level(), Level::INFO);
        assert_eq!(GatewayError::service_unavailable().log_level(), Level::ERROR);
        assert_eq!(GatewayError::internal().log_level(), Level::ERROR);
    }

    #[test]
    fn test_body_shape() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let body = GatewayError::rate_limited(30).body_at(now);

        assert_eq!(body.error, "rate-limit-exceeded");
        assert_eq!(body.code, body.error);
        assert_eq!(body.timestamp, "2024-05-01T12:00:00.000Z");

        let json = serde_json::to_value(&body).unwrap();
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys.len(), 4);
        for key in ["error", "message", "code", "timestamp"] {
            assert!(keys.contains(&key), "missing {key}");
        }
    }

    #[test]
    fn test_context_is_not_in_body() {
        let err = GatewayError::internal().with_context("panic", "index out of bounds");
        let body = err.body();
        assert!(!body.message.contains("index out of bounds"));
    }
}
