//! Shared error type for gatehouse
//!
//! Every component reports failures through [`GatewayError`]. The HTTP layer
//! maps each kind to a status code and a stable machine-readable name.

use hyper::StatusCode;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error type for registry and gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed instance data on register
    #[error("Registration error: {0}")]
    Registration(String),

    /// Renew/status/lookup on an unknown instance
    #[error("Not found: {0}")]
    NotFound(String),

    /// No route matched the inbound request
    #[error("No route for {0}")]
    NoRoute(String),

    /// Route matched but the target service has no UP instance
    #[error("No instance available for service '{0}'")]
    NoInstanceAvailable(String),

    /// Every candidate instance has an open circuit
    #[error("Circuit open for all instances of '{0}'")]
    CircuitOpen(String),

    /// Upstream failed after the retry budget was spent
    #[error("Bad gateway: {0}")]
    BadGateway(String),

    /// Lease sweep skipped by self-preservation
    #[error("Registry in degraded mode: {0}")]
    DegradedMode(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status surfaced to callers for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Registration(_) | GatewayError::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::NotFound(_) | GatewayError::NoRoute(_) => StatusCode::NOT_FOUND,
            GatewayError::NoInstanceAvailable(_)
            | GatewayError::CircuitOpen(_)
            | GatewayError::DegradedMode(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BadGateway(_) | GatewayError::Http(_) => StatusCode::BAD_GATEWAY,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Config(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable error name used in JSON error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Registration(_) => "RegistrationError",
            GatewayError::NotFound(_) => "NotFoundError",
            GatewayError::NoRoute(_) => "NoRouteError",
            GatewayError::NoInstanceAvailable(_) => "NoInstanceAvailableError",
            GatewayError::CircuitOpen(_) => "CircuitOpenError",
            GatewayError::BadGateway(_) => "BadGatewayError",
            GatewayError::DegradedMode(_) => "DegradedModeError",
            GatewayError::PayloadTooLarge(_) => "PayloadTooLargeError",
            GatewayError::Timeout(_) => "TimeoutError",
            GatewayError::Http(_) => "HttpError",
            GatewayError::Config(_) => "ConfigError",
            GatewayError::Serialization(_) => "SerializationError",
            GatewayError::Internal(_) => "InternalError",
        }
    }

    /// Whether a discovery client should retry the call that produced this
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Http(_) | GatewayError::Timeout(_) | GatewayError::Internal(_)
        )
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(err.to_string())
        } else {
            GatewayError::Http(err.to_string())
        }
    }
}

impl From<hyper::Error> for GatewayError {
    fn from(err: hyper::Error) -> Self {
        GatewayError::Http(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        GatewayError::Timeout(err.to_string())
    }
}
