use http::StatusCode;
use thiserror::Error;

/// Gateway error taxonomy. Every failure a caller can observe maps onto one
/// of these kinds; the HTTP edge renders them as status + JSON body.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("No API mapped for service '{service}' path '{path}'")]
    NotFound { service: String, path: String },

    #[error("API '{0}' is disabled")]
    ApiDisabled(String),

    #[error("Missing or invalid credentials")]
    Auth,

    #[error("Bulkhead capacity exceeded for '{key}'")]
    CapacityExceeded { key: String, retry_after_ms: u64 },

    #[error("Circuit open for '{key}'")]
    CircuitOpen { key: String, retry_after_ms: u64 },

    #[error("Upstream call exceeded {0}ms deadline")]
    Timeout(u64),

    #[error("Upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status surfaced to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::ApiDisabled(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Auth => StatusCode::UNAUTHORIZED,
            GatewayError::CapacityExceeded { .. } | GatewayError::CircuitOpen { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            // Infrastructure failures shed the request, they do not expose
            // internals; persistence loss during async ingress lands here.
            GatewayError::Internal(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable code included in error bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::NotFound { .. } => "NOT_FOUND",
            GatewayError::ApiDisabled(_) => "API_DISABLED",
            GatewayError::Auth => "AUTH",
            GatewayError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            GatewayError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            GatewayError::Timeout(_) => "TIMEOUT",
            GatewayError::UpstreamFailure(_) => "UPSTREAM_FAILURE",
            GatewayError::BadRequest(_) => "BAD_REQUEST",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }

    /// Retry hint in seconds for load-shedding rejections.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::CapacityExceeded { retry_after_ms, .. }
            | GatewayError::CircuitOpen { retry_after_ms, .. } => {
                Some(retry_after_ms.div_ceil(1000).max(1))
            }
            _ => None,
        }
    }
}
