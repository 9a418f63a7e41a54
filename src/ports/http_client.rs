use async_trait::async_trait;
use http::{Request, Response};
use hyper::body::Bytes;
use thiserror::Error;

/// Custom error type for upstream client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpstreamClientError {
    /// Connection to the upstream endpoint failed
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The upstream answered with a server error after any retries
    #[error("Upstream returned status {status}")]
    ServerError { status: u16 },

    /// The request could not be constructed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl UpstreamClientError {
    /// Transient failures worth retrying for idempotent methods.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamClientError::ConnectionError(_) | UpstreamClientError::ServerError { .. }
        )
    }
}

/// Result type alias for upstream client operations
pub type UpstreamClientResult<T> = Result<T, UpstreamClientError>;

/// UpstreamClient defines the port (interface) for issuing HTTP requests to
/// resolved upstream endpoints. Responses are fully buffered; the gateway
/// persists and relays them as byte payloads.
#[async_trait]
pub trait UpstreamClient: Send + Sync + 'static {
    /// Send a request to the upstream and buffer the response.
    ///
    /// Implementations must not retry internally; retry policy lives in the
    /// execution engine where it can honor the bulkhead budget.
    async fn execute(&self, req: Request<Bytes>) -> UpstreamClientResult<Response<Bytes>>;
}
