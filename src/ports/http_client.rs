use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive] // Signal that more variants may be added in the future
pub enum HttpClientError {
    /// Error when the connection fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0:?}")]
    TimeoutError(Duration),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequestError(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Status and body of a small plaintext response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: u16,
    pub body: String,
}

/// Type alias for async fetch responses
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = HttpClientResult<FetchedResponse>> + Send + 'a>>;

/// HttpClient defines the port (interface) for probing the proxy over plain HTTP
pub trait HttpClient: Send + Sync + 'static {
    /// Issue a GET request and read the whole body
    ///
    /// # Arguments
    /// * `url` - The URL to fetch
    /// * `timeout` - Upper bound for the whole exchange
    fn fetch<'a>(&'a self, url: &'a str, timeout: Duration) -> FetchFuture<'a>;
}
