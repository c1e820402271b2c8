//! Transport error types.

use thiserror::Error;

/// A failure to complete an HTTP exchange.
///
/// Status codes are never errors at this layer; a `404` or `500` is a successful exchange whose
/// interpretation belongs to the caller.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// The request did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// The remote could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A header value could not be encoded.
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    /// Anything else the backend reported.
    #[error("http client error: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}
