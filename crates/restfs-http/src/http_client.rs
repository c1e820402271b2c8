//! The seam between [`RestClient`](crate::RestClient) and whatever actually moves bytes.

use std::future::Future;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use crate::error::HttpClientError;

/// One outgoing exchange, fully resolved: absolute URL, final headers, owned body.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Verb.
    pub method: Method,
    /// Absolute URL, already percent-encoded.
    pub url: String,
    /// Headers sent as-is.
    pub headers: HeaderMap,
    /// Body, if the verb carries one.
    pub body: Option<Bytes>,
}

impl HttpRequest {
    /// A bodiless request with no headers.
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Add or replace one header.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach a body.
    #[must_use]
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

/// A completed exchange. Any status, including errors, lands here.
#[derive(Debug)]
pub struct HttpResponse {
    /// Status line.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Whole body, buffered. Empty for `HEAD`.
    pub body: Bytes,
}

impl HttpResponse {
    /// Whether the remote reported the entry as missing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status == StatusCode::NOT_FOUND
    }
}

/// Sends one [`HttpRequest`] and buffers the answer.
///
/// Backends implement this with a plain `async fn`; the returned future must be `Send` because the
/// FUSE adapter drives it from a multi-threaded runtime.
pub trait HttpClient: Send + Sync {
    /// Perform the exchange. Only transport failures are errors.
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, HttpClientError>> + Send;
}
