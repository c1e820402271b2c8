//! [`HttpClient`] over an async `reqwest` connection pool.

use std::time::Duration;

use crate::error::HttpClientError;
use crate::http_client::{HttpClient, HttpRequest, HttpResponse};
use crate::wire;

/// Pooled async backend. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    /// A backend whose every request, body included, must finish within `timeout`.
    ///
    /// Redirects are not followed. Fails if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration) -> Result<Self, HttpClientError> {
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(wire::USER_AGENT)
            .build()
            .map_err(|e| HttpClientError::Other(Box::new(e)))?;
        Ok(Self { inner })
    }

    /// Wrap a client configured elsewhere.
    #[must_use]
    pub fn from_client(inner: reqwest::Client) -> Self {
        Self { inner }
    }
}

impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpClientError> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let builder = self.inner.request(method, url).headers(headers);
        let builder = match body {
            Some(body) => builder.body(body),
            None => builder,
        };

        let response = builder.send().await.map_err(classify)?;
        let status = response.status();
        let headers = response.headers().clone();
        // The timeout covers the body too, so a stalled transfer surfaces here.
        let body = response.bytes().await.map_err(classify)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(err: reqwest::Error) -> HttpClientError {
    if err.is_timeout() {
        HttpClientError::Timeout
    } else if err.is_connect() {
        HttpClientError::Connection(err.to_string())
    } else {
        HttpClientError::Other(Box::new(err))
    }
}
