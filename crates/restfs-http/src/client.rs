//! Verb-level access to a restfs server.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, header};
use tracing::{debug, instrument};

use crate::error::HttpClientError;
use crate::http_client::{HttpClient, HttpRequest, HttpResponse};
use crate::wire::{self, WriteAttrs};

/// Per-request timeout used unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a [`RestClient`] needs to reach one server as one user.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host[:port]`, optionally prefixed with a scheme. Plain hosts are reached over `http`.
    pub host: String,
    /// The user whose sandbox is addressed.
    pub username: String,
    /// Bound on every request.
    pub timeout: Duration,
}

impl ClientConfig {
    /// Configuration with the default timeout.
    #[must_use]
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.contains("://") {
            host.to_owned()
        } else {
            format!("http://{host}")
        }
    }
}

/// A handle on one remote store.
///
/// Immutable after construction; share it by reference across every operation of a mount. Each
/// method performs exactly one exchange and returns the raw response. Interpreting the status is
/// the caller's job.
#[derive(Debug)]
pub struct RestClient<C: HttpClient> {
    http: C,
    base_url: String,
    authorization: HeaderValue,
}

#[cfg(feature = "reqwest-client")]
impl RestClient<crate::backends::ReqwestClient> {
    /// Build a client over the default `reqwest` backend.
    pub fn new(config: &ClientConfig) -> Result<Self, HttpClientError> {
        Self::with_http_client(config, crate::backends::ReqwestClient::new(config.timeout)?)
    }
}

impl<C: HttpClient> RestClient<C> {
    /// Build a client over an arbitrary backend.
    pub fn with_http_client(config: &ClientConfig, http: C) -> Result<Self, HttpClientError> {
        let mut authorization =
            HeaderValue::from_str(&wire::encode_authorization(&config.username))?;
        authorization.set_sensitive(true);
        Ok(Self {
            http,
            base_url: config.base_url(),
            authorization,
        })
    }

    /// The URL `path` resolves to. Segments are percent-encoded; a trailing slash survives.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        let mut url = self.base_url.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            url.push('/');
            url.push_str(&urlencoding::encode(segment));
        }
        if path.ends_with('/') || !url[self.base_url.len()..].starts_with('/') {
            url.push('/');
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<HttpResponse, HttpClientError> {
        let mut request = HttpRequest::new(method, self.url(path));
        request.headers = headers;
        request = request.header(header::AUTHORIZATION, self.authorization.clone());
        if let Some(body) = body {
            request = request.body(body);
        }
        debug!(method = %request.method, url = %request.url, "sending request");
        let response = self.http.send(request).await?;
        debug!(status = %response.status, "received response");
        Ok(response)
    }

    /// Metadata only.
    #[instrument(name = "RestClient::head", skip(self))]
    pub async fn head(&self, path: &str) -> Result<HttpResponse, HttpClientError> {
        self.send(Method::HEAD, path, HeaderMap::new(), None).await
    }

    /// Metadata plus the file body or directory listing.
    #[instrument(name = "RestClient::get", skip(self))]
    pub async fn get(&self, path: &str) -> Result<HttpResponse, HttpClientError> {
        self.send(Method::GET, path, HeaderMap::new(), None).await
    }

    /// Overwrite `path` with `body`, stamping the given mode and times.
    #[instrument(name = "RestClient::put", skip(self, body), fields(len = body.len()))]
    pub async fn put(
        &self,
        path: &str,
        attrs: &WriteAttrs,
        body: Bytes,
    ) -> Result<HttpResponse, HttpClientError> {
        let mut headers = HeaderMap::new();
        attrs.write_headers(&mut headers);
        self.send(Method::PUT, path, headers, Some(body)).await
    }

    /// Exclusive create. With `is_dir`, creates a directory instead of an empty file.
    #[instrument(name = "RestClient::post", skip(self))]
    pub async fn post(
        &self,
        path: &str,
        mode: u32,
        is_dir: bool,
    ) -> Result<HttpResponse, HttpClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(wire::FILE_MODE, wire::mode_header_value(mode));
        let path = if is_dir && !path.ends_with('/') {
            format!("{path}/")
        } else {
            path.to_owned()
        };
        self.send(Method::POST, &path, headers, None).await
    }

    /// Remove a file or an empty directory.
    #[instrument(name = "RestClient::delete", skip(self))]
    pub async fn delete(&self, path: &str) -> Result<HttpResponse, HttpClientError> {
        self.send(Method::DELETE, path, HeaderMap::new(), None).await
    }
}
