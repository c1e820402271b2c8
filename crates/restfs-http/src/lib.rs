//! HTTP transport and wire format for restfs.
//!
//! The client side talks to a restfs server through [`RestClient`], which issues one request per
//! verb over any [`HttpClient`] backend. The [`wire`] module owns the header vocabulary, the
//! directory-listing format and the authorization token, and is shared with the server.

mod backends;
mod client;
pub mod error;
mod http_client;
pub mod wire;

#[cfg(feature = "reqwest-client")]
pub use backends::ReqwestClient;
pub use client::{ClientConfig, DEFAULT_TIMEOUT, RestClient};
pub use error::HttpClientError;
pub use http_client::{HttpClient, HttpRequest, HttpResponse};
