use std::io;

use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use restfs_http::wire::WireError;
use thiserror::Error;

/// A failed request, already classified by the status it answers with.
#[derive(Debug, Error)]
pub enum ServerError {
    /// 404.
    #[error("{0} not found")]
    NotFound(String),

    /// 403: unknown user, missing credentials, or a path outside the user's store.
    #[error("{0} access forbidden")]
    Forbidden(String),

    /// 409: exclusive create on an existing path, or removing a non-empty directory.
    #[error("{0} already exists or is not empty")]
    Conflict(String),

    /// 400.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// 405.
    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),

    /// 501: entries that are neither files nor directories.
    #[error("{0} is not a file or directory")]
    NotImplemented(String),

    /// 500.
    #[error("internal error on {path}: {source}")]
    Internal {
        /// The request path.
        path: String,
        /// What failed.
        #[source]
        source: io::Error,
    },
}

impl ServerError {
    /// Classify a storage failure on `path`.
    pub fn from_io(path: &str, e: io::Error) -> Self {
        if e.raw_os_error() == Some(libc::ENOTEMPTY) {
            return Self::Conflict(path.to_owned());
        }
        match e.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_owned()),
            io::ErrorKind::PermissionDenied => Self::Forbidden(path.to_owned()),
            io::ErrorKind::AlreadyExists | io::ErrorKind::DirectoryNotEmpty => {
                Self::Conflict(path.to_owned())
            }
            io::ErrorKind::InvalidInput
            | io::ErrorKind::IsADirectory
            | io::ErrorKind::NotADirectory => Self::BadRequest(format!("{path}: {e}")),
            _ => Self::Internal {
                path: path.to_owned(),
                source: e,
            },
        }
    }

    /// The status this error answers with.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<WireError> for ServerError {
    fn from(e: WireError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::error!(%status, error = %self, "request failed");
        (status, self.to_string()).into_response()
    }
}
