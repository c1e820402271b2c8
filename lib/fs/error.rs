//! Errors surfaced by filesystem operations.

use http::StatusCode;
use restfs_http::HttpClientError;
use restfs_http::wire::WireError;
use thiserror::Error;

/// Failure of one filesystem operation.
///
/// Lower-layer errors are wrapped rather than flattened, so not-found, permission and I/O failures
/// stay distinguishable all the way to the errno handed to the kernel.
#[derive(Debug, Error)]
pub enum FsError {
    /// The entry does not exist remotely.
    #[error("{0} not found")]
    NotFound(String),

    /// The remote answered with a status other than success or not-found.
    #[error("remote answered {status} for {path}")]
    Protocol {
        /// The path of the request.
        path: String,
        /// The unexpected status.
        status: StatusCode,
    },

    /// The remote could not be reached.
    #[error("transport error: {0}")]
    Transport(#[from] HttpClientError),

    /// The remote's headers or listing could not be decoded.
    #[error("malformed response: {0}")]
    Wire(#[from] WireError),

    /// The local cache failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A freshly fetched copy still did not evaluate as current.
    #[error("{0} was fetched but the cache still disagrees with the remote")]
    NotConverged(String),

    /// A file operation was attempted on a directory.
    #[error("{0} is a directory")]
    IsDirectory(String),

    /// A directory operation was attempted on a file.
    #[error("{0} is not a directory")]
    NotADirectory(String),

    /// Directories cannot be renamed in place.
    #[error("cannot rename directory {0}")]
    DirectoryRename(String),

    /// The handle was already released.
    #[error("file handle not open")]
    BadHandle,
}

impl FsError {
    /// Whether this is a not-found condition, from either side.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Convert an I/O error to the corresponding errno value.
pub fn io_to_errno(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or_else(|| match e.kind() {
        std::io::ErrorKind::NotFound => libc::ENOENT,
        std::io::ErrorKind::PermissionDenied => libc::EACCES,
        std::io::ErrorKind::AlreadyExists => libc::EEXIST,
        std::io::ErrorKind::InvalidInput => libc::EINVAL,
        _ => libc::EIO,
    })
}

impl From<&FsError> for i32 {
    fn from(e: &FsError) -> Self {
        match e {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::Protocol { status, .. } => match *status {
                StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => libc::EACCES,
                StatusCode::CONFLICT => libc::EEXIST,
                StatusCode::BAD_REQUEST => libc::EINVAL,
                StatusCode::NOT_IMPLEMENTED | StatusCode::METHOD_NOT_ALLOWED => libc::ENOSYS,
                _ => libc::EAGAIN,
            },
            FsError::Transport(HttpClientError::Timeout) => libc::ETIMEDOUT,
            FsError::Transport(HttpClientError::Connection(_)) => libc::EHOSTUNREACH,
            FsError::Transport(_) | FsError::Wire(_) | FsError::NotConverged(_) => libc::EIO,
            FsError::Io(io_err) => io_to_errno(io_err),
            FsError::IsDirectory(_) => libc::EISDIR,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::DirectoryRename(_) => libc::EXDEV,
            FsError::BadHandle => libc::EBADF,
        }
    }
}

impl From<FsError> for i32 {
    fn from(e: FsError) -> Self {
        Self::from(&e)
    }
}
