//! The client side of restfs: a locally cached view of a remote store.
/// Cache coherency evaluation.
pub mod coherency;
/// Adapter error taxonomy and errno mapping.
pub mod error;
/// Open file handles.
pub mod handle;
/// Inode number to path mapping.
pub mod bridge;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks onto [`remote::RemoteFs`].
pub mod fuser;
/// The filesystem operations, composed from coherency checks and remote transfers.
pub mod remote;

pub use coherency::{CacheVerdict, CoherencyEngine};
pub use error::FsError;
pub use handle::{LoopbackFile, OpenHandle, WriteBackFile};
pub use remote::RemoteFs;

use bitflags::bitflags;

/// Kernel inode number.
pub type InodeAddr = u64;

/// Kernel file handle, allocated per open.
pub type FileHandle = u64;

bitflags! {
    /// The `open(2)` bits the adapter acts on. Anything else the kernel passes is dropped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Read access. Zero, so only meaningful through [`OpenFlags::is_readable`].
        const RDONLY = libc::O_RDONLY;
        /// Write access.
        const WRONLY = libc::O_WRONLY;
        /// Read and write access.
        const RDWR = libc::O_RDWR;
        /// Every write lands at the end.
        const APPEND = libc::O_APPEND;
        /// Discard existing content; marks the handle for write-back.
        const TRUNC = libc::O_TRUNC;
        /// Create if missing.
        const CREAT = libc::O_CREAT;
        /// With `CREAT`, fail if the entry exists.
        const EXCL = libc::O_EXCL;
    }
}

impl OpenFlags {
    /// Whether the access mode permits writing.
    #[must_use]
    pub fn is_writable(self) -> bool {
        let accmode = self.bits() & libc::O_ACCMODE;
        accmode == libc::O_WRONLY || accmode == libc::O_RDWR
    }

    /// Whether the access mode permits reading.
    #[must_use]
    pub fn is_readable(self) -> bool {
        let accmode = self.bits() & libc::O_ACCMODE;
        accmode == libc::O_RDONLY || accmode == libc::O_RDWR
    }
}

/// Join a child name onto a slash-separated directory path.
#[must_use]
pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() || parent == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

/// The directory containing `path`. The root is its own parent.
#[must_use]
pub fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

/// Whether `path` names the root of the store.
#[must_use]
pub fn is_root(path: &str) -> bool {
    path.split('/').all(|c| c.is_empty() || c == ".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_parent() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a/", "b"), "/a/b");
        assert_eq!(parent_of("/a/b"), "/a");
        assert_eq!(parent_of("/a"), "/");
        assert_eq!(parent_of("/"), "/");
        assert!(is_root("/"));
        assert!(is_root(""));
        assert!(!is_root("/a"));
    }

    #[test]
    fn access_modes() {
        assert!(OpenFlags::RDONLY.is_readable());
        assert!(!OpenFlags::RDONLY.is_writable());
        assert!(OpenFlags::WRONLY.is_writable());
        assert!(!OpenFlags::WRONLY.is_readable());
        assert!((OpenFlags::RDWR | OpenFlags::APPEND).is_writable());
    }
}
