//! Storage rooted at a private directory.
//!
//! Every path handed to a [`Store`] is a slash-separated string relative to the store's root.
//! Paths are normalized lexically before they touch the host filesystem, and any path whose `..`
//! components would climb above the root is refused with [`std::io::ErrorKind::PermissionDenied`].

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use filetime::FileTime;
use tracing::{debug, instrument};

fn escape_error(path: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("path {path:?} escapes the sandbox"),
    )
}

/// Lexically normalize `path` into a root-relative path.
///
/// `""`, `"/"` and `"."` all denote the root and normalize to an empty path.
pub fn normalize(path: &str) -> io::Result<PathBuf> {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(escape_error(path));
                }
            }
            other => parts.push(other),
        }
    }
    Ok(parts.into_iter().collect())
}

/// Convert whole Unix seconds to a [`FileTime`]. Negative values clamp to the epoch.
#[must_use]
pub fn file_time(secs: i64) -> FileTime {
    FileTime::from_unix_time(secs.max(0), 0)
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> io::Result<T> + Send + 'static,
) -> io::Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

/// A directory tree that cannot be escaped through the paths given to it.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// A store rooted at `root`. The directory is not created.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The host directory backing this store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The host path for `path`.
    pub fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        Ok(self.root.join(normalize(path)?))
    }

    /// Open with explicit options.
    pub async fn open_file(
        &self,
        path: &str,
        options: &tokio::fs::OpenOptions,
    ) -> io::Result<tokio::fs::File> {
        options.open(self.resolve(path)?).await
    }

    /// Metadata, following symlinks.
    pub async fn stat(&self, path: &str) -> io::Result<std::fs::Metadata> {
        tokio::fs::metadata(self.resolve(path)?).await
    }

    /// Create one directory.
    pub async fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        tokio::fs::DirBuilder::new()
            .mode(mode)
            .create(self.resolve(path)?)
            .await
    }

    /// Create a directory and any missing parents.
    pub async fn mkdir_all(&self, path: &str, mode: u32) -> io::Result<()> {
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(self.resolve(path)?)
            .await
    }

    /// Remove a file or an empty directory.
    pub async fn remove(&self, path: &str) -> io::Result<()> {
        let full = self.resolve(path)?;
        if tokio::fs::symlink_metadata(&full).await?.is_dir() {
            tokio::fs::remove_dir(full).await
        } else {
            tokio::fs::remove_file(full).await
        }
    }

    /// Remove `path` and everything beneath it. A missing path is not an error.
    pub async fn remove_all(&self, path: &str) -> io::Result<()> {
        crate::io::purge(&self.resolve(path)?).await
    }

    /// Rename within the store.
    pub async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        tokio::fs::rename(self.resolve(from)?, self.resolve(to)?).await
    }

    /// Set access and modification times, in Unix seconds.
    pub async fn chtimes(&self, path: &str, atime: i64, mtime: i64) -> io::Result<()> {
        let full = self.resolve(path)?;
        blocking(move || filetime::set_file_times(full, file_time(atime), file_time(mtime))).await
    }

    /// Set permission bits.
    pub async fn chmod(&self, path: &str, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt as _;

        tokio::fs::set_permissions(
            self.resolve(path)?,
            std::fs::Permissions::from_mode(mode),
        )
        .await
    }

    /// Check `access(2)` permissions for the calling process.
    pub async fn access(&self, path: &str, mode: i32) -> io::Result<()> {
        let full = self.resolve(path)?;
        blocking(move || {
            nix::unistd::access(&full, nix::unistd::AccessFlags::from_bits_truncate(mode))
                .map_err(io::Error::from)
        })
        .await
    }

    /// Iterate a directory.
    pub async fn read_dir(&self, path: &str) -> io::Result<tokio::fs::ReadDir> {
        tokio::fs::read_dir(self.resolve(path)?).await
    }

    /// Atomically replace `path` with `contents`, stamped with `mode` and the given times.
    ///
    /// The content is staged in a temporary file next to the destination and renamed into place
    /// only once it is complete, so a failure never leaves a partial file at `path`.
    #[instrument(name = "Store::replace", skip(self, contents), fields(len = contents.len()))]
    pub async fn replace(
        &self,
        path: &str,
        contents: Bytes,
        mode: u32,
        atime: i64,
        mtime: i64,
    ) -> io::Result<()> {
        use std::io::Write as _;
        use std::os::unix::fs::PermissionsExt as _;

        let full = self.resolve(path)?;
        let parent = full
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cannot replace root"))?;

        blocking(move || {
            let mut staged = tempfile::Builder::new()
                .prefix(".restfs-")
                .tempfile_in(&parent)?;
            staged.write_all(&contents)?;
            staged.as_file().sync_data()?;
            staged
                .as_file()
                .set_permissions(std::fs::Permissions::from_mode(mode))?;
            filetime::set_file_handle_times(
                staged.as_file(),
                Some(file_time(atime)),
                Some(file_time(mtime)),
            )?;
            staged.persist(&full).map_err(|e| e.error)?;
            debug!(path = %full.display(), "replaced");
            Ok(())
        })
        .await
    }
}

/// Per-user stores beneath one root: user `alice` owns `<root>/alice`.
#[derive(Debug, Clone)]
pub struct UserStore {
    root: PathBuf,
}

impl UserStore {
    /// Users live in the immediate subdirectories of `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The store belonging to `name`.
    ///
    /// Unknown users, and names that are not a single path component, are refused with
    /// [`io::ErrorKind::PermissionDenied`].
    pub async fn user(&self, name: &str) -> io::Result<Store> {
        let denied = || {
            io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("unknown user {name:?}"),
            )
        };
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
            return Err(denied());
        }

        let home = self.root.join(name);
        match tokio::fs::metadata(&home).await {
            Ok(meta) if meta.is_dir() => Ok(Store::new(home)),
            Ok(_) => Err(denied()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(denied()),
            Err(e) => Err(e),
        }
    }
}
