//! The filesystem operations of a mount.
//!
//! Reads are served from the local cache once the [`CoherencyEngine`] vouches for it, and fetched
//! otherwise. Mutations go to the remote first and are mirrored locally afterwards, so that a crash
//! between the two steps leaves the remote holding the authoritative copy.

use std::os::unix::fs::MetadataExt as _;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use restfs_http::wire::{self, ListingEntry, Metadata, WriteAttrs};
use restfs_http::{HttpClient, HttpResponse, RestClient};
use tracing::{debug, info, instrument, warn};

use super::coherency::{Inspection, RemoteState};
use super::handle::{LoopbackFile, WriteBackFile, push_local};
use super::{CacheVerdict, CoherencyEngine, FsError, OpenFlags, parent_of};
use crate::cache::EvictionDaemon;
use crate::notify::{Alert, AlertSink};
use crate::sandbox::Store;

/// How many times `open` may fetch before giving up on the cache agreeing with the remote.
const MAX_FETCHES: usize = 1;

/// Map a response status to the adapter's error taxonomy.
pub(crate) fn expect_success(path: &str, response: &HttpResponse) -> Result<(), FsError> {
    if response.status.is_success() {
        Ok(())
    } else if response.is_not_found() {
        Err(FsError::NotFound(path.to_owned()))
    } else {
        Err(FsError::Protocol {
            path: path.to_owned(),
            status: response.status,
        })
    }
}

/// A remote store viewed through a local cache.
pub struct RemoteFs<C: HttpClient> {
    client: Arc<RestClient<C>>,
    cache: Store,
    coherency: CoherencyEngine<C>,
    alerts: AlertSink,
    eviction: Arc<EvictionDaemon>,
}

impl<C: HttpClient + 'static> RemoteFs<C> {
    /// Serve the remote behind `client`, caching under `cache`.
    pub fn new(
        client: Arc<RestClient<C>>,
        cache: Store,
        alerts: AlertSink,
        eviction: Arc<EvictionDaemon>,
    ) -> Self {
        let coherency = CoherencyEngine::new(Arc::clone(&client), cache.clone(), alerts.clone());
        Self {
            client,
            cache,
            coherency,
            alerts,
            eviction,
        }
    }

    /// The local cache.
    #[must_use]
    pub fn cache(&self) -> &Store {
        &self.cache
    }

    /// The coherency engine used by every operation.
    #[must_use]
    pub fn coherency(&self) -> &CoherencyEngine<C> {
        &self.coherency
    }

    /// Attributes of `path`.
    ///
    /// A current cached copy answers locally; otherwise the attributes come from the remote
    /// answer the coherency check already obtained.
    #[instrument(name = "RemoteFs::getattr", skip(self))]
    pub async fn getattr(&self, path: &str) -> Result<Metadata, FsError> {
        let Inspection { verdict, remote } = self.coherency.inspect(path).await?;
        match (verdict, remote) {
            (CacheVerdict::Good, _) => {
                let local = self.cache.stat(path).await?;
                Ok(Metadata::from(&local))
            }
            (_, RemoteState::Present(meta)) => {
                // Only the access time is refreshed: raising the local mtime would make a stale
                // copy look current.
                if let Ok(local) = self.cache.stat(path).await
                    && local.is_dir() == meta.is_dir
                    && let Err(e) = self.cache.chtimes(path, meta.atime, local.mtime()).await
                {
                    debug!(error = %e, "could not refresh local atime");
                }
                Ok(meta)
            }
            (_, RemoteState::Missing) => Err(FsError::NotFound(path.to_owned())),
            (_, RemoteState::Unknown(e)) => Err(e),
        }
    }

    /// List `path`, materializing a placeholder in the cache for every entry not yet cached.
    ///
    /// Listings are always fetched. Placeholders carry the remote mode and a zero timestamp, so
    /// the first real access to one evaluates as stale and fetches.
    #[instrument(name = "RemoteFs::opendir", skip(self))]
    pub async fn opendir(&self, path: &str) -> Result<Vec<ListingEntry>, FsError> {
        let response = self.client.get(path).await?;
        expect_success(path, &response)?;
        let meta = Metadata::from_headers(&response.headers)?;
        if !meta.is_dir {
            return Err(FsError::NotADirectory(path.to_owned()));
        }
        let entries = wire::parse_listing(&response.body)?;

        self.ensure_local_dir(path, meta.permissions()).await?;
        for entry in &entries {
            self.materialize(&super::join(path, &entry.name), entry)
                .await?;
        }
        debug!(count = entries.len(), "listed");
        Ok(entries)
    }

    async fn ensure_local_dir(&self, path: &str, mode: u32) -> Result<(), FsError> {
        match self.cache.stat(path).await {
            Ok(local) if local.is_dir() => return Ok(()),
            Ok(_) => self.cache.remove_all(path).await?,
            Err(_) => {}
        }
        self.cache.mkdir_all(path, mode | 0o700).await?;
        Ok(())
    }

    async fn materialize(&self, path: &str, entry: &ListingEntry) -> Result<(), FsError> {
        match self.cache.stat(path).await {
            Ok(local) if local.is_dir() == entry.is_dir() => return Ok(()),
            Ok(_) => self.cache.remove_all(path).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if entry.is_dir() {
            self.cache.mkdir(path, entry.permissions() | 0o700).await?;
        } else {
            let created = self
                .cache
                .open_file(
                    path,
                    tokio::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(entry.permissions()),
                )
                .await;
            match created {
                Ok(_) => {}
                // Raced with a concurrent listing or fetch; theirs is at least as good.
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        self.cache.chtimes(path, 0, 0).await?;
        Ok(())
    }

    /// Make sure the cache holds a current copy of the file at `path`.
    ///
    /// Checks, fetches at most [`MAX_FETCHES`] times, and re-checks. A fetch that still leaves
    /// the cache disagreeing with the remote is an error rather than a reason to loop.
    async fn ensure_cached(&self, path: &str) -> Result<(), FsError> {
        let mut fetches = 0;
        loop {
            let Inspection { verdict, remote } = self.coherency.inspect(path).await?;
            match (verdict, remote) {
                (CacheVerdict::Good, _) => return Ok(()),
                (_, RemoteState::Missing) => return Err(FsError::NotFound(path.to_owned())),
                (_, RemoteState::Unknown(e)) => return Err(e),
                (_, RemoteState::Present(meta)) if meta.is_dir => {
                    return Err(FsError::IsDirectory(path.to_owned()));
                }
                (_, RemoteState::Present(_)) => {
                    if fetches == MAX_FETCHES {
                        warn!(fetches, "cache did not converge");
                        return Err(FsError::NotConverged(path.to_owned()));
                    }
                    self.fetch(path).await?;
                    fetches += 1;
                }
            }
        }
    }

    /// Download `path` into the cache, replacing any previous copy atomically.
    #[instrument(name = "RemoteFs::fetch", skip(self))]
    async fn fetch(&self, path: &str) -> Result<(), FsError> {
        let response = self.client.get(path).await?;
        expect_success(path, &response)?;
        let meta = Metadata::from_headers(&response.headers)?;
        if meta.is_dir {
            return Err(FsError::IsDirectory(path.to_owned()));
        }

        let parent = parent_of(path);
        if !super::is_root(parent) {
            self.ensure_local_dir(parent, 0o755).await?;
        }
        if let Ok(local) = self.cache.stat(path).await
            && local.is_dir()
        {
            self.cache.remove_all(path).await?;
        }

        let len = response.body.len();
        self.cache
            .replace(path, response.body, meta.permissions(), meta.atime, meta.mtime)
            .await?;
        debug!(len, mtime = meta.mtime, "fetched");
        Ok(())
    }

    fn bind(&self, inner: LoopbackFile, path: &str, dirty: bool) -> WriteBackFile<C> {
        self.eviction.lock(path);
        WriteBackFile::new(
            inner,
            path.to_owned(),
            dirty,
            Arc::clone(&self.client),
            self.cache.clone(),
            self.alerts.clone(),
            Arc::clone(&self.eviction),
        )
    }

    /// Open the file at `path`, fetching it first unless the cache is current.
    #[instrument(name = "RemoteFs::open", skip(self))]
    pub async fn open(&self, path: &str, flags: OpenFlags) -> Result<WriteBackFile<C>, FsError> {
        self.ensure_cached(path).await?;
        let file = LoopbackFile::open(&self.cache, path, flags).await?;
        let truncated = flags.is_writable() && flags.contains(OpenFlags::TRUNC);
        Ok(self.bind(file, path, truncated))
    }

    /// Create an empty file locally, register it remotely, and open it.
    ///
    /// The remote entry is written with the local file's mode and times, so the new file
    /// evaluates as current straight away.
    #[instrument(name = "RemoteFs::create", skip(self))]
    pub async fn create(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<WriteBackFile<C>, FsError> {
        let parent = parent_of(path);
        if !super::is_root(parent) {
            self.ensure_local_dir(parent, 0o755).await?;
        }

        let file = self
            .cache
            .open_file(
                path,
                tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .create_new(flags.contains(OpenFlags::EXCL))
                    .mode(mode & wire::PERM_MASK),
            )
            .await?;

        let registered = async {
            let local = file.metadata().await?;
            let attrs = WriteAttrs::from(&Metadata::from(&local));
            let response = self.client.put(path, &attrs, Bytes::new()).await?;
            expect_success(path, &response)
        }
        .await;

        if let Err(e) = registered {
            drop(file);
            if let Err(cleanup) = self.cache.remove(path).await {
                warn!(error = %cleanup, "could not remove unregistered local file");
            }
            return Err(e);
        }

        Ok(self.bind(LoopbackFile::new(file), path, false))
    }

    /// Create a directory remotely, then locally.
    #[instrument(name = "RemoteFs::mkdir", skip(self))]
    pub async fn mkdir(&self, path: &str, mode: u32) -> Result<Metadata, FsError> {
        let response = self.client.post(path, mode, true).await?;
        expect_success(path, &response)?;
        self.cache.mkdir_all(path, (mode & wire::PERM_MASK) | 0o700).await?;
        let local = self.cache.stat(path).await?;
        Ok(Metadata::from(&local))
    }

    /// Move a file: upload under the new name, delete the old name, then move the cached copy.
    ///
    /// If the remote delete fails, the new remote copy already exists; content is duplicated,
    /// never lost. Directories cannot be moved this way and report [`FsError::DirectoryRename`].
    #[instrument(name = "RemoteFs::rename", skip(self))]
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        match self.ensure_cached(from).await {
            Err(FsError::IsDirectory(_)) => return Err(FsError::DirectoryRename(from.to_owned())),
            other => other?,
        }

        let local = self.cache.stat(from).await?;
        if local.is_dir() {
            return Err(FsError::DirectoryRename(from.to_owned()));
        }
        let body = tokio::fs::read(self.cache.resolve(from)?).await?;
        let attrs = WriteAttrs::from(&Metadata::from(&local));
        let response = self.client.put(to, &attrs, Bytes::from(body)).await?;
        expect_success(to, &response)?;

        let response = self.client.delete(from).await?;
        match expect_success(from, &response) {
            Ok(()) | Err(FsError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let parent = parent_of(to);
        if !super::is_root(parent) {
            self.ensure_local_dir(parent, 0o755).await?;
        }
        self.cache.rename(from, to).await?;
        info!("renamed");
        Ok(())
    }

    /// Remove a file.
    #[instrument(name = "RemoteFs::unlink", skip(self))]
    pub async fn unlink(&self, path: &str) -> Result<(), FsError> {
        self.delete(path, false).await
    }

    /// Remove an empty directory.
    #[instrument(name = "RemoteFs::rmdir", skip(self))]
    pub async fn rmdir(&self, path: &str) -> Result<(), FsError> {
        self.delete(path, true).await
    }

    async fn delete(&self, path: &str, dir: bool) -> Result<(), FsError> {
        let remote = match self.client.delete(path).await {
            Ok(response) => match expect_success(path, &response) {
                Ok(()) => Ok(true),
                Err(FsError::NotFound(_)) => Ok(false),
                Err(FsError::Protocol {
                    status: StatusCode::CONFLICT,
                    ..
                }) if dir => Err(FsError::Io(std::io::Error::from_raw_os_error(
                    libc::ENOTEMPTY,
                ))),
                Err(e) => Err(e),
            },
            Err(e) => Err(FsError::Transport(e)),
        };

        // The local copy goes regardless, so the cache does not keep serving a file the user
        // asked to delete.
        let local = match (&remote, dir) {
            // The remote directory was empty; anything left locally is stale.
            (Ok(true), true) => self.cache.remove_all(path).await,
            _ => self.cache.remove(path).await,
        };

        match remote {
            Err(e) => {
                if let Err(local_err) = &local {
                    debug!(error = %local_err, "local delete also failed");
                }
                self.alerts.report(Alert::RemoteDeleteFailed {
                    path: path.to_owned(),
                    reason: e.to_string(),
                });
                Err(e)
            }
            Ok(existed) => match local {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if existed {
                        Ok(())
                    } else {
                        Err(FsError::NotFound(path.to_owned()))
                    }
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Check permissions against the cached entry.
    ///
    /// Listings always refresh the cache's entries and their modes, so the cache is the
    /// authority here and the remote is not consulted.
    #[instrument(name = "RemoteFs::access", skip(self))]
    pub async fn access(&self, path: &str, mask: i32) -> Result<(), FsError> {
        Ok(self.cache.access(path, mask).await?)
    }

    /// Set the length of `path` and push the result upstream.
    #[instrument(name = "RemoteFs::truncate", skip(self))]
    pub async fn truncate(&self, path: &str, size: u64) -> Result<(), FsError> {
        self.ensure_cached(path).await?;
        {
            let file = self
                .cache
                .open_file(path, tokio::fs::OpenOptions::new().write(true))
                .await?;
            file.set_len(size).await?;
        }
        push_local(&self.client, &self.cache, path).await
    }

    /// Change the permission bits of `path` and push the result upstream.
    #[instrument(name = "RemoteFs::chmod", skip(self))]
    pub async fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        self.ensure_cached(path).await?;
        self.cache.chmod(path, mode & wire::PERM_MASK).await?;
        push_local(&self.client, &self.cache, path).await
    }

    /// Set the times of `path` and push them upstream.
    #[instrument(name = "RemoteFs::set_times", skip(self))]
    pub async fn set_times(&self, path: &str, atime: i64, mtime: i64) -> Result<(), FsError> {
        self.ensure_cached(path).await?;
        self.cache.chtimes(path, atime, mtime).await?;
        push_local(&self.client, &self.cache, path).await
    }
}
