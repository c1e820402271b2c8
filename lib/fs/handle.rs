//! Open file handles.
//!
//! A handle owns exactly one local descriptor. All operations on a handle go through its mutex,
//! so reads, writes and the final release never interleave on the descriptor. Different handles,
//! even on the same path, are not coordinated with each other.

use std::os::unix::fs::PermissionsExt as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use restfs_http::wire::{Metadata, WriteAttrs};
use restfs_http::{HttpClient, RestClient};
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, instrument, warn};

use super::{FsError, OpenFlags};
use crate::cache::EvictionDaemon;
use crate::notify::{Alert, AlertSink};
use crate::sandbox::Store;

/// The operations every open file supports, whatever backs it.
#[async_trait]
pub trait OpenHandle: Send + Sync {
    /// Read up to `size` bytes at `offset`. Short only at end of file.
    async fn read(&self, offset: u64, size: u32) -> Result<Bytes, FsError>;

    /// Write `data` at `offset`, returning the number of bytes written.
    async fn write(&self, offset: u64, data: &[u8]) -> Result<u32, FsError>;

    /// Flush buffered writes to the descriptor.
    async fn flush(&self) -> Result<(), FsError>;

    /// Sync to stable storage. With `datasync`, metadata may be skipped.
    async fn fsync(&self, datasync: bool) -> Result<(), FsError>;

    /// Set the file length.
    async fn truncate(&self, size: u64) -> Result<(), FsError>;

    /// Ensure the file is at least `offset + length` bytes long.
    async fn allocate(&self, offset: u64, length: u64) -> Result<(), FsError>;

    /// Set permission bits.
    async fn chmod(&self, mode: u32) -> Result<(), FsError>;

    /// Set ownership. `None` leaves that id unchanged.
    async fn chown(&self, uid: Option<u32>, gid: Option<u32>) -> Result<(), FsError>;

    /// Attributes of the open file.
    async fn getattr(&self) -> Result<Metadata, FsError>;

    /// Close the handle. Every later call fails with [`FsError::BadHandle`].
    async fn release(&self) -> Result<(), FsError>;
}

/// A handle backed directly by a local file.
#[derive(Debug)]
pub struct LoopbackFile {
    file: Mutex<Option<tokio::fs::File>>,
}

impl LoopbackFile {
    /// Wrap an already open file.
    #[must_use]
    pub fn new(file: tokio::fs::File) -> Self {
        Self {
            file: Mutex::new(Some(file)),
        }
    }

    /// Open `path` in `store` with the access mode and `APPEND`/`TRUNC` bits of `flags`.
    pub async fn open(store: &Store, path: &str, flags: OpenFlags) -> Result<Self, FsError> {
        let writable = flags.is_writable();
        let file = store
            .open_file(
                path,
                tokio::fs::OpenOptions::new()
                    .read(flags.is_readable())
                    .write(writable)
                    .append(writable && flags.contains(OpenFlags::APPEND))
                    .truncate(writable && flags.contains(OpenFlags::TRUNC)),
            )
            .await?;
        Ok(Self::new(file))
    }

    async fn lock(&self) -> Result<MappedMutexGuard<'_, tokio::fs::File>, FsError> {
        MutexGuard::try_map(self.file.lock().await, Option::as_mut).map_err(|_| FsError::BadHandle)
    }
}

#[async_trait]
impl OpenHandle for LoopbackFile {
    async fn read(&self, offset: u64, size: u32) -> Result<Bytes, FsError> {
        let mut file = self.lock().await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buffer = vec![0_u8; size as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(Bytes::from(buffer))
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let written = u32::try_from(data.len())
            .map_err(|_| std::io::Error::from_raw_os_error(libc::EFBIG))?;
        let mut file = self.lock().await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        Ok(written)
    }

    async fn flush(&self) -> Result<(), FsError> {
        Ok(self.lock().await?.flush().await?)
    }

    async fn fsync(&self, datasync: bool) -> Result<(), FsError> {
        let mut file = self.lock().await?;
        file.flush().await?;
        if datasync {
            file.sync_data().await?;
        } else {
            file.sync_all().await?;
        }
        Ok(())
    }

    async fn truncate(&self, size: u64) -> Result<(), FsError> {
        Ok(self.lock().await?.set_len(size).await?)
    }

    async fn allocate(&self, offset: u64, length: u64) -> Result<(), FsError> {
        let wanted = offset.saturating_add(length);
        let file = self.lock().await?;
        if file.metadata().await?.len() < wanted {
            file.set_len(wanted).await?;
        }
        Ok(())
    }

    async fn chmod(&self, mode: u32) -> Result<(), FsError> {
        let file = self.lock().await?;
        file.set_permissions(std::fs::Permissions::from_mode(mode))
            .await?;
        Ok(())
    }

    async fn chown(&self, uid: Option<u32>, gid: Option<u32>) -> Result<(), FsError> {
        let file = self.lock().await?;
        std::os::unix::fs::fchown(&*file, uid, gid)?;
        Ok(())
    }

    async fn getattr(&self) -> Result<Metadata, FsError> {
        let file = self.lock().await?;
        Ok(Metadata::from(&file.metadata().await?))
    }

    async fn release(&self) -> Result<(), FsError> {
        let mut file = self.file.lock().await.take().ok_or(FsError::BadHandle)?;
        file.flush().await?;
        Ok(())
    }
}

/// Push the cached copy of `path` upstream, stamping the remote with the local mode and times.
///
/// Because the remote takes the client's times, the next coherency check for `path` compares
/// equal and the copy stays [`Good`](super::CacheVerdict::Good).
#[instrument(skip(client, cache))]
pub(crate) async fn push_local<C: HttpClient>(
    client: &RestClient<C>,
    cache: &Store,
    path: &str,
) -> Result<(), FsError> {
    let local = cache.stat(path).await?;
    if local.is_dir() {
        return Err(FsError::IsDirectory(path.to_owned()));
    }
    let body = tokio::fs::read(cache.resolve(path)?).await?;
    let attrs = WriteAttrs::from(&Metadata::from(&local));
    let response = client.put(path, &attrs, Bytes::from(body)).await?;
    super::remote::expect_success(path, &response)
}

/// A local file bound to a remote path.
///
/// Changes made through the handle are pushed upstream when it is released. Handles that were
/// only read from are released without contacting the remote.
pub struct WriteBackFile<C: HttpClient> {
    inner: LoopbackFile,
    path: String,
    dirty: AtomicBool,
    client: Arc<RestClient<C>>,
    cache: Store,
    alerts: AlertSink,
    eviction: Arc<EvictionDaemon>,
}

impl<C: HttpClient> WriteBackFile<C> {
    /// Bind `inner` to `path`. The path must already be locked in `eviction`; release unlocks it.
    pub(crate) fn new(
        inner: LoopbackFile,
        path: String,
        dirty: bool,
        client: Arc<RestClient<C>>,
        cache: Store,
        alerts: AlertSink,
        eviction: Arc<EvictionDaemon>,
    ) -> Self {
        Self {
            inner,
            path,
            dirty: AtomicBool::new(dirty),
            client,
            cache,
            alerts,
            eviction,
        }
    }

    /// The remote path this handle writes back to.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether release will push upstream.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn mark_dirty<T>(&self, result: Result<T, FsError>) -> Result<T, FsError> {
        if result.is_ok() {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }
}

#[async_trait]
impl<C: HttpClient + 'static> OpenHandle for WriteBackFile<C> {
    async fn read(&self, offset: u64, size: u32) -> Result<Bytes, FsError> {
        self.inner.read(offset, size).await
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        self.mark_dirty(self.inner.write(offset, data).await)
    }

    async fn flush(&self) -> Result<(), FsError> {
        self.inner.flush().await
    }

    async fn fsync(&self, datasync: bool) -> Result<(), FsError> {
        self.inner.fsync(datasync).await
    }

    async fn truncate(&self, size: u64) -> Result<(), FsError> {
        self.mark_dirty(self.inner.truncate(size).await)
    }

    async fn allocate(&self, offset: u64, length: u64) -> Result<(), FsError> {
        self.mark_dirty(self.inner.allocate(offset, length).await)
    }

    async fn chmod(&self, mode: u32) -> Result<(), FsError> {
        self.mark_dirty(self.inner.chmod(mode).await)
    }

    async fn chown(&self, uid: Option<u32>, gid: Option<u32>) -> Result<(), FsError> {
        // Ownership does not travel over the wire.
        self.inner.chown(uid, gid).await
    }

    async fn getattr(&self) -> Result<Metadata, FsError> {
        self.inner.getattr().await
    }

    #[instrument(name = "WriteBackFile::release", skip(self), fields(path = %self.path))]
    async fn release(&self) -> Result<(), FsError> {
        let closed = self.inner.release().await;
        if matches!(closed, Err(FsError::BadHandle)) {
            return closed;
        }
        self.eviction.unlock(&self.path);

        if !self.dirty.swap(false, Ordering::AcqRel) {
            debug!("clean, nothing to push");
            return closed;
        }

        // The kernel has already closed the file for the writer, so there is no one left to
        // return this error to.
        if let Err(e) = push_local(&self.client, &self.cache, &self.path).await {
            warn!(error = %e, "write-back failed");
            self.alerts.report(Alert::WriteBackFailed {
                path: self.path.clone(),
                reason: e.to_string(),
            });
        }
        closed
    }
}
