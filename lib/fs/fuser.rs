//! FUSE adapter: maps [`fuser::Filesystem`] callbacks onto [`RemoteFs`].

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::TimeOrNow;
use restfs_http::HttpClient;
use restfs_http::wire::Metadata;
use tracing::{debug, error, instrument, warn};

use super::bridge::{PathBridge, ROOT_INO};
use super::{FileHandle, FsError, InodeAddr, OpenFlags, OpenHandle, RemoteFs, parent_of};

/// Any fuser reply that can carry an errno.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                <$ty>::error(self, errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyEmpty,
    fuser::ReplyCreate,
    fuser::ReplyWrite,
    fuser::ReplyStatfs,
);

/// Lets a callback state only its success reply; failures become the matching errno.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, FsError> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(i32::from(&e));
            }
        }
    }
}

const BLOCK_SIZE: u32 = 4096;

fn system_time(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::try_from(secs).unwrap_or(0))
}

fn unix_seconds(t: TimeOrNow) -> i64 {
    let t = match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    };
    t.duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

fn kind_of(is_dir: bool) -> fuser::FileType {
    if is_dir {
        fuser::FileType::Directory
    } else {
        fuser::FileType::RegularFile
    }
}

/// Convert wire [`Metadata`] to the fuser-specific `FileAttr`.
///
/// Ownership is not carried by the remote, so every entry belongs to the mounting user.
#[expect(
    clippy::cast_possible_truncation,
    reason = "permission bits are masked to 0o7777 and fit in u16"
)]
fn to_fuser_attr(ino: InodeAddr, meta: &Metadata, uid: u32, gid: u32) -> fuser::FileAttr {
    let mtime = system_time(meta.mtime);
    fuser::FileAttr {
        ino,
        size: meta.size,
        blocks: meta.size.div_ceil(512),
        atime: system_time(meta.atime),
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: kind_of(meta.is_dir),
        perm: meta.permissions() as u16,
        nlink: if meta.is_dir { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// One row of a directory snapshot taken at `opendir`.
#[derive(Debug, Clone)]
struct DirRow {
    ino: InodeAddr,
    name: String,
    kind: fuser::FileType,
}

/// Bridges [`RemoteFs`] to the [`fuser::Filesystem`] trait.
///
/// Owns the inode/path bridge, the open-file and open-directory maps, and a tokio runtime handle
/// for blocking on async ops.
pub struct FuserAdapter<C: HttpClient + 'static> {
    fs: Arc<RemoteFs<C>>,
    bridge: PathBridge,
    open_files: HashMap<FileHandle, Arc<dyn OpenHandle>>,
    open_dirs: HashMap<FileHandle, Vec<DirRow>>,
    next_fh: FileHandle,
    runtime: tokio::runtime::Handle,
    uid: u32,
    gid: u32,
}

impl<C: HttpClient + 'static> FuserAdapter<C> {
    // Entries can change remotely at any moment and the coherency check is what notices, so the
    // kernel must come back to us quickly.
    const TTL: Duration = Duration::from_secs(1);

    /// Serve `fs`, reporting every entry as owned by `uid`:`gid`.
    pub fn new(fs: Arc<RemoteFs<C>>, runtime: tokio::runtime::Handle, uid: u32, gid: u32) -> Self {
        Self {
            fs,
            bridge: PathBridge::new(),
            open_files: HashMap::new(),
            open_dirs: HashMap::new(),
            next_fh: 1,
            runtime,
            uid,
            gid,
        }
    }

    fn allocate_fh(&mut self) -> FileHandle {
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }

    fn path_of(&self, ino: InodeAddr) -> Result<String, FsError> {
        self.bridge
            .path(ino)
            .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))
    }

    fn child_of(&self, parent: InodeAddr, name: &OsStr) -> Result<String, FsError> {
        let name = name.to_str().ok_or_else(|| {
            FsError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "entry names must be UTF-8",
            ))
        })?;
        Ok(super::join(&self.path_of(parent)?, name))
    }

    fn handle(&self, fh: FileHandle) -> Result<Arc<dyn OpenHandle>, FsError> {
        self.open_files
            .get(&fh)
            .map(Arc::clone)
            .ok_or(FsError::BadHandle)
    }

    fn attr(&self, ino: InodeAddr, meta: &Metadata) -> fuser::FileAttr {
        to_fuser_attr(ino, meta, self.uid, self.gid)
    }
}

impl<C: HttpClient + 'static> fuser::Filesystem for FuserAdapter<C> {
    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        self.runtime
            .block_on(async {
                let path = self.child_of(parent, name)?;
                match self.fs.getattr(&path).await {
                    Ok(meta) => Ok::<_, FsError>((self.bridge.lookup(&path), meta)),
                    Err(e) => {
                        if e.is_not_found() {
                            self.bridge.remove(&path);
                        }
                        Err(e)
                    }
                }
            })
            .fuse_reply(reply, |(ino, meta), reply| {
                let f_attr = self.attr(ino, &meta);
                debug!(?f_attr, "replying...");
                reply.entry(&Self::TTL, &f_attr, 0);
            });
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req, nlookup))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.bridge.forget(ino, nlookup);
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        self.runtime
            .block_on(async {
                let path = self.path_of(ino)?;
                self.fs.getattr(&path).await
            })
            .fuse_reply(reply, |meta, reply| {
                let attr = self.attr(ino, &meta);
                debug!(?attr, "replying...");
                reply.attr(&Self::TTL, &attr);
            });
    }

    #[instrument(
        name = "FuserAdapter::setattr",
        skip(self, _req, _ctime, _crtime, _chgtime, _bkuptime, _flags, reply)
    )]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        self.runtime
            .block_on(async {
                let path = self.path_of(ino)?;
                let handle = fh.map(|fh| self.handle(fh)).transpose()?;

                if let Some(size) = size {
                    match &handle {
                        Some(handle) => handle.truncate(size).await?,
                        None => self.fs.truncate(&path, size).await?,
                    }
                }
                if let Some(mode) = mode {
                    match &handle {
                        Some(handle) => handle.chmod(mode).await?,
                        None => self.fs.chmod(&path, mode).await?,
                    }
                }
                if uid.is_some() || gid.is_some() {
                    match &handle {
                        Some(handle) => handle.chown(uid, gid).await?,
                        None => debug!("ownership is not stored remotely, ignoring"),
                    }
                }
                if atime.is_some() || mtime.is_some() {
                    if let Some(handle) = &handle {
                        handle.flush().await?;
                    }
                    let current = self.fs.getattr(&path).await?;
                    let atime = atime.map_or(current.atime, unix_seconds);
                    let mtime = mtime.map_or(current.mtime, unix_seconds);
                    self.fs.set_times(&path, atime, mtime).await?;
                }

                match &handle {
                    Some(handle) => handle.getattr().await,
                    None => self.fs.getattr(&path).await,
                }
            })
            .fuse_reply(reply, |meta, reply| {
                let attr = self.attr(ino, &meta);
                debug!(?attr, "replying...");
                reply.attr(&Self::TTL, &attr);
            });
    }

    #[instrument(name = "FuserAdapter::mkdir", skip(self, _req, umask, reply))]
    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        self.runtime
            .block_on(async {
                let path = self.child_of(parent, name)?;
                let meta = self.fs.mkdir(&path, mode & !umask).await?;
                Ok::<_, FsError>((self.bridge.lookup(&path), meta))
            })
            .fuse_reply(reply, |(ino, meta), reply| {
                reply.entry(&Self::TTL, &self.attr(ino, &meta), 0);
            });
    }

    #[instrument(name = "FuserAdapter::unlink", skip(self, _req, reply))]
    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime
            .block_on(async {
                let path = self.child_of(parent, name)?;
                self.fs.unlink(&path).await?;
                self.bridge.remove(&path);
                Ok::<_, FsError>(())
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::rmdir", skip(self, _req, reply))]
    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime
            .block_on(async {
                let path = self.child_of(parent, name)?;
                self.fs.rmdir(&path).await?;
                self.bridge.remove(&path);
                Ok::<_, FsError>(())
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::rename", skip(self, _req, reply))]
    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        if flags != 0 {
            debug!(flags, "rename flags unsupported");
            reply.error(libc::EINVAL);
            return;
        }
        self.runtime
            .block_on(async {
                let from = self.child_of(parent, name)?;
                let to = self.child_of(newparent, newname)?;
                self.fs.rename(&from, &to).await?;
                self.bridge.rename(&from, &to);
                Ok::<_, FsError>(())
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, flags, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let flags = OpenFlags::from_bits_truncate(flags);
        let opened = self.runtime.block_on(async {
            let path = self.path_of(ino)?;
            self.fs.open(&path, flags).await
        });
        opened.fuse_reply(reply, |file, reply| {
            let fh = self.allocate_fh();
            self.open_files.insert(fh, Arc::new(file));
            debug!(handle = fh, "replying...");
            reply.opened(fh, 0);
        });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _ino, fh, offset, size, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        self.runtime
            .block_on(async {
                let handle = self.handle(fh)?;
                handle.read(offset.cast_unsigned(), size).await
            })
            .fuse_reply(reply, |data, reply| {
                debug!(read_bytes = data.len(), "replying...");
                reply.data(&data);
            });
    }

    #[instrument(
        name = "FuserAdapter::write",
        skip(self, _req, _ino, fh, offset, data, _write_flags, _flags, _lock_owner, reply),
        fields(len = data.len())
    )]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        self.runtime
            .block_on(async {
                let handle = self.handle(fh)?;
                handle.write(offset.cast_unsigned(), data).await
            })
            .fuse_reply(reply, |written, reply| reply.written(written));
    }

    #[instrument(name = "FuserAdapter::flush", skip(self, _req, _ino, _lock_owner, reply))]
    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime
            .block_on(async { self.handle(fh)?.flush().await })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::fsync", skip(self, _req, _ino, reply))]
    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.runtime
            .block_on(async { self.handle(fh)?.fsync(datasync).await })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        if let Some(handle) = self.open_files.remove(&fh) {
            if let Err(e) = self.runtime.block_on(handle.release()) {
                debug!(error = %e, "handle close reported error");
            }
            debug!("replying ok");
            reply.ok();
        } else {
            debug!("file handle not open, replying error");
            reply.error(libc::EBADF);
        }
    }

    #[instrument(name = "FuserAdapter::fallocate", skip(self, _req, _ino, reply))]
    fn fallocate(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: fuser::ReplyEmpty,
    ) {
        if mode != 0 {
            reply.error(libc::EOPNOTSUPP);
            return;
        }
        self.runtime
            .block_on(async {
                self.handle(fh)?
                    .allocate(offset.cast_unsigned(), length.cast_unsigned())
                    .await
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::create", skip(self, _req, umask, reply))]
    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let flags = OpenFlags::from_bits_truncate(flags);
        let created = self.runtime.block_on(async {
            let path = self.child_of(parent, name)?;
            let file = self.fs.create(&path, flags, mode & !umask).await?;
            let meta = file.getattr().await?;
            Ok::<_, FsError>((self.bridge.lookup(&path), file, meta))
        });
        created.fuse_reply(reply, |(ino, file, meta), reply| {
            let fh = self.allocate_fh();
            self.open_files.insert(fh, Arc::new(file));
            debug!(handle = fh, ino, "replying...");
            reply.created(&Self::TTL, &self.attr(ino, &meta), 0, fh, 0);
        });
    }

    #[instrument(name = "FuserAdapter::opendir", skip(self, _req, _flags, reply))]
    fn opendir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _flags: i32,
        reply: fuser::ReplyOpen,
    ) {
        let listed = self.runtime.block_on(async {
            let path = self.path_of(ino)?;
            let entries = self.fs.opendir(&path).await?;
            Ok::<_, FsError>((path, entries))
        });
        listed.fuse_reply(reply, |(path, entries), reply| {
            let parent_ino = if ino == ROOT_INO {
                ROOT_INO
            } else {
                self.bridge.ino_or_insert(parent_of(&path))
            };
            let mut rows = Vec::with_capacity(entries.len() + 2);
            rows.push(DirRow {
                ino,
                name: ".".to_owned(),
                kind: fuser::FileType::Directory,
            });
            rows.push(DirRow {
                ino: parent_ino,
                name: "..".to_owned(),
                kind: fuser::FileType::Directory,
            });
            for entry in entries {
                let child = super::join(&path, &entry.name);
                rows.push(DirRow {
                    ino: self.bridge.ino_or_insert(&child),
                    kind: kind_of(entry.is_dir()),
                    name: entry.name,
                });
            }

            let fh = self.allocate_fh();
            self.open_dirs.insert(fh, rows);
            debug!(handle = fh, "replying...");
            reply.opened(fh, 0);
        });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, _ino, offset, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let Some(rows) = self.open_dirs.get(&fh) else {
            debug!("directory handle not open, replying error");
            reply.error(libc::EBADF);
            return;
        };

        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        for (i, row) in rows.iter().enumerate().skip(skip) {
            let Ok(next): Result<i64, _> = (i + 1).try_into() else {
                error!("directory entry index {} too large for fuser", i + 1);
                reply.error(libc::EIO);
                return;
            };
            if reply.add(row.ino, next, row.kind, &row.name) {
                debug!("buffer full for now, stopping readdir");
                break;
            }
        }

        debug!("finalizing reply...");
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::releasedir", skip(self, _req, _ino, _flags, reply))]
    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        if self.open_dirs.remove(&fh).is_some() {
            reply.ok();
        } else {
            reply.error(libc::EBADF);
        }
    }

    #[instrument(name = "FuserAdapter::access", skip(self, _req, reply))]
    fn access(&mut self, _req: &fuser::Request<'_>, ino: u64, mask: i32, reply: fuser::ReplyEmpty) {
        self.runtime
            .block_on(async {
                let path = self.path_of(ino)?;
                self.fs.access(&path, mask).await
            })
            .fuse_reply(reply, |(), reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let stats = nix::sys::statvfs::statvfs(self.fs.cache().root())
            .map_err(|e| FsError::Io(std::io::Error::from(e)));
        stats.fuse_reply(reply, |stats, reply| {
            debug!(?stats, "replying...");
            #[expect(clippy::useless_conversion, reason = "field widths vary by platform")]
            reply.statfs(
                u64::from(stats.blocks()),
                u64::from(stats.blocks_free()),
                u64::from(stats.blocks_available()),
                u64::from(stats.files()),
                u64::from(stats.files_free()),
                u32::try_from(stats.block_size()).unwrap_or(BLOCK_SIZE),
                u32::try_from(stats.name_max()).unwrap_or(255),
                u32::try_from(stats.fragment_size()).unwrap_or(BLOCK_SIZE),
            );
        });
    }

    #[instrument(name = "FuserAdapter::destroy", skip(self))]
    fn destroy(&mut self) {
        let handles: Vec<_> = self.open_files.drain().collect();
        for (fh, handle) in handles {
            if let Err(e) = self.runtime.block_on(handle.release()) {
                warn!(handle = fh, error = %e, "could not release handle on unmount");
            }
        }
        self.open_dirs.clear();
    }
}
