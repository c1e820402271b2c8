//! The mounted process: wires the cache, the remote client and the FUSE session together and
//! keeps them alive until a shutdown signal arrives.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fuser::{BackgroundSession, MountOption};
use nix::errno::Errno;
use restfs::cache::EvictionDaemon;
use restfs::fs::RemoteFs;
use restfs::fs::fuser::FuserAdapter;
use restfs::notify::AlertSink;
use restfs::sandbox::Store;
use restfs_http::{ReqwestClient, RestClient};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, warn};

use crate::app_config::Config;

/// A live FUSE session. Dropping it unmounts, forcibly if the kernel still holds the mount.
struct Mount {
    session: Option<BackgroundSession>,
    mount_point: PathBuf,
}

impl Mount {
    fn start(
        config: &Config,
        fs: Arc<RemoteFs<ReqwestClient>>,
        runtime: tokio::runtime::Handle,
    ) -> io::Result<Self> {
        let options = [
            MountOption::FSName("restfs".to_owned()),
            MountOption::Subtype(config.remote.host.clone()),
            MountOption::RW,
            MountOption::NoDev,
            MountOption::NoSuid,
            MountOption::AutoUnmount,
            MountOption::DefaultPermissions,
        ];
        let adapter = FuserAdapter::new(fs, runtime, config.uid, config.gid);
        debug!(mount_point = %config.mount_point.display(), "starting FUSE session");
        let session = fuser::spawn_mount2(adapter, &config.mount_point, &options)?;
        Ok(Self {
            session: Some(session),
            mount_point: config.mount_point.clone(),
        })
    }

    fn force_unmount(&self) -> Result<(), Errno> {
        #[cfg(target_os = "macos")]
        {
            nix::mount::unmount(&self.mount_point, nix::mount::MntFlags::MNT_FORCE)
        }
        #[cfg(target_os = "linux")]
        {
            nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH)
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            Ok(())
        }
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        const ATTEMPTS: u32 = 10;
        const BACKOFF: Duration = Duration::from_millis(10);

        // The session's own drop only asks politely; a busy mount would outlive the process.
        drop(self.session.take());

        for attempt in 1..=ATTEMPTS {
            match self.force_unmount() {
                Ok(()) => {
                    debug!(attempt, "unmounted");
                    return;
                }
                Err(Errno::EINVAL | Errno::ENOENT) => return,
                Err(Errno::EBUSY) if attempt < ATTEMPTS => std::thread::sleep(BACKOFF),
                Err(e) => {
                    error!(
                        attempt,
                        error = %e,
                        mount_point = %self.mount_point.display(),
                        "unmount failed"
                    );
                    return;
                }
            }
        }
    }
}

/// Make sure `mount_point` is an empty directory, creating it if needed.
async fn claim_mount_point(mount_point: &Path) -> io::Result<()> {
    let mut entries = match tokio::fs::read_dir(mount_point).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "created mount point");
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    if entries.next_entry().await?.is_some() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("mount point {} is not empty", mount_point.display()),
        ));
    }
    Ok(())
}

/// Resolves on Ctrl+C, `SIGTERM` or `SIGHUP`.
async fn shutdown_requested() -> io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;
    let which = tokio::select! {
        _ = tokio::signal::ctrl_c() => "interrupt",
        _ = term.recv() => "terminate",
        _ = hup.recv() => "hangup",
    };
    info!(signal = which, "shutting down");
    Ok(())
}

/// Assemble the filesystem described by `config` and serve it until asked to stop.
pub async fn run(config: Config, runtime: tokio::runtime::Handle) -> io::Result<()> {
    let cache_root = config.cache_root();
    tokio::fs::create_dir_all(&cache_root).await?;
    claim_mount_point(&config.mount_point).await?;

    let client = RestClient::<ReqwestClient>::new(&config.remote.client_config())
        .map_err(io::Error::other)?;
    let alerts = AlertSink::spawn_logging(&runtime);

    let eviction = EvictionDaemon::new(&cache_root, config.cache.max_size);
    let _scanner = eviction.spawn(
        &runtime,
        Duration::from_secs(config.cache.scan_interval_secs),
    );

    let fs = Arc::new(RemoteFs::new(
        Arc::new(client),
        Store::new(&cache_root),
        alerts,
        eviction,
    ));

    let mount = Mount::start(&config, fs, runtime)?;
    info!(
        remote = %config.remote.host,
        cache = %cache_root.display(),
        "serving {}",
        config.mount_point.display()
    );

    let outcome = shutdown_requested().await;
    if let Err(e) = &outcome {
        warn!(error = %e, "signal handling failed, unmounting");
    }
    drop(mount);
    outcome
}

/// Run the daemon on a fresh multi-threaded runtime, blocking until it exits.
pub fn spawn(config: Config) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("restfs")
        .enable_all()
        .build()?;
    let handle = runtime.handle().clone();
    runtime.block_on(run(config, handle))
}
