//! FUSE availability checks.

#[cfg(any(target_os = "linux", target_os = "macos"))]
use std::path::Path;

#[cfg(target_os = "linux")]
mod paths {
    pub const FUSE_DEVICE: &str = "/dev/fuse";
    pub const FUSERMOUNT: [&str; 2] = ["/bin/fusermount3", "/bin/fusermount"];
    pub const FUSERMOUNT_USR: [&str; 2] = ["/usr/bin/fusermount3", "/usr/bin/fusermount"];
}

#[cfg(target_os = "macos")]
mod paths {
    pub const MACFUSE_FS_BUNDLE: &str = "/Library/Filesystems/macfuse.fs";
    pub const MACFUSE_MOUNT_HELPER: &str =
        "/Library/Filesystems/macfuse.fs/Contents/Resources/mount_macfuse";
}

/// Errors that can occur when verifying FUSE availability.
#[derive(Debug, thiserror::Error)]
pub enum FuseCheckError {
    /// The kernel module is not loaded or the device is not accessible.
    #[error(
        "{path} is missing. Load the fuse kernel module (`modprobe fuse`) or install your \
         distribution's fuse3 package."
    )]
    DeviceMissing {
        /// Path where the device was expected.
        path: &'static str,
    },

    /// Unprivileged mounting needs the setuid mount helper.
    #[error("fusermount was not found. Install your distribution's fuse3 package.")]
    MountHelperMissing,

    /// macFUSE is not installed at all.
    #[error(
        "macFUSE is not installed. restfs requires macFUSE to mount filesystems.\n\
         Install it from: https://macfuse.github.io/"
    )]
    NotInstalled,
}

/// Verify that FUSE is installed and usable on the current platform.
///
/// On Linux this checks for `/dev/fuse` and, when not running as root, a `fusermount` helper.
#[cfg(target_os = "linux")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    if !Path::new(paths::FUSE_DEVICE).exists() {
        return Err(FuseCheckError::DeviceMissing {
            path: paths::FUSE_DEVICE,
        });
    }

    let is_root = nix::unistd::Uid::effective().is_root();
    let has_helper = paths::FUSERMOUNT
        .iter()
        .chain(paths::FUSERMOUNT_USR.iter())
        .any(|p| Path::new(p).is_file());
    if !is_root && !has_helper {
        return Err(FuseCheckError::MountHelperMissing);
    }

    Ok(())
}

/// Verify that FUSE is installed and usable on the current platform.
///
/// On macOS this checks for the macFUSE bundle and its mount helper.
#[cfg(target_os = "macos")]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    if !Path::new(paths::MACFUSE_FS_BUNDLE).is_dir() {
        return Err(FuseCheckError::NotInstalled);
    }
    if !Path::new(paths::MACFUSE_MOUNT_HELPER).is_file() {
        return Err(FuseCheckError::MountHelperMissing);
    }
    Ok(())
}

/// Verify that FUSE is installed and usable on the current platform.
///
/// Elsewhere this is a no-op and mounting reports its own errors.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn ensure_fuse() -> Result<(), FuseCheckError> {
    Ok(())
}
