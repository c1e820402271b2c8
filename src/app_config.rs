//! The mount's configuration file.
//!
//! Settings live in a kebab-case TOML file. Every field has a default, so a missing file is
//! replaced by a freshly written default one and a partial file is filled in. Command-line flags
//! override the file after loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytesize::ByteSize;
use restfs::cache::eviction::{DEFAULT_MAX_SIZE, DEFAULT_SCAN_INTERVAL};
use restfs_http::ClientConfig;
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const FILE_NAME: &str = "config.toml";

/// Per-user state: the runtime dir when there is one, else `~/.local/share/restfs`.
fn state_dir() -> Option<PathBuf> {
    dirs::runtime_dir()
        .map(|dir| dir.join("restfs"))
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share/restfs")))
}

fn in_state_dir(name: &str, fallback: &str) -> PathBuf {
    state_dir().map_or_else(|| PathBuf::from(fallback), |dir| dir.join(name))
}

fn default_pid_file() -> PathBuf {
    in_state_dir("restfs.pid", "/var/run/restfs.pid")
}

fn default_mount_point() -> PathBuf {
    in_state_dir("mnt", "/tmp/restfs/mnt")
}

fn default_cache_path() -> PathBuf {
    in_state_dir("cache", "/tmp/restfs/cache")
}

fn process_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

fn process_gid() -> u32 {
    nix::unistd::getgid().as_raw()
}

fn default_host() -> String {
    "localhost:8080".to_owned()
}

fn default_username() -> SecretString {
    SecretString::from("user".to_owned())
}

fn default_request_timeout_secs() -> u64 {
    restfs_http::DEFAULT_TIMEOUT.as_secs()
}

fn default_max_size() -> ByteSize {
    DEFAULT_MAX_SIZE
}

fn default_scan_interval_secs() -> u64 {
    DEFAULT_SCAN_INTERVAL.as_secs()
}

fn serialize_masked<S>(_secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str("****")
}

/// Where the remote store lives and who we are to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RemoteConfig {
    /// `host:port` of the server, optionally with an `http://` scheme.
    #[serde(default = "default_host")]
    pub host: String,

    /// The user whose store is mounted.
    #[serde(default = "default_username", serialize_with = "serialize_masked")]
    pub username: SecretString,

    /// Per-request timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            username: default_username(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl RemoteConfig {
    /// The transport configuration for this remote.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.host.clone(), self.username.expose_secret());
        config.timeout = Duration::from_secs(self.request_timeout_secs);
        config
    }
}

/// Where cached copies live and how large they may grow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// The path to the cache directory. Each host gets its own subdirectory.
    pub path: PathBuf,

    /// The size above which the eviction daemon starts reclaiming.
    #[serde(default = "default_max_size")]
    pub max_size: ByteSize,

    /// How often the eviction daemon measures the cache.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            max_size: default_max_size(),
            scan_interval_secs: default_scan_interval_secs(),
        }
    }
}

/// Settings that only matter when running detached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonConfig {
    /// Written on detach. Defaults to the per-user state directory.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
        }
    }
}

/// Everything a mount needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Directory the filesystem appears at. Created if missing; must be empty.
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    /// Owner reported for every entry, and the user a detached daemon drops to.
    #[serde(default = "process_uid")]
    pub uid: u32,

    /// Group counterpart of `uid`.
    #[serde(default = "process_gid")]
    pub gid: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            cache: CacheConfig::default(),
            daemon: DaemonConfig::default(),
            mount_point: default_mount_point(),
            uid: process_uid(),
            gid: process_gid(),
        }
    }
}

/// Why the configuration file could not be loaded or written.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// The file.
        path: PathBuf,
        /// What went wrong.
        source: std::io::Error,
    },

    /// The file is not valid TOML or does not match the schema.
    #[error("cannot parse {}: {source}", path.display())]
    Parse {
        /// The file.
        path: PathBuf,
        /// What went wrong.
        source: toml::de::Error,
    },

    /// The defaults could not be rendered.
    #[error("cannot render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    /// The file could not be written.
    #[error("cannot write {}: {source}", path.display())]
    Write {
        /// The file.
        path: PathBuf,
        /// What went wrong.
        source: std::io::Error,
    },

    /// Neither a config directory nor a home directory could be determined.
    #[error("no location available for a configuration file")]
    NoLocation,
}

impl Config {
    /// Check every setting, collecting all problems rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.daemon.pid_file.parent().is_none() {
            errors.push(format!(
                "daemon.pid-file '{}' needs a parent directory.",
                self.daemon.pid_file.display()
            ));
        }

        let host = self.remote.host.trim();
        if host.is_empty() {
            errors.push("remote.host must not be empty.".to_owned());
        } else if host.contains('/') && !host.starts_with("http://") && !host.starts_with("https://")
        {
            errors.push(format!(
                "remote.host '{host}' must be host:port, optionally prefixed with http://."
            ));
        }

        if self.remote.username.expose_secret().is_empty() {
            errors.push("remote.username must not be empty.".to_owned());
        }

        if self.remote.request_timeout_secs == 0 {
            errors.push("remote.request-timeout-secs must be positive.".to_owned());
        }

        if self.cache.scan_interval_secs == 0 {
            errors.push("cache.scan-interval-secs must be positive.".to_owned());
        }

        if !self.cache.path.is_absolute() {
            errors.push(format!(
                "cache.path '{}' must be absolute.",
                self.cache.path.display()
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The cache directory for the configured host: `<cache.path>/<host>`.
    pub fn cache_root(&self) -> PathBuf {
        let host = self.remote.host.trim();
        let host = host
            .strip_prefix("http://")
            .or_else(|| host.strip_prefix("https://"))
            .unwrap_or(host);
        self.cache.path.join(host.replace(['/', ':'], "_"))
    }

    /// Places a config file is looked for, most preferred first.
    ///
    /// macOS has no XDG config dir worth using (`dirs` maps it to Application Support), so only
    /// `~/.config` and `/etc` are searched there.
    fn candidate_paths() -> Vec<PathBuf> {
        let xdg = if cfg!(target_os = "macos") {
            None
        } else {
            dirs::config_dir()
        };
        xdg.into_iter()
            .chain(dirs::home_dir().map(|home| home.join(".config")))
            .map(|dir| dir.join("restfs").join(FILE_NAME))
            .chain(std::iter::once(Path::new("/etc/restfs").join(FILE_NAME)))
            .collect()
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "reading configuration");
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Load `explicit` if given, otherwise the first existing candidate file.
    ///
    /// `Ok(None)` means there was nothing to load.
    pub fn load(explicit: Option<&Path>) -> Result<Option<Self>, ConfigError> {
        let found = match explicit {
            Some(path) => path.exists().then(|| path.to_owned()),
            None => Self::candidate_paths().into_iter().find(|p| p.exists()),
        };
        found.map(|path| Self::read(&path)).transpose()
    }

    /// Load the configuration, writing the defaults to the preferred location if none exists.
    ///
    /// A file that exists but does not parse is an error, never silently replaced.
    pub fn load_or_create(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(config) = Self::load(explicit)? {
            return Ok(config);
        }

        let path = match explicit {
            Some(path) => path.to_owned(),
            None => Self::candidate_paths()
                .into_iter()
                .next()
                .ok_or(ConfigError::NoLocation)?,
        };
        let config = Self::default();
        config.write_to_disk(&path)?;
        info!(path = %path.display(), "wrote default configuration");
        Ok(config)
    }

    /// Writes the configuration, with the username in the clear so it survives a reload.
    fn write_to_disk(&self, path: &Path) -> Result<(), ConfigError> {
        #[derive(Serialize)]
        #[serde(rename_all = "kebab-case")]
        struct ExposedRemote<'a> {
            host: &'a str,
            username: &'a str,
            request_timeout_secs: u64,
        }

        #[derive(Serialize)]
        #[serde(rename_all = "kebab-case")]
        struct Exposed<'a> {
            remote: ExposedRemote<'a>,
            cache: &'a CacheConfig,
            daemon: &'a DaemonConfig,
            mount_point: &'a Path,
            uid: u32,
            gid: u32,
        }

        let exposed = Exposed {
            remote: ExposedRemote {
                host: &self.remote.host,
                username: self.remote.username.expose_secret(),
                request_timeout_secs: self.remote.request_timeout_secs,
            },
            cache: &self.cache,
            daemon: &self.daemon,
            mount_point: &self.mount_point,
            uid: self.uid,
            gid: self.gid,
        };
        let text = toml::to_string_pretty(&exposed)?;
        let written = match path.parent() {
            Some(dir) => std::fs::create_dir_all(dir).and_then(|()| std::fs::write(path, text)),
            None => std::fs::write(path, text),
        };
        written.map_err(|source| ConfigError::Write {
            path: path.to_owned(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn partial_files_fill_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            mount-point = "/mnt/r"

            [remote]
            host = "files.example:9000"
            username = "alice"

            [cache]
            path = "/var/cache/restfs"
            max-size = "2 GiB"
            "#,
        )
        .unwrap();

        assert_eq!(config.remote.username.expose_secret(), "alice");
        assert_eq!(config.remote.request_timeout_secs, 10);
        assert_eq!(config.cache.max_size, ByteSize::gib(2));
        assert_eq!(config.cache.scan_interval_secs, 60);
        assert_eq!(
            config.cache_root(),
            PathBuf::from("/var/cache/restfs/files.example_9000")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_reports_everything_at_once() {
        let mut config = Config::default();
        config.remote.host = String::new();
        config.remote.request_timeout_secs = 0;
        config.cache.path = PathBuf::from("relative");
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn username_is_masked_when_printed() {
        let config = Config::default();
        let rendered = toml::to_string(&config).unwrap();
        assert!(rendered.contains("username = \"****\""));
    }

    #[test]
    fn missing_explicit_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        assert!(Config::load(Some(&path)).unwrap().is_none());

        let created = Config::load_or_create(Some(&path)).unwrap();
        assert!(path.exists());
        let reloaded = Config::load(Some(&path)).unwrap().unwrap();
        assert_eq!(reloaded.mount_point, created.mount_point);
    }

    #[test]
    fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "remote = 5").unwrap();
        assert!(matches!(
            Config::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn written_config_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restfs").join("config.toml");
        let mut config = Config::default();
        config.remote.username = SecretString::from("bob".to_owned());
        config.write_to_disk(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded.remote.username.expose_secret(), "bob");
        assert_eq!(loaded.cache.path, config.cache.path);
        assert_eq!(loaded.mount_point, config.mount_point);
    }
}
