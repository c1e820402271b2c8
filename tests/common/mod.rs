#![allow(dead_code, missing_docs, clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytesize::ByteSize;
use http::{HeaderValue, Method};
use restfs::cache::EvictionDaemon;
use restfs::fs::RemoteFs;
use restfs::notify::{Alert, AlertSink};
use restfs::sandbox::{Store, UserStore};
use restfs_http::wire;
use restfs_http::{
    ClientConfig, HttpClient, HttpClientError, HttpRequest, HttpResponse, ReqwestClient,
    RestClient,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const USER: &str = "alice";

/// Wraps the real backend, recording every request and optionally failing some of them.
#[derive(Clone, Default)]
pub struct CountingClient {
    inner: Option<ReqwestClient>,
    log: Arc<Mutex<Vec<(Method, String)>>>,
    offline: Arc<AtomicBool>,
    failing_gets: Arc<AtomicBool>,
    failing_deletes: Arc<AtomicBool>,
    head_mtime_skew: Arc<AtomicI64>,
}

impl CountingClient {
    pub fn new() -> Self {
        Self {
            inner: Some(ReqwestClient::new(Duration::from_secs(5)).unwrap()),
            ..Self::default()
        }
    }

    /// Number of requests with `method` whose URL ends in `suffix`.
    pub fn count(&self, method: &Method, suffix: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, url)| m == method && url.ends_with(suffix))
            .count()
    }

    pub fn methods(&self) -> Vec<Method> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }

    /// Every request fails as if the server were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// GET requests fail mid-transfer; everything else goes through.
    pub fn set_failing_gets(&self, failing: bool) {
        self.failing_gets.store(failing, Ordering::SeqCst);
    }

    /// DELETE requests fail as if the connection dropped; everything else goes through.
    pub fn set_failing_deletes(&self, failing: bool) {
        self.failing_deletes.store(failing, Ordering::SeqCst);
    }

    /// HEAD answers report an mtime `secs` later than the store actually holds.
    pub fn set_head_mtime_skew(&self, secs: i64) {
        self.head_mtime_skew.store(secs, Ordering::SeqCst);
    }
}

impl HttpClient for CountingClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpClientError> {
        self.log
            .lock()
            .unwrap()
            .push((request.method.clone(), request.url.clone()));

        if self.offline.load(Ordering::SeqCst) {
            return Err(HttpClientError::Connection("connection refused".to_owned()));
        }
        if request.method == Method::GET && self.failing_gets.load(Ordering::SeqCst) {
            return Err(HttpClientError::Connection(
                "connection reset by peer".to_owned(),
            ));
        }
        if request.method == Method::DELETE && self.failing_deletes.load(Ordering::SeqCst) {
            return Err(HttpClientError::Connection("connection reset by peer".to_owned()));
        }
        let is_head = request.method == Method::HEAD;
        let mut response = match &self.inner {
            Some(inner) => inner.send(request).await?,
            None => return Err(HttpClientError::Connection("no backend".to_owned())),
        };

        let skew = self.head_mtime_skew.load(Ordering::SeqCst);
        if is_head && skew != 0 {
            let skewed = response
                .headers
                .get(wire::MTIME)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
                .map(|mtime| mtime + skew);
            if let Some(mtime) = skewed {
                response.headers.insert(wire::MTIME, HeaderValue::from(mtime));
            }
        }
        Ok(response)
    }
}

/// A real server on a loopback port, with one user, plus a client-side cache.
pub struct Harness {
    pub addr: SocketAddr,
    pub store_dir: TempDir,
    pub cache_dir: TempDir,
    pub http: CountingClient,
    pub client: Arc<RestClient<CountingClient>>,
    pub fs: RemoteFs<CountingClient>,
    pub eviction: Arc<EvictionDaemon>,
    pub alerts: mpsc::UnboundedReceiver<Alert>,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub async fn spawn_server(root: &Path) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let users = UserStore::new(root);
    let server = tokio::spawn(async move {
        restfs::server::serve(listener, users, std::future::pending())
            .await
            .unwrap();
    });
    (addr, server)
}

impl Harness {
    pub async fn new() -> Self {
        Self::for_user(USER).await
    }

    /// Like [`Harness::new`], but the client authenticates as `user`. Only [`USER`] is
    /// provisioned on the server.
    pub async fn for_user(user: &str) -> Self {
        let store_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(store_dir.path().join(USER)).unwrap();
        let cache_dir = tempfile::tempdir().unwrap();

        let (addr, server) = spawn_server(store_dir.path()).await;

        let http = CountingClient::new();
        let config = ClientConfig::new(addr.to_string(), user);
        let client = Arc::new(RestClient::with_http_client(&config, http.clone()).unwrap());
        let (alert_sink, alerts) = AlertSink::channel();
        let eviction = EvictionDaemon::new(cache_dir.path(), ByteSize::mib(64));
        let fs = RemoteFs::new(
            Arc::clone(&client),
            Store::new(cache_dir.path()),
            alert_sink,
            Arc::clone(&eviction),
        );

        Self {
            addr,
            store_dir,
            cache_dir,
            http,
            client,
            fs,
            eviction,
            alerts,
            server,
        }
    }

    pub fn remote_path(&self, path: &str) -> PathBuf {
        self.store_dir
            .path()
            .join(USER)
            .join(path.trim_start_matches('/'))
    }

    pub fn cache_path(&self, path: &str) -> PathBuf {
        self.cache_dir.path().join(path.trim_start_matches('/'))
    }

    /// Place a file directly in the server's store.
    pub fn put_remote(&self, path: &str, contents: &[u8], mode: u32, mtime: i64) {
        let full = self.remote_path(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(&full, contents).unwrap();
        std::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode)).unwrap();
        set_times(&full, mtime, mtime);
    }

    /// Place a file directly in the client's cache.
    pub fn put_cached(&self, path: &str, contents: &[u8], mtime: i64) {
        let full = self.cache_path(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(&full, contents).unwrap();
        set_times(&full, mtime, mtime);
    }

    pub fn remote_contents(&self, path: &str) -> Option<Vec<u8>> {
        std::fs::read(self.remote_path(path)).ok()
    }

    pub fn cached_contents(&self, path: &str) -> Option<Vec<u8>> {
        std::fs::read(self.cache_path(path)).ok()
    }

    /// Drain every alert reported so far.
    pub fn take_alerts(&mut self) -> Vec<Alert> {
        let mut alerts = Vec::new();
        while let Ok(alert) = self.alerts.try_recv() {
            alerts.push(alert);
        }
        alerts
    }
}

pub fn set_times(path: &Path, atime: i64, mtime: i64) {
    filetime::set_file_times(
        path,
        filetime::FileTime::from_unix_time(atime, 0),
        filetime::FileTime::from_unix_time(mtime, 0),
    )
    .unwrap();
}

pub fn times(path: &Path) -> (i64, i64) {
    use std::os::unix::fs::MetadataExt as _;
    let meta = std::fs::metadata(path).unwrap();
    (meta.atime(), meta.mtime())
}
