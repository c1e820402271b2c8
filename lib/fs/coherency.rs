//! Decides whether a cached copy may be served without fetching.
//!
//! Every evaluation costs one `HEAD` round trip. Verdicts are never remembered; the next call asks
//! the remote again.

use std::os::unix::fs::MetadataExt as _;
use std::sync::Arc;

use http::StatusCode;
use restfs_http::wire::Metadata;
use restfs_http::{HttpClient, RestClient};
use tracing::{debug, instrument};

use super::FsError;
use crate::notify::{Alert, AlertSink};
use crate::sandbox::Store;

/// Trustworthiness of the cached copy of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheVerdict {
    /// The cached copy may be served as-is.
    Good,
    /// The cached copy is missing or older than the remote one and must be refetched.
    Stale,
    /// The entry does not exist; any cached copy has been purged.
    Absent,
}

/// What the remote said during an evaluation.
#[derive(Debug)]
pub(crate) enum RemoteState {
    /// The entry exists with these attributes.
    Present(Metadata),
    /// The remote answered not-found.
    Missing,
    /// The remote could not be reached; the verdict came from the cache alone.
    Unknown(FsError),
}

/// A verdict together with the remote answer it was derived from.
#[derive(Debug)]
pub(crate) struct Inspection {
    pub verdict: CacheVerdict,
    pub remote: RemoteState,
}

/// Compares remote modification times against the cache.
#[derive(Debug)]
pub struct CoherencyEngine<C: HttpClient> {
    client: Arc<RestClient<C>>,
    cache: Store,
    alerts: AlertSink,
}

impl<C: HttpClient> CoherencyEngine<C> {
    /// An engine checking `cache` against the remote behind `client`.
    pub fn new(client: Arc<RestClient<C>>, cache: Store, alerts: AlertSink) -> Self {
        Self {
            client,
            cache,
            alerts,
        }
    }

    /// Evaluate `path`.
    ///
    /// An unreachable remote does not fail the evaluation: it is reported through the alert sink
    /// and the cache is trusted if it has a copy. A remote that answers with an unexpected status
    /// or malformed headers fails it, as does a failure to purge the cache.
    pub async fn evaluate(&self, path: &str) -> Result<CacheVerdict, FsError> {
        Ok(self.inspect(path).await?.verdict)
    }

    #[instrument(name = "CoherencyEngine::inspect", skip(self))]
    pub(crate) async fn inspect(&self, path: &str) -> Result<Inspection, FsError> {
        let response = match self.client.head(path).await {
            Ok(response) => response,
            Err(e) => {
                self.alerts.report(Alert::RemoteUnreachable {
                    path: path.to_owned(),
                    reason: e.to_string(),
                });
                return Ok(self.offline(path, FsError::Transport(e)).await);
            }
        };

        if response.is_not_found() {
            if !super::is_root(path) {
                self.cache.remove_all(path).await?;
            }
            debug!("remote reports missing, purged");
            return Ok(Inspection {
                verdict: CacheVerdict::Absent,
                remote: RemoteState::Missing,
            });
        }

        if response.status != StatusCode::OK {
            self.alerts.report(Alert::UnexpectedStatus {
                path: path.to_owned(),
                status: response.status,
            });
            return Err(FsError::Protocol {
                path: path.to_owned(),
                status: response.status,
            });
        }

        let remote = Metadata::from_headers(&response.headers)?;

        let verdict = match self.cache.stat(path).await {
            Ok(local) if local.is_dir() != remote.is_dir => CacheVerdict::Stale,
            Ok(local) if remote.mtime > local.mtime() => CacheVerdict::Stale,
            Ok(_) => CacheVerdict::Good,
            Err(e) => {
                debug!(error = %e, "no usable local copy");
                CacheVerdict::Stale
            }
        };
        debug!(?verdict, remote_mtime = remote.mtime, "evaluated");

        Ok(Inspection {
            verdict,
            remote: RemoteState::Present(remote),
        })
    }

    /// The verdict when the remote cannot be reached: serve whatever is cached.
    async fn offline(&self, path: &str, cause: FsError) -> Inspection {
        let verdict = if self.cache.stat(path).await.is_ok() {
            CacheVerdict::Good
        } else {
            CacheVerdict::Absent
        };
        debug!(?verdict, %cause, "remote unavailable, falling back to cache");
        Inspection {
            verdict,
            remote: RemoteState::Unknown(cause),
        }
    }
}
