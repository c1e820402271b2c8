//! One handler per verb. Paths arrive percent-decoded but not yet normalized; the [`Store`] does
//! that.

use std::os::unix::fs::MetadataExt as _;

use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use restfs_http::wire::{self, ListingEntry, Metadata, WriteAttrs};
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, instrument, warn};

use super::ServerError;
use crate::sandbox::{Store, UserStore};

/// Route a request to the handler for its verb.
#[instrument(skip_all, fields(%method, path = %uri.path()))]
pub(super) async fn dispatch(
    State(users): State<UserStore>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let path = urlencoding::decode(uri.path())
        .map_err(|_| ServerError::BadRequest(format!("{} is not valid UTF-8", uri.path())))?
        .into_owned();
    let store = authorize(&users, &headers, &path).await?;

    match method {
        Method::HEAD => head(&store, &path).await,
        Method::GET => get(&store, &path).await,
        Method::PUT => put(&store, &path, &headers, body).await,
        Method::POST => post(&store, &path, &headers, body).await,
        Method::DELETE => delete(&store, &path).await,
        other => Err(ServerError::MethodNotAllowed(other)),
    }
}

async fn authorize(
    users: &UserStore,
    headers: &HeaderMap,
    path: &str,
) -> Result<Store, ServerError> {
    let forbidden = || ServerError::Forbidden(path.to_owned());
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(forbidden)?;
    let user = wire::decode_authorization(value).map_err(|_| forbidden())?;
    users.user(&user).await.map_err(|e| {
        debug!(%user, error = %e, "user rejected");
        ServerError::from_io(path, e)
    })
}

/// Stat `path`, refusing anything that is neither a file nor a directory.
///
/// A trailing slash names a directory, so a file found there does not count.
async fn stat_entry(store: &Store, path: &str) -> Result<Metadata, ServerError> {
    let meta = store
        .stat(path)
        .await
        .map_err(|e| ServerError::from_io(path, e))?;
    if path.ends_with('/') && !meta.is_dir() {
        debug!("trailing slash on a non-directory");
        return Err(ServerError::NotFound(path.to_owned()));
    }
    if !meta.is_dir() && !meta.is_file() {
        return Err(ServerError::NotImplemented(path.to_owned()));
    }
    Ok(Metadata::from(&meta))
}

fn metadata_headers(meta: &Metadata) -> HeaderMap {
    let mut headers = HeaderMap::new();
    meta.write_headers(&mut headers);
    headers
}

async fn head(store: &Store, path: &str) -> Result<Response, ServerError> {
    let meta = stat_entry(store, path).await?;
    Ok((StatusCode::OK, metadata_headers(&meta)).into_response())
}

/// Serve a file body or a directory listing without disturbing the entry's times.
///
/// Metadata is taken first and no body I/O happens if that fails. Reading bumps the access time,
/// so once the read has finished the times captured up front are written back.
async fn get(store: &Store, path: &str) -> Result<Response, ServerError> {
    let mut meta = stat_entry(store, path).await?;

    let body = if meta.is_dir {
        list(store, path).await.map(Bytes::from)
    } else {
        match store.resolve(path) {
            Ok(full) => tokio::fs::read(full).await.map(Bytes::from),
            Err(e) => Err(e),
        }
    };

    if let Err(e) = store.chtimes(path, meta.atime, meta.mtime).await {
        warn!(error = %e, "could not restore times after read");
    }

    let body = body.map_err(|e| ServerError::from_io(path, e))?;
    if !meta.is_dir {
        // The file may have changed size between the stat and the read.
        meta.size = body.len() as u64;
    }
    Ok((StatusCode::OK, metadata_headers(&meta), body).into_response())
}

async fn list(store: &Store, path: &str) -> std::io::Result<String> {
    let mut dir = store.read_dir(path).await?;
    let mut entries = Vec::new();
    while let Some(entry) = dir.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            debug!(name = ?entry.file_name(), "skipping non UTF-8 name");
            continue;
        };
        let meta = entry.metadata().await?;
        entries.push(ListingEntry {
            name,
            mode: meta.mode(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(wire::encode_listing(&entries))
}

/// Overwrite or create a file. The caller's mode and times are applied verbatim.
async fn put(
    store: &Store,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    if path.ends_with('/') {
        return Err(ServerError::BadRequest(format!(
            "{path} names a directory, PUT writes files"
        )));
    }
    let attrs = WriteAttrs::from_headers(headers)?;
    let written = body.len();
    store
        .replace(path, body, attrs.mode, attrs.atime, attrs.mtime)
        .await
        .map_err(|e| ServerError::from_io(path, e))?;
    debug!(written, "stored");
    Ok((StatusCode::OK, format!("wrote {written} bytes")).into_response())
}

/// Create a directory (trailing slash) or exclusively create a file.
async fn post(
    store: &Store,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let mode = wire::mode_from_headers(headers)?;
    let fail = |e: std::io::Error| ServerError::from_io(path, e);

    if path.ends_with('/') {
        store.mkdir(path, mode).await.map_err(fail)?;
        // The process umask applies to mkdir; the requested mode is what was asked for.
        store.chmod(path, mode).await.map_err(fail)?;
        return Ok((StatusCode::OK, "created").into_response());
    }

    let mut file = store
        .open_file(
            path,
            tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode),
        )
        .await
        .map_err(fail)?;
    file.write_all(&body).await.map_err(fail)?;
    file.flush().await.map_err(fail)?;
    drop(file);
    store.chmod(path, mode).await.map_err(fail)?;
    Ok((StatusCode::OK, format!("wrote {} bytes", body.len())).into_response())
}

async fn delete(store: &Store, path: &str) -> Result<Response, ServerError> {
    if crate::fs::is_root(path) {
        return Err(ServerError::Forbidden(path.to_owned()));
    }
    if path.ends_with('/') {
        stat_entry(store, path).await?;
    }
    store
        .remove(path)
        .await
        .map_err(|e| ServerError::from_io(path, e))?;
    Ok((StatusCode::OK, "deleted").into_response())
}
