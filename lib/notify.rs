//! Fire-and-forget reporting of failures that cannot be returned to the caller.
//!
//! Some failures have no one to return to: a coherency check that fell back to the cache because
//! the remote was unreachable, or a close whose write-back failed after the kernel already
//! considered the file closed. These are sent to an [`AlertSink`], which never blocks and never
//! fails. A background worker drains the sink into the log.

use http::StatusCode;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Something the user should hear about.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Alert {
    /// The remote could not be reached; the cached copy was served instead.
    #[error("remote unreachable while checking {path}: {reason}")]
    RemoteUnreachable {
        /// Path being checked.
        path: String,
        /// Transport error text.
        reason: String,
    },

    /// The remote answered with a status the client does not understand.
    #[error("remote answered {status} while checking {path}")]
    UnexpectedStatus {
        /// Path being checked.
        path: String,
        /// The status it returned.
        status: StatusCode,
    },

    /// Local changes could not be pushed upstream on close.
    #[error("failed to push {path} upstream: {reason}")]
    WriteBackFailed {
        /// Path that was being written back.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// A remote delete failed; the local copy was removed anyway.
    #[error("failed to delete {path} upstream: {reason}")]
    RemoteDeleteFailed {
        /// Path being deleted.
        path: String,
        /// What went wrong.
        reason: String,
    },
}

/// Sending half of the alert channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AlertSink {
    tx: mpsc::UnboundedSender<Alert>,
}

impl AlertSink {
    /// A sink plus the receiver its alerts arrive on.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink whose alerts are logged by a worker spawned on `handle`.
    ///
    /// The worker exits once every clone of the sink is dropped.
    #[must_use]
    pub fn spawn_logging(handle: &tokio::runtime::Handle) -> Self {
        let (sink, mut rx) = Self::channel();
        handle.spawn(async move {
            while let Some(alert) = rx.recv().await {
                warn!(%alert, "restfs alert");
            }
            debug!("alert worker exiting");
        });
        sink
    }

    /// Queue an alert. Never blocks; silently drops the alert if the worker is gone.
    pub fn report(&self, alert: Alert) {
        if let Err(mpsc::error::SendError(alert)) = self.tx.send(alert) {
            debug!(%alert, "alert worker gone, dropping alert");
        }
    }
}
