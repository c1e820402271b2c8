//! The cache eviction daemon.
//!
//! The daemon periodically measures the cache and, when it exceeds its budget, asks the
//! reclamation hook to free space. The hook currently frees nothing. What is in place is the
//! lock table: every open handle pins its path so that any future reclamation policy can skip
//! files that are in use.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytesize::ByteSize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Budget used when none is configured.
pub const DEFAULT_MAX_SIZE: ByteSize = ByteSize::gb(16);

/// How often the cache is measured when not configured otherwise.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Result of one measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Bytes used by cached files.
    pub usage: ByteSize,
    /// Whether `usage` exceeds the budget.
    pub over_budget: bool,
    /// Bytes the reclamation hook freed.
    pub reclaimed: ByteSize,
}

/// Size accounting and in-use tracking for one cache root.
#[derive(Debug)]
pub struct EvictionDaemon {
    root: PathBuf,
    max_size: ByteSize,
    /// path -> number of outstanding locks
    locks: scc::HashMap<String, usize>,
}

impl EvictionDaemon {
    /// A daemon for the cache rooted at `root`, budgeted at `max_size`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, max_size: ByteSize) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            max_size,
            locks: scc::HashMap::new(),
        })
    }

    /// Mark `path` as in use. Locks nest.
    pub fn lock(&self, path: &str) {
        match self.locks.entry_sync(path.to_owned()) {
            scc::hash_map::Entry::Occupied(mut occ) => *occ.get_mut() += 1,
            scc::hash_map::Entry::Vacant(vac) => {
                vac.insert_entry(1);
            }
        }
    }

    /// Release one lock on `path`.
    pub fn unlock(&self, path: &str) {
        match self.locks.entry_sync(path.to_owned()) {
            scc::hash_map::Entry::Occupied(mut occ) => {
                if *occ.get() <= 1 {
                    let _ = occ.remove();
                } else {
                    *occ.get_mut() -= 1;
                }
            }
            scc::hash_map::Entry::Vacant(_) => {
                warn!(path, "unlock of a path that was not locked. This is a programming bug");
            }
        }
    }

    /// Whether any lock on `path` is outstanding.
    #[must_use]
    pub fn is_locked(&self, path: &str) -> bool {
        self.locks.contains_sync(path)
    }

    /// Measure the cache once and reclaim if it is over budget.
    pub async fn scan(&self) -> std::io::Result<ScanReport> {
        let usage = ByteSize::b(crate::io::disk_usage(&self.root).await?);
        let over_budget = usage > self.max_size;
        let reclaimed = if over_budget {
            info!(%usage, budget = %self.max_size, "cache is over budget");
            self.reclaim(usage.as_u64() - self.max_size.as_u64())
        } else {
            debug!(%usage, budget = %self.max_size, "cache is within budget");
            ByteSize::b(0)
        };
        Ok(ScanReport {
            usage,
            over_budget,
            reclaimed,
        })
    }

    /// Reclamation hook. No eviction policy is implemented, so nothing is freed.
    fn reclaim(&self, wanted: u64) -> ByteSize {
        debug!(
            wanted,
            pinned = self.locks.len(),
            "no eviction policy configured, not reclaiming"
        );
        ByteSize::b(0)
    }

    /// Start measuring every `interval` on `handle`. Measurement stops when the task is dropped.
    #[must_use]
    pub fn spawn(
        self: &Arc<Self>,
        handle: &tokio::runtime::Handle,
        interval: Duration,
    ) -> EvictionTask {
        let daemon = Arc::clone(self);
        let join = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = daemon.scan().await {
                    warn!(error = %e, root = %daemon.root.display(), "cache scan failed");
                }
            }
        });
        EvictionTask { join }
    }
}

/// The running measurement loop. Aborted on drop.
#[derive(Debug)]
pub struct EvictionTask {
    join: JoinHandle<()>,
}

impl Drop for EvictionTask {
    fn drop(&mut self) {
        self.join.abort();
    }
}
