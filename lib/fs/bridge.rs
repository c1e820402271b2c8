//! Inode number to path mapping.
//!
//! The kernel addresses entries by inode number; the adapter addresses them by path. A
//! [`PathBridge`] hands out stable inode numbers for paths and keeps kernel lookup counts so
//! numbers can be dropped once the kernel forgets them.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::fs::InodeAddr;

/// The root directory's inode number.
pub const ROOT_INO: InodeAddr = 1;

#[derive(Debug, Clone)]
struct Slot {
    path: String,
    lookups: u64,
}

/// Bidirectional inode/path mapping.
///
/// Uses two concurrent `scc::HashMap`s for lock-free reads. Mutations that touch both maps are
/// serialized by a `Mutex<()>` so the maps never disagree.
#[derive(Debug)]
pub struct PathBridge {
    /// ino -> path
    by_ino: scc::HashMap<InodeAddr, Slot>,
    /// path -> ino
    by_path: scc::HashMap<String, InodeAddr>,
    next_ino: AtomicU64,
    /// Serializes mutations that touch both maps.
    mu: Mutex<()>,
}

impl PathBridge {
    /// A bridge knowing only the root.
    #[must_use]
    pub fn new() -> Self {
        let bridge = Self {
            by_ino: scc::HashMap::new(),
            by_path: scc::HashMap::new(),
            next_ino: AtomicU64::new(ROOT_INO + 1),
            mu: Mutex::new(()),
        };
        let _ = bridge.by_ino.insert_sync(
            ROOT_INO,
            Slot {
                path: "/".to_owned(),
                lookups: 1,
            },
        );
        let _ = bridge.by_path.insert_sync("/".to_owned(), ROOT_INO);
        bridge
    }

    /// The path for `ino`.
    #[must_use]
    pub fn path(&self, ino: InodeAddr) -> Option<String> {
        self.by_ino.read_sync(&ino, |_, slot| slot.path.clone())
    }

    /// The inode number for `path`, if one was handed out.
    #[must_use]
    pub fn ino(&self, path: &str) -> Option<InodeAddr> {
        self.by_path.read_sync(path, |_, &ino| ino)
    }

    /// The path of `name` inside directory `parent`.
    #[must_use]
    pub fn child_path(&self, parent: InodeAddr, name: &str) -> Option<String> {
        self.path(parent).map(|p| super::join(&p, name))
    }

    /// The inode number for `path`, allocating one if needed, without counting a lookup.
    pub fn ino_or_insert(&self, path: &str) -> InodeAddr {
        let _guard = self
            .mu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.ino_or_insert_locked(path)
    }

    fn ino_or_insert_locked(&self, path: &str) -> InodeAddr {
        match self.by_path.entry_sync(path.to_owned()) {
            scc::hash_map::Entry::Occupied(occ) => *occ.get(),
            scc::hash_map::Entry::Vacant(vac) => {
                let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
                vac.insert_entry(ino);
                let _ = self.by_ino.insert_sync(
                    ino,
                    Slot {
                        path: path.to_owned(),
                        lookups: 0,
                    },
                );
                ino
            }
        }
    }

    /// Like [`ino_or_insert`](Self::ino_or_insert), but counts one kernel lookup.
    pub fn lookup(&self, path: &str) -> InodeAddr {
        let _guard = self
            .mu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let ino = self.ino_or_insert_locked(path);
        self.by_ino.update_sync(&ino, |_, slot| slot.lookups += 1);
        ino
    }

    /// Drop `nlookup` kernel references to `ino`, forgetting it once none remain.
    pub fn forget(&self, ino: InodeAddr, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let _guard = self
            .mu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let forgotten = self
            .by_ino
            .update_sync(&ino, |_, slot| {
                slot.lookups = slot.lookups.saturating_sub(nlookup);
                (slot.lookups == 0).then(|| slot.path.clone())
            })
            .flatten();
        if let Some(path) = forgotten {
            self.by_ino.remove_sync(&ino);
            self.by_path.remove_if_sync(&path, |mapped| *mapped == ino);
        }
    }

    /// Point the inode of `from` at `to`. Any inode previously at `to` loses its path.
    pub fn rename(&self, from: &str, to: &str) {
        let _guard = self
            .mu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some((_, displaced)) = self.by_path.remove_sync(to) {
            self.by_ino.remove_sync(&displaced);
        }
        if let Some((_, ino)) = self.by_path.remove_sync(from) {
            let _ = self.by_path.insert_sync(to.to_owned(), ino);
            self.by_ino
                .update_sync(&ino, |_, slot| slot.path = to.to_owned());
        }
    }

    /// Detach `path` from its inode after the entry was deleted.
    pub fn remove(&self, path: &str) {
        if super::is_root(path) {
            return;
        }
        let _guard = self
            .mu
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some((_, ino)) = self.by_path.remove_sync(path) {
            self.by_ino.remove_sync(&ino);
        }
    }
}

impl Default for PathBridge {
    fn default() -> Self {
        Self::new()
    }
}
