//! ConnectionManager - one live store handle per path.
//!
//! Every path gets its own async lock, so opening or closing one user's
//! store never waits on another user's. Within a path, `acquire` waits for
//! any in-flight open or close to finish and then either reuses the live
//! handle or opens the single replacement.
//!
//! Handles are returned by reference (`Arc`); callers pair each `acquire`
//! with a `release`. There is no process-wide "current store".
//!
//! Bookkeeping for a path lives only as long as its handle: once the idle
//! sweep closes it (or an open failed) and nobody is waiting on the slot,
//! the path is forgotten.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::store::MemoryStoreHandle;

type Slot = Arc<AsyncMutex<Option<Arc<MemoryStoreHandle>>>>;

#[derive(Default)]
struct PathStats {
    opens: usize,
}

/// Owns at most one open [`MemoryStoreHandle`] per store path
pub struct ConnectionManager {
    slots: Mutex<HashMap<PathBuf, Slot>>,
    stats: Mutex<HashMap<PathBuf, PathStats>>,
    busy_timeout: Duration,
}

impl ConnectionManager {
    /// Create a new connection manager
    pub fn new(busy_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            busy_timeout,
        }
    }

    fn slot(&self, path: &Path) -> Result<Slot> {
        let mut slots = self.slots.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(slots.entry(path.to_path_buf()).or_default().clone())
    }

    /// Return the open handle for `path`, opening it if needed, and take a
    /// reference on it.
    ///
    /// Fails with [`Error::StoreBusy`] if another writer holds the file.
    pub async fn acquire(&self, path: &Path) -> Result<Arc<MemoryStoreHandle>> {
        let slot = self.slot(path)?;
        let mut current = slot.lock().await;

        if let Some(handle) = current.as_ref().filter(|h| h.is_open()) {
            let refs = handle.retain();
            debug!(path = %path.display(), refs, "Reusing memory store handle");
            return Ok(Arc::clone(handle));
        }

        let handle = Arc::new(MemoryStoreHandle::open(path, self.busy_timeout)?);
        handle.retain();
        *current = Some(Arc::clone(&handle));

        let opens = {
            let mut stats = self.stats.lock().map_err(|_| Error::LockPoisoned)?;
            let entry = stats.entry(path.to_path_buf()).or_default();
            entry.opens += 1;
            entry.opens
        };
        info!(path = %path.display(), opens, "Opened memory store handle");

        Ok(handle)
    }

    /// Drop a reference taken by `acquire`. The handle stays open so the
    /// next request for the same user does not pay for reopening it.
    pub fn release(&self, handle: &MemoryStoreHandle) {
        let refs = handle.release();
        debug!(path = %handle.path().display(), refs, "Released memory store handle");
    }

    /// Close handles that nobody references and that have been idle for
    /// longer than `max_idle`, then forget paths left without a handle.
    /// Returns how many were closed.
    pub async fn close_idle(&self, max_idle: Duration) -> Result<usize> {
        let slots: Vec<(PathBuf, Slot)> = {
            let slots = self.slots.lock().map_err(|_| Error::LockPoisoned)?;
            slots.iter().map(|(p, s)| (p.clone(), Arc::clone(s))).collect()
        };

        let mut closed = 0;
        let mut empty = Vec::new();
        for (path, slot) in slots {
            let mut current = slot.lock().await;
            let idle = match current.as_ref() {
                Some(h) => h.ref_count() == 0 && h.idle_for() > max_idle,
                None => false,
            };
            if idle {
                if let Some(handle) = current.take() {
                    if handle.close()? {
                        closed += 1;
                        info!(path = %path.display(), "Closed idle memory store handle");
                    }
                }
            }
            if current.is_none() {
                empty.push(path);
            }
        }

        self.forget(&empty)?;
        Ok(closed)
    }

    /// Drop slots and stats for `paths` whose slot is still empty and that
    /// no `acquire` is holding or waiting on.
    fn forget(&self, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut slots = self.slots.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stats = self.stats.lock().map_err(|_| Error::LockPoisoned)?;
        for path in paths {
            let unused = slots.get(path).is_some_and(|slot| {
                Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|h| h.is_none())
            });
            if unused {
                slots.remove(path);
                stats.remove(path);
                debug!(path = %path.display(), "Forgot closed memory store path");
            }
        }
        Ok(())
    }

    /// Paths with a live slot
    pub fn tracked_paths(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Close every handle regardless of references
    pub async fn close_all(&self) -> Result<usize> {
        let slots: Vec<Slot> = {
            let slots = self.slots.lock().map_err(|_| Error::LockPoisoned)?;
            slots.values().cloned().collect()
        };

        let mut closed = 0;
        for slot in slots {
            let mut current = slot.lock().await;
            if let Some(handle) = current.take() {
                if handle.close()? {
                    closed += 1;
                }
            }
        }
        Ok(closed)
    }

    /// Number of handles currently open
    pub async fn open_handles(&self) -> usize {
        let slots: Vec<Slot> = match self.slots.lock() {
            Ok(slots) => slots.values().cloned().collect(),
            Err(_) => return 0,
        };

        let mut open = 0;
        for slot in slots {
            if slot.lock().await.as_ref().is_some_and(|h| h.is_open()) {
                open += 1;
            }
        }
        open
    }

    /// How many times a handle was opened for `path` since the path was last
    /// forgotten
    pub fn open_count(&self, path: &Path) -> usize {
        self.stats
            .lock()
            .ok()
            .and_then(|s| s.get(path).map(|e| e.opens))
            .unwrap_or(0)
    }
}
