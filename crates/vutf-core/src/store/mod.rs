//! Per-user memory store.
//!
//! Each user owns exactly one SQLite file. The file is opened with an
//! exclusive locking mode so that a second writer, in this process or any
//! other, is refused with `StoreBusy` instead of quietly working against a
//! different copy of the data.
//!
//! Handles are created and owned by the [`ConnectionManager`]; everything
//! else borrows them through an `Arc`.
//!
//! [`ConnectionManager`]: crate::connection::ConnectionManager

pub mod migrations;
mod queries;

pub use queries::{ExecutionFilters, PromptResultRow, StoredOrchestratorConfig};

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// A durable connection to one user's store
pub struct MemoryStoreHandle {
    path: PathBuf,
    opened_at: DateTime<Utc>,
    conn: Mutex<Option<Connection>>,
    ref_count: AtomicUsize,
    last_used: Mutex<Instant>,
}

impl std::fmt::Debug for MemoryStoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStoreHandle")
            .field("path", &self.path)
            .field("opened_at", &self.opened_at)
            .field("ref_count", &self.ref_count())
            .field("open", &self.is_open())
            .finish()
    }
}

impl MemoryStoreHandle {
    /// Open the store at `path` and take its writer lock.
    ///
    /// Lock contention maps to [`Error::StoreBusy`]; the caller is expected
    /// to back off and retry the same path.
    pub(crate) fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let mut conn = Connection::open(path).map_err(|e| Error::from_sqlite(path, e))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| Error::from_sqlite(path, e))?;
        conn.execute_batch(
            "PRAGMA locking_mode=EXCLUSIVE; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )
        .map_err(|e| Error::from_sqlite(path, e))?;

        // Exclusive locking mode holds the lock from the first write onward.
        conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;")
            .map_err(|e| Error::from_sqlite(path, e))?;

        migrations::run_migrations(&mut conn).map_err(|e| match e {
            Error::Database(db) => Error::from_sqlite(path, db),
            other => other,
        })?;

        debug!(path = %path.display(), "Opened memory store");

        Ok(Self {
            path: path.to_path_buf(),
            opened_at: Utc::now(),
            conn: Mutex::new(Some(conn)),
            ref_count: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Time since the handle was last used or released
    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    pub(crate) fn retain(&self) -> usize {
        self.touch();
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn release(&self) -> usize {
        self.touch();
        let previous = self
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// Close the underlying connection, releasing the file lock.
    ///
    /// Returns false if it was already closed.
    pub(crate) fn close(&self) -> Result<bool> {
        let mut conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let was_open = conn.take().is_some();
        if was_open {
            debug!(path = %self.path.display(), "Closed memory store");
        }
        Ok(was_open)
    }

    /// Run `f` against the open connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let conn = guard.as_mut().ok_or_else(|| Error::StoreClosed {
            path: self.path.clone(),
        })?;
        self.touch();
        f(conn)
    }

    fn touch(&self) {
        if let Ok(mut t) = self.last_used.lock() {
            *t = Instant::now();
        }
    }
}
