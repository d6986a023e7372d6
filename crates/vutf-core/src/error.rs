//! Error types for vutf-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigValidationError;

/// Result type alias using vutf-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for orchestrator execution
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigValidationError),

    #[error("invalid orchestrator configuration: {0}")]
    InvalidOrchestrator(String),

    #[error("invalid user identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Store errors
    #[error("store is locked by another writer: {}", path.display())]
    StoreBusy { path: PathBuf },

    #[error("store handle already closed: {}", path.display())]
    StoreClosed { path: PathBuf },

    #[error(
        "salt fingerprint mismatch in {}; changing the salt is a data migration",
        store_dir.display()
    )]
    SaltMismatch { store_dir: PathBuf },

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("lock poisoned")]
    LockPoisoned,

    // Lookup errors
    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: String, id: String },

    #[error("invalid execution transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err)
    }
}

impl Error {
    /// Create a not found error
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create an invalid orchestrator configuration error
    pub fn invalid_orchestrator(message: impl Into<String>) -> Self {
        Self::InvalidOrchestrator(message.into())
    }

    /// Map a SQLite error raised while opening or writing `path`, turning
    /// lock contention into `StoreBusy`.
    pub fn from_sqlite(path: &std::path::Path, err: rusqlite::Error) -> Self {
        if is_busy(&err) {
            Self::StoreBusy {
                path: path.to_path_buf(),
            }
        } else {
            Self::Database(err)
        }
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if the store was held by another writer
    pub fn is_store_busy(&self) -> bool {
        matches!(self, Self::StoreBusy { .. })
    }

    /// Configuration-level failures are rejected before any work is dispatched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::InvalidOrchestrator(_)
                | Self::InvalidIdentity(_)
                | Self::InvalidRequest(_)
        )
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}
