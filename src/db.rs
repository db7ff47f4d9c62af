//! Database connection management, migrations, and error types.
//!
//! This module handles all SQLite connection setup with appropriate settings
//! for concurrent access (WAL mode, foreign keys, busy timeout), schema
//! versioning via migrations, the one-time initialization handle, and a unified
//! error type for the entire crate.

use crate::config::Config;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Central error type for the knowledge document model.
///
/// Uses `thiserror` for automatic `Error` trait implementation and `Display`
/// formatting. Includes conversions from common error types via `From` impls.
#[derive(Debug, Error)]
pub enum KbError {
    /// An id did not resolve to a live entity.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing required field, malformed reference, attempted cycle, or a
    /// sibling-set mismatch.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A concurrent structural change invalidated an operation's precondition.
    /// Retry with fresh data.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Underlying storage failure (I/O fault, constraint violation, busy).
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// I/O operation failed (directory creation, reading stdin, etc).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// One-time database initialization failed.
    #[error("Database initialization failed: {0}")]
    Init(String),
}

impl KbError {
    /// Stable machine-readable tag for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::Storage(_) => "storage",
            Self::Io(_) => "io",
            Self::Init(_) => "init",
        }
    }
}

/// Maps `QueryReturnedNoRows` to `NotFound` with the given message.
pub(crate) fn not_found(e: rusqlite::Error, what: impl FnOnce() -> String) -> KbError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => KbError::NotFound(what()),
        other => KbError::Storage(other),
    }
}

/// Returns the default path to the SQLite database file:
/// `~/.kbgraph/kbgraph.db`.
///
/// # Errors
///
/// Returns `KbError::Io` if the home directory cannot be determined.
pub fn default_db_path() -> Result<PathBuf, KbError> {
    let home = dirs::home_dir().ok_or_else(|| {
        KbError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine home directory",
        ))
    })?;
    Ok(home.join(".kbgraph").join("kbgraph.db"))
}

/// Opens a SQLite connection at the specified path with proper settings.
///
/// Configured for concurrent access from many operations:
/// - **WAL mode**: Readers see a snapshot and never block on the writer
/// - **Foreign keys**: Enabled for referential integrity
/// - **Busy timeout**: Waits for the single SQLite writer slot
///
/// Creates the parent directory if it doesn't exist.
///
/// # Errors
///
/// Returns `KbError::Storage` if the connection cannot be opened or configured.
pub fn open_connection_at(path: &Path, busy_timeout: Duration) -> Result<Connection, KbError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(busy_timeout)?;

    Ok(conn)
}

/// Runs all pending database migrations.
///
/// Migrations are applied transactionally and idempotently:
/// 1. Reads the current schema version from `schema_meta` (0 if the table doesn't exist)
/// 2. Runs each embedded migration with version > current version, in order
/// 3. Each migration runs in its own transaction and bumps `schema_meta.version`
///
/// # Errors
///
/// Returns `KbError::Storage` if a migration fails; that migration is rolled back.
pub fn run_migrations(conn: &mut Connection) -> Result<(), KbError> {
    let current_version: i64 = conn
        .query_row("SELECT version FROM schema_meta LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0); // Fresh database starts at version 0

    let migrations: [(i64, &str); 2] = [
        (1, include_str!("../migrations/001_initial.sql")),
        (2, include_str!("../migrations/002_sibling_order.sql")),
    ];

    for (target_version, sql) in migrations {
        if target_version > current_version {
            let tx = conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.commit()?;
            tracing::debug!(version = target_version, "applied migration");
        }
    }

    Ok(())
}

/// Explicit initialization handle for the database.
///
/// `Database::new` performs no I/O. The first call to [`Database::init`]
/// creates the file and runs migrations; every later or concurrent call
/// observes the same outcome. All connections are handed out through
/// [`Database::connect`], which initializes first.
#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    busy_timeout: Duration,
    ready: OnceLock<Result<(), String>>,
}

impl Database {
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.db_path.clone(),
            busy_timeout: config.busy_timeout,
            ready: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs one-time setup. Idempotent and safe to call from many threads;
    /// callers that race block until the first setup finishes and all receive
    /// its result.
    pub fn init(&self) -> Result<(), KbError> {
        let outcome = self.ready.get_or_init(|| {
            let setup = || -> Result<(), KbError> {
                let mut conn = open_connection_at(&self.path, self.busy_timeout)?;
                run_migrations(&mut conn)
            };
            setup().map_err(|e| {
                tracing::error!(path = %self.path.display(), error = %e, "database setup failed");
                e.to_string()
            })
        });
        outcome.clone().map_err(KbError::Init)
    }

    /// Opens a configured connection to an initialized database.
    pub fn connect(&self) -> Result<Connection, KbError> {
        self.init()?;
        open_connection_at(&self.path, self.busy_timeout)
    }
}

/// Opens an in-memory database with the full schema. Used by unit tests of
/// the repository layer.
#[cfg(test)]
pub(crate) fn open_in_memory() -> Connection {
    let mut conn = Connection::open_in_memory().expect("Failed to open in-memory DB");
    conn.pragma_update(None, "foreign_keys", "ON")
        .expect("Failed to enable foreign keys");
    run_migrations(&mut conn).expect("Migrations should succeed");
    conn
}
