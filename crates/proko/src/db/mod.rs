//! SQLite persistence for job records, artifacts and run history.
//!
//! One rusqlite connection per process, shared behind a mutex. Schema
//! changes live in `sql/` and are applied by [`migrations`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

pub mod artifact_repo;
pub mod error;
pub mod history_repo;
pub mod job_repo;
pub mod migrations;

pub use error::DatabaseError;

/// Shared handle to the job database. Clones refer to the same connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens the database file, creating it and its parent directories if
    /// needed, and brings the schema up to date.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| DatabaseError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        // Readers (status polling) must not wait on the runner's writes.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Self::prepare(conn)?;
        log::debug!("Job database at {} is up to date", path.display());
        Ok(db)
    }

    /// A private, throwaway database. Used by tests and by embedders that do
    /// not need records to survive a restart.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self, DatabaseError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::run_all(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with exclusive access to the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }
}

/// `~/.proko/data/proko.db`, or `None` without a home directory.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".proko").join("data").join("proko.db"))
}

/// Timestamps are stored as RFC 3339 text in every table.
pub(crate) fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parses a stored timestamp. Unreadable values become "now" so a damaged
/// row reads as fresh rather than failing the whole load.
pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(e) => {
            log::warn!("Unreadable stored timestamp '{}': {}", s, e);
            Utc::now()
        }
    }
}
