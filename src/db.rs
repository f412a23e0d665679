//! Database module for ClinicTrack
//!
//! Owns the SQLite connection lifecycle (open -> in-use -> closed) and the
//! persisted maintenance metadata table. The backup/restore manager relies on
//! [`DbHandle`] to close the connection before touching the files on disk and
//! to reopen it afterwards; nothing else in the crate holds an ambient
//! connection.

use crate::catalog::ResolveError;
use crate::steps::StepError;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Result as SqliteResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Primary database file name.
pub const DB_FILE_NAME: &str = "clinictrack.db";

/// Meta key holding the persisted schema version marker.
pub const META_SCHEMA_VERSION: &str = "schema_version";
/// Meta key recording the last applied migration edge (`"<from>_to_<to>"`).
pub const META_LAST_MIGRATION: &str = "last_migration";
/// Meta key recording the last completed maintenance run.
pub const META_LAST_MAINTENANCE: &str = "last_maintenance";
/// Meta key set when corruption was detected and could not be repaired.
pub const META_CORRUPTION_DETECTED: &str = "db_corruption_detected";
/// Meta key set when a REINDEX recovery brought the store back to "ok".
pub const META_RECOVERY_SUCCESS: &str = "db_recovery_success";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Migration {edge} failed: {source}")]
    Migration {
        edge: String,
        #[source]
        source: StepError,
    },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("Invalid schema version marker: {0}")]
    InvalidVersionMarker(String),
    #[error("Database connection is closed")]
    Closed,
}

/// Owned connection to the ClinicTrack store.
pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    /// Open or create the database at `path` and ensure the meta table exists.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.ensure_meta_table()?;
        Ok(db)
    }

    fn ensure_meta_table(&self) -> Result<(), DbError> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Get inner connection reference
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Path of the primary database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a maintenance metadata record (key, value, timestamp).
    pub fn set_meta(&self, key: &str, value: &str) -> Result<(), DbError> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value, updated_at) VALUES (?, ?, ?)",
            params![key, value, now],
        )?;
        Ok(())
    }

    /// Read a maintenance metadata value, `None` when the key was never set.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>, DbError> {
        let value: SqliteResult<String> = self.conn.query_row(
            "SELECT value FROM meta WHERE key = ?",
            [key],
            |row| row.get(0),
        );
        match value {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    /// Timestamp of the last write to a metadata key.
    pub fn meta_timestamp(&self, key: &str) -> Result<Option<String>, DbError> {
        let value: SqliteResult<String> = self.conn.query_row(
            "SELECT updated_at FROM meta WHERE key = ?",
            [key],
            |row| row.get(0),
        );
        match value {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    /// Current persisted schema version, 0 for a fresh (never migrated) store.
    pub fn schema_version(&self) -> Result<u32, DbError> {
        match self.get_meta(META_SCHEMA_VERSION)? {
            Some(v) => v
                .parse()
                .map_err(|_| DbError::InvalidVersionMarker(v)),
            None => Ok(0),
        }
    }

    /// Persist the schema version marker.
    pub fn set_schema_version(&self, version: u32) -> Result<(), DbError> {
        self.set_meta(META_SCHEMA_VERSION, &version.to_string())
    }

    /// Flush the write-ahead log into the primary file before file-level copies.
    pub fn checkpoint(&self) -> Result<(), DbError> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

/// Shared handle around the single owned [`Database`] connection.
///
/// Backup and restore close the connection through this handle so the files
/// on disk are quiescent, then reopen it in a guaranteed step. Regular
/// callers go through [`DbHandle::with`] and get [`DbError::Closed`] while a
/// file-level operation is in flight.
#[derive(Clone, Default)]
pub struct DbHandle {
    inner: Arc<Mutex<Option<Database>>>,
}

impl DbHandle {
    /// Open the database at `path` and wrap it in a handle.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        Ok(Self {
            inner: Arc::new(Mutex::new(Some(Database::open(path)?))),
        })
    }

    /// Run `f` against the open database.
    pub fn with<R>(&self, f: impl FnOnce(&Database) -> Result<R, DbError>) -> Result<R, DbError> {
        let guard = self.inner.lock();
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(DbError::Closed),
        }
    }

    /// Close the connection, leaving the files on disk quiescent.
    pub fn close(&self) {
        let mut guard = self.inner.lock();
        if guard.take().is_some() {
            tracing::info!("database connection closed");
        }
    }

    /// Reopen the connection at `path`, replacing any previous one.
    pub fn reopen(&self, path: &Path) -> Result<(), DbError> {
        let mut guard = self.inner.lock();
        *guard = Some(Database::open(path)?);
        tracing::info!("database connection reopened at {:?}", path);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().is_some()
    }
}

/// Get the application data directory
pub fn get_app_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ClinicTrack")
}

/// Get database path
pub fn get_db_path() -> PathBuf {
    get_app_data_dir().join(DB_FILE_NAME)
}

/// Get backups directory
pub fn get_backups_dir() -> PathBuf {
    get_app_data_dir().join("backups")
}

/// Get preferences directory (auxiliary XML preference files)
pub fn get_preferences_dir() -> PathBuf {
    get_app_data_dir().join("preferences")
}
