//! SQLite substrate shared by the local store, the outbox and the cursors.
//!
//! All three live in one database file so that a restart sees a single
//! consistent picture of materialized rows, queued mutations and stream
//! positions.

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use tidesync_common::{Error, ReplicaId, Result, Version};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    collection TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    fields TEXT NOT NULL,
    version INTEGER NOT NULL,
    remote_version INTEGER NOT NULL,
    tombstone INTEGER NOT NULL,
    confirmed TEXT,
    PRIMARY KEY (collection, entity_id)
);

CREATE TABLE IF NOT EXISTS outbox (
    mutation_id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    op TEXT NOT NULL,
    field_patch TEXT NOT NULL,
    base_version INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    submitted_at TEXT NOT NULL,
    origin TEXT NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    acked_version INTEGER
);

CREATE INDEX IF NOT EXISTS idx_outbox_entity
    ON outbox(collection, entity_id, mutation_id);

CREATE TABLE IF NOT EXISTS cursors (
    collection TEXT PRIMARY KEY,
    token TEXT,
    watermark INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const META_REPLICA_ID: &str = "replica_id";
const META_SERVER_TIME: &str = "server_time";

/// Map a SQLite error onto the storage error taxonomy.
pub(crate) fn map_sqlite(err: rusqlite::Error) -> Error {
    match err.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => Error::StorageFull(err.to_string()),
        Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
            Error::StorageCorrupt(err.to_string())
        }
        _ => Error::Storage(err.to_string()),
    }
}

/// Durable storage handle.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Create or open a database file.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path).map_err(map_sqlite)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")
            .map_err(map_sqlite)?;
        let db = Self::init(conn, Some(path))?;
        info!("Database opened at {:?}", db.path);
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(map_sqlite)?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(map_sqlite)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Location of the database file, `None` when in memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("Database lock poisoned".to_string()))
    }

    /// Run a closure against the connection.
    ///
    /// The connection lock is held only for the duration of the closure;
    /// callers must not await inside it.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn()?;
        f(&conn).map_err(map_sqlite)
    }

    /// Run a closure inside a transaction, committing on success.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(map_sqlite)?;
        let out = f(&tx)?;
        tx.commit().map_err(map_sqlite)?;
        Ok(out)
    }

    /// Get a metadata value.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
        })
    }

    /// Set a metadata value.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map(|_| ())
        })
    }

    /// Identity of this replica, generated on first use and then stable.
    pub fn replica_id(&self) -> Result<ReplicaId> {
        if let Some(id) = self.get_meta(META_REPLICA_ID)? {
            return ReplicaId::new(id);
        }
        let id = ReplicaId::generate();
        self.set_meta(META_REPLICA_ID, id.as_str())?;
        debug!("Generated replica id {}", id);
        Ok(id)
    }

    /// Highest server commit time seen so far.
    pub fn server_time(&self) -> Result<Version> {
        match self.get_meta(META_SERVER_TIME)? {
            Some(raw) => raw
                .parse::<u64>()
                .map(Version::new)
                .map_err(|e| Error::StorageCorrupt(format!("Bad server_time: {}", e))),
            None => Ok(Version::ZERO),
        }
    }

    /// Record an observed server commit time; the clock never moves back.
    pub fn observe_server_time(&self, seen: Version) -> Result<Version> {
        self.with_tx(|tx| {
            let current: Option<String> = tx
                .query_row(
                    "SELECT value FROM meta WHERE key = ?1",
                    [META_SERVER_TIME],
                    |row| row.get(0),
                )
                .optional()
                .map_err(map_sqlite)?;
            let current = current
                .and_then(|raw| raw.parse::<u64>().ok())
                .map(Version::new)
                .unwrap_or(Version::ZERO);
            let next = current.max(seen);
            if next > current {
                tx.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                    params![META_SERVER_TIME, next.get().to_string()],
                )
                .map_err(map_sqlite)?;
            }
            Ok(next)
        })
    }

    /// Logical time for a new local edit: just after everything observed.
    pub fn next_local_stamp(&self) -> Result<Version> {
        Ok(self.server_time()?.next())
    }

    /// Delete every row of every table. Used on sign-out.
    pub fn wipe(&self) -> Result<()> {
        info!("Wiping local database");
        self.with_conn(|conn| {
            conn.execute_batch(
                "DELETE FROM entities; DELETE FROM outbox; DELETE FROM cursors; DELETE FROM meta;",
            )
        })
    }
}
