//! `SQLite`-backed storage, one connection per pooled handle.

use crate::email::EmailRecord;
use crate::store::{location_for, Backend, ListFilter, StorageError};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS emails (
        location TEXT PRIMARY KEY,
        id TEXT NOT NULL,
        day TEXT NOT NULL,
        sender TEXT NOT NULL,
        recipient TEXT NOT NULL,
        subject TEXT,
        received_at TEXT NOT NULL,
        record TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_emails_day ON emails(day);
";

/// Opens connections onto one database file. Cheap to clone; used as the
/// pool's handle factory.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Create the schema at `path` if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        let conn = store.connect()?;
        conn.execute_batch(SCHEMA)?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, StorageError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Ok(conn)
    }

    /// Open a new connection for the pool.
    pub fn backend(&self) -> Result<SqliteBackend, StorageError> {
        Ok(SqliteBackend {
            conn: Some(self.connect()?),
        })
    }
}

/// A single `SQLite` connection.
pub struct SqliteBackend {
    conn: Option<Connection>,
}

impl SqliteBackend {
    fn conn(&self) -> Result<&Connection, StorageError> {
        self.conn
            .as_ref()
            .ok_or_else(|| StorageError::Backend("connection closed".to_string()))
    }
}

impl Backend for SqliteBackend {
    fn store(&mut self, record: &EmailRecord) -> Result<String, StorageError> {
        let location = location_for(record);
        let json = serde_json::to_string(record)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO emails (location, id, day, sender, recipient, subject, received_at, record)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                location,
                record.id,
                record.received_at.format("%Y-%m-%d").to_string(),
                record.sender,
                record.recipient,
                record.subject,
                record.received_at.to_rfc3339(),
                json,
            ],
        )?;
        Ok(location)
    }

    fn retrieve(&mut self, location: &str) -> Result<EmailRecord, StorageError> {
        let json: Option<String> = self
            .conn()?
            .query_row(
                "SELECT record FROM emails WHERE location = ?",
                params![location],
                |row| row.get(0),
            )
            .optional()?;
        let json = json.ok_or_else(|| StorageError::NotFound(location.to_string()))?;
        Ok(serde_json::from_str(&json)?)
    }

    fn list(&mut self, filter: ListFilter) -> Result<Vec<String>, StorageError> {
        let conn = self.conn()?;
        let rows = match filter {
            ListFilter::All => {
                let mut stmt =
                    conn.prepare("SELECT location FROM emails ORDER BY received_at, rowid")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<String>>>()?
            }
            ListFilter::Day(day) => {
                let mut stmt = conn.prepare(
                    "SELECT location FROM emails WHERE day = ? ORDER BY received_at, rowid",
                )?;
                let rows =
                    stmt.query_map(params![day.format("%Y-%m-%d").to_string()], |row| row.get(0))?;
                rows.collect::<rusqlite::Result<Vec<String>>>()?
            }
        };
        Ok(rows)
    }

    fn delete(&mut self, location: &str) -> Result<(), StorageError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM emails WHERE location = ?", params![location])?;
        if removed == 0 {
            return Err(StorageError::NotFound(location.to_string()));
        }
        Ok(())
    }

    fn close(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        // Checkpoint WAL so the main database file is complete
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            tracing::warn!("SQLite checkpoint failed: {e}");
        }
        if let Err((_, e)) = conn.close() {
            tracing::warn!("SQLite close failed: {e}");
        }
    }
}

impl Drop for SqliteBackend {
    fn drop(&mut self) {
        self.close();
    }
}
