//! Embedded SQLite event log.
//!
//! The database runs in WAL mode: one writer connection (behind a mutex) serves
//! appends, and every query opens its own read-only connection, so a long scan
//! never blocks producers. Queries are executed by SQLite itself.
//!
//! Appends run in an immediate transaction that reads the latest stamp before
//! inserting, so stamps stay ordered even with other processes writing the file.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, TransactionBehavior};

use super::{
    format_timestamp, next_stamp, parse_timestamp, BusProtocol, Cell, MessageBus, Record, Row,
};
use crate::{Error, Result};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        topic TEXT NOT NULL,
        key TEXT NOT NULL,
        created_at TEXT NOT NULL,
        value BLOB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS messages_topic_created_at ON messages (topic, created_at);
    CREATE INDEX IF NOT EXISTS messages_created_at ON messages (created_at);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-file-backed append-only log.
pub struct SqliteBus {
    path: PathBuf,
    writer: Mutex<Connection>,
}

impl SqliteBus {
    /// Open (or create) a log database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for in-memory paths (they cannot be shared between the
    /// writer and reader connections) and `Error::BackendUnavailable` if the file
    /// cannot be opened or initialised.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.as_os_str() == ":memory:" {
            return Err(Error::Config(
                "sqlite message bus needs a file path; use the memory protocol for in-process logs"
                    .to_string(),
            ));
        }

        let conn = Connection::open(&path).map_err(|e| {
            Error::BackendUnavailable(format!("failed to open {}: {e}", path.display()))
        })?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(unavailable)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(unavailable)?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(unavailable)?;
        conn.execute_batch(SCHEMA).map_err(|e| {
            Error::BackendUnavailable(format!(
                "failed to initialise log schema in {}: {e}",
                path.display()
            ))
        })?;

        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened sqlite message bus");
        Ok(Self {
            path,
            writer: Mutex::new(conn),
        })
    }

    /// Path of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn reader(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(unavailable)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(unavailable)?;
        Ok(conn)
    }
}

fn unavailable(err: rusqlite::Error) -> Error {
    Error::BackendUnavailable(err.to_string())
}

/// Busy/locked/IO failures are transient; everything else is the query's fault.
fn classify(err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
            ) =>
        {
            Error::BackendUnavailable(err.to_string())
        }
        _ => Error::Query(err.to_string()),
    }
}

const LATEST: &str = "SELECT MAX(created_at) FROM messages";

fn latest_stamp(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let text: Option<String> = conn
        .query_row(LATEST, [], |row| row.get(0))
        .map_err(classify)?;
    text.as_deref().map(parse_timestamp).transpose()
}

fn to_cell(value: ValueRef<'_>) -> Cell {
    match value {
        ValueRef::Null => Cell::Null,
        ValueRef::Integer(v) => Cell::Integer(v),
        ValueRef::Real(v) => Cell::Real(v),
        ValueRef::Text(v) => Cell::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Cell::Blob(v.to_vec()),
    }
}

impl MessageBus for SqliteBus {
    fn protocol(&self) -> BusProtocol {
        BusProtocol::Sqlite
    }

    fn append(
        &self,
        topic: &str,
        key: &str,
        value: Vec<u8>,
        at: Option<DateTime<Utc>>,
    ) -> Result<Record> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = writer
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;
        let created_at = next_stamp(at, latest_stamp(&tx)?)?;
        tx.execute(
            "INSERT INTO messages (topic, key, created_at, value) VALUES (?1, ?2, ?3, ?4)",
            params![topic, key, format_timestamp(created_at), value],
        )
        .map_err(unavailable)?;
        let id = u64::try_from(tx.last_insert_rowid()).unwrap_or_default();
        tx.commit().map_err(unavailable)?;

        Ok(Record {
            id,
            topic: topic.to_string(),
            key: key.to_string(),
            created_at,
            value,
        })
    }

    fn query(&self, sql: &str) -> Result<Vec<Row>> {
        if sql.trim().is_empty() {
            return Err(Error::Query("empty query".to_string()));
        }

        let conn = self.reader()?;
        let mut stmt = conn.prepare(sql).map_err(classify)?;
        if !stmt.readonly() {
            return Err(Error::Query(
                "only read-only statements may be run against the log".to_string(),
            ));
        }

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query([]).map_err(classify)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(classify)? {
            let mut cells = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                cells.push(to_cell(row.get_ref(i).map_err(classify)?));
            }
            out.push(Row::new(columns.clone(), cells));
        }
        Ok(out)
    }

    fn len(&self) -> Result<u64> {
        let conn = self.reader()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .map_err(classify)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn latest(&self) -> Result<Option<DateTime<Utc>>> {
        latest_stamp(&self.reader()?)
    }
}
