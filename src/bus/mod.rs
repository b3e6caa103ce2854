//! Message bus: append-only event log behind a pluggable backend
//!
//! Every backend exposes the same log table:
//!
//! ```text
//! messages(id INTEGER, topic TEXT, key TEXT, created_at TEXT, value BLOB)
//! ```
//!
//! `created_at` is stored as fixed-width RFC 3339 text with microsecond precision
//! (`2024-05-01T12:00:00.000000Z`), so lexicographic order equals chronological order
//! in every backend and `WHERE created_at > '…'` behaves identically. Stamps are
//! limited to years 0000-9999 to keep the width fixed.
//!
//! Records appended without an explicit time are stamped inside the backend's write
//! critical section and strictly after every stamp already in the log, so a reader
//! that has seen the log up to time `t` will only ever find later records above `t`.
//!
//! # Example
//!
//! ```rust
//! use beaver::bus::{MemoryBus, MessageBus};
//!
//! # fn main() -> beaver::Result<()> {
//! let bus = MemoryBus::new();
//! bus.append("clicks", "user-1", br#"{"x": 1.0}"#.to_vec(), None)?;
//!
//! let rows = bus.query("SELECT key, value FROM messages WHERE topic = 'clicks'")?;
//! assert_eq!(rows.len(), 1);
//! # Ok(())
//! # }
//! ```

mod memory;
mod sqlite;

pub use memory::MemoryBus;
pub use sqlite::SqliteBus;

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::EntityKind;
use crate::{Error, Result};

/// Column names of the log table, in schema order
pub const LOG_COLUMNS: [&str; 5] = ["id", "topic", "key", "created_at", "value"];

/// Format a timestamp the way every backend stores `created_at`.
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored `created_at` value.
///
/// Only the stored form is accepted (UTC, `Z` suffix, six fractional digits), since
/// view cursors are compared against it as text.
///
/// # Errors
///
/// Returns `Error::Query` if the text is not RFC 3339 or not in the stored form.
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    let ts = DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Query(format!("invalid timestamp '{text}': {e}")))?;
    let canonical = format_timestamp(ts);
    if canonical != text {
        return Err(Error::Query(format!(
            "timestamp '{text}' is not in stored form; project created_at as-is (expected '{canonical}')"
        )));
    }
    Ok(ts)
}

/// Truncate to the precision the log stores.
pub(crate) fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

/// Pick the stamp for a record being appended. Must be called under the backend's
/// write lock with `latest` being the highest stamp already in the log.
///
/// Explicit times are kept as given; default stamps are strictly after `latest`.
pub(crate) fn next_stamp(
    at: Option<DateTime<Utc>>,
    latest: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>> {
    let stamp = match at {
        Some(at) => truncate_micros(at),
        None => {
            let now = truncate_micros(Utc::now());
            match latest {
                Some(latest) if now <= latest => latest + Duration::microseconds(1),
                _ => now,
            }
        }
    };
    if !(0..=9999).contains(&stamp.year()) {
        return Err(Error::Validation(format!(
            "record time {stamp} is outside years 0000-9999"
        )));
    }
    Ok(stamp)
}

/// A record in the event log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Append sequence assigned by the backend (tie-breaker for equal timestamps)
    pub id: u64,
    /// Topic (log partition)
    pub topic: String,
    /// Record key
    pub key: String,
    /// Event time
    pub created_at: DateTime<Utc>,
    /// Opaque payload
    pub value: Vec<u8>,
}

impl Record {
    /// Render the record as a row of the log table.
    #[must_use]
    pub fn to_row(&self) -> Row {
        Row::new(
            LOG_COLUMNS.iter().map(ToString::to_string).collect(),
            vec![
                Cell::Integer(i64::try_from(self.id).unwrap_or(i64::MAX)),
                Cell::Text(self.topic.clone()),
                Cell::Text(self.key.clone()),
                Cell::Text(format_timestamp(self.created_at)),
                Cell::Blob(self.value.clone()),
            ],
        )
    }
}

/// A single value in a query result.
///
/// Mirrors SQLite's storage classes so both backends produce identical rows.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    /// SQL NULL
    Null,
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit float
    Real(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Blob(Vec<u8>),
}

impl Cell {
    /// SQLite storage class rank: NULL < numeric < text < blob
    const fn class_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Integer(_) | Self::Real(_) => 1,
            Self::Text(_) => 2,
            Self::Blob(_) => 3,
        }
    }

    /// Total order used for comparisons and ORDER BY (SQLite BINARY collation).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sql_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Integer(a), Self::Real(b)) => (*a as f64).total_cmp(b),
            (Self::Real(a), Self::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Self::Real(a), Self::Real(b)) => a.total_cmp(b),
            (Self::Text(a), Self::Text(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Self::Blob(a), Self::Blob(b)) => a.cmp(b),
            _ => self.class_rank().cmp(&other.class_rank()),
        }
    }

    /// Truthiness in a WHERE clause. NULL is `None`.
    #[must_use]
    pub fn truthy(&self) -> Option<bool> {
        match self {
            Self::Null => None,
            Self::Integer(v) => Some(*v != 0),
            Self::Real(v) => Some(*v != 0.0),
            Self::Text(v) => Some(v.trim().parse::<f64>().is_ok_and(|n| n != 0.0)),
            Self::Blob(_) => Some(false),
        }
    }

    /// Text rendering used when a cell is projected as a key.
    #[must_use]
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Integer(v) => Some(v.to_string()),
            Self::Real(v) => Some(v.to_string()),
            Self::Text(v) => Some(v.clone()),
            Self::Blob(v) => String::from_utf8(v.clone()).ok(),
        }
    }

    /// Byte rendering used when a cell is projected as a value.
    #[must_use]
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Self::Null => None,
            Self::Integer(v) => Some(v.to_string().into_bytes()),
            Self::Real(v) => Some(v.to_string().into_bytes()),
            Self::Text(v) => Some(v.into_bytes()),
            Self::Blob(v) => Some(v),
        }
    }
}

/// A query result row: column names paired with cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    cells: Vec<Cell>,
}

impl Row {
    /// Create a row. `columns` and `cells` must have the same length.
    #[must_use]
    pub fn new(columns: Vec<String>, cells: Vec<Cell>) -> Self {
        debug_assert_eq!(columns.len(), cells.len());
        Self { columns, cells }
    }

    /// Column names in projection order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Cells in projection order.
    #[must_use]
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Look up a cell by column name (ASCII case-insensitive, first match).
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .map(|i| &self.cells[i])
    }

    /// Remove and return a cell by column name.
    pub fn take(&mut self, column: &str) -> Option<Cell> {
        let i = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        Some(std::mem::replace(&mut self.cells[i], Cell::Null))
    }
}

/// Backend protocol identifier, declared when a bus is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusProtocol {
    /// In-process log; lost on restart
    Memory,
    /// Embedded SQLite file log
    Sqlite,
}

impl fmt::Display for BusProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Sqlite => f.write_str("sqlite"),
        }
    }
}

/// Append-only event log with a read-only query interface.
///
/// All backends must agree on ordering and durability: `append` returns only once
/// the record is visible to subsequent `query` calls on the same instance, and a
/// plain scan returns rows in append order.
pub trait MessageBus: Send + Sync {
    /// Protocol of this backend.
    fn protocol(&self) -> BusProtocol;

    /// Append a record. `at = None` stamps it with the current time, or just after the
    /// latest stamp in the log if the clock has not moved past it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if `at` is outside years 0000-9999 and
    /// `Error::BackendUnavailable` if the store cannot accept writes.
    fn append(
        &self,
        topic: &str,
        key: &str,
        value: Vec<u8>,
        at: Option<DateTime<Utc>>,
    ) -> Result<Record>;

    /// Execute a read-only query over the log table.
    ///
    /// # Errors
    ///
    /// Returns `Error::Query` for malformed or unsupported SQL and
    /// `Error::BackendUnavailable` if the store cannot be read.
    fn query(&self, sql: &str) -> Result<Vec<Row>>;

    /// Number of records in the log.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackendUnavailable` if the store cannot be read.
    fn len(&self) -> Result<u64>;

    /// Highest `created_at` in the log, or `None` when it is empty.
    ///
    /// Every record appended after this call without an explicit time is stamped
    /// strictly later than the returned value.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackendUnavailable` if the store cannot be read.
    fn latest(&self) -> Result<Option<DateTime<Utc>>>;

    /// Whether the log holds no records.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackendUnavailable` if the store cannot be read.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Open a backend for a protocol.
///
/// # Errors
///
/// Returns `Error::Config` when a SQLite bus has no url, or
/// `Error::BackendUnavailable` when the file cannot be opened.
pub fn open(protocol: BusProtocol, url: Option<&str>) -> Result<Arc<dyn MessageBus>> {
    match protocol {
        BusProtocol::Memory => Ok(Arc::new(MemoryBus::new())),
        BusProtocol::Sqlite => {
            let path = url.ok_or_else(|| {
                Error::Config("sqlite message bus requires a url (database file path)".to_string())
            })?;
            Ok(Arc::new(SqliteBus::open(path)?))
        }
    }
}

/// Named message buses, shared by every project that references them.
#[derive(Default)]
pub struct BusRegistry {
    buses: DashMap<String, Arc<dyn MessageBus>>,
}

impl fmt::Debug for BusRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl BusRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an already-open bus under `name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyExists` if the name is taken.
    pub fn insert(&self, name: impl Into<String>, bus: Arc<dyn MessageBus>) -> Result<()> {
        let name = name.into();
        match self.buses.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                Err(Error::already_exists(EntityKind::MessageBus, entry.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(bus);
                Ok(())
            }
        }
    }

    /// Open and register a bus.
    ///
    /// # Errors
    ///
    /// See [`open`] and [`BusRegistry::insert`].
    pub fn register(
        &self,
        name: impl Into<String>,
        protocol: BusProtocol,
        url: Option<&str>,
    ) -> Result<Arc<dyn MessageBus>> {
        let name = name.into();
        if self.buses.contains_key(&name) {
            return Err(Error::already_exists(EntityKind::MessageBus, name));
        }
        let bus = open(protocol, url)?;
        self.insert(name, Arc::clone(&bus))?;
        Ok(bus)
    }

    /// Look up a bus by name.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no bus is registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn MessageBus>> {
        self.buses
            .get(name)
            .map(|bus| Arc::clone(bus.value()))
            .ok_or_else(|| Error::not_found(EntityKind::MessageBus, name))
    }

    /// Names of all registered buses, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buses.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_text_is_fixed_width() {
        let early = DateTime::from_timestamp(1, 0).unwrap();
        let late = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();

        let a = format_timestamp(early);
        let b = format_timestamp(late);

        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(b, "2023-11-14T22:13:20.123456Z");
        assert_eq!(parse_timestamp(&b).unwrap(), truncate_micros(late));
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        let err = parse_timestamp("yesterday").unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }

    #[test]
    fn test_parse_timestamp_rejects_non_stored_forms() {
        for text in [
            "2023-11-14T23:13:20.123456+01:00",
            "2023-11-14T22:13:20Z",
            "2023-11-14T22:13:20.123Z",
        ] {
            let err = parse_timestamp(text).unwrap_err();
            assert!(err.to_string().contains("stored form"), "{text}");
        }
        assert!(parse_timestamp("2023-11-14T22:13:20.123000Z").is_ok());
    }

    #[test]
    fn test_default_stamps_never_go_backwards() {
        let ahead = truncate_micros(Utc::now() + Duration::hours(1));
        let stamp = next_stamp(None, Some(ahead)).unwrap();
        assert_eq!(stamp, ahead + Duration::microseconds(1));

        let stamp = next_stamp(None, None).unwrap();
        assert!(stamp <= Utc::now());

        // Explicit times are taken as given
        let past = DateTime::from_timestamp(1, 0).unwrap();
        assert_eq!(next_stamp(Some(past), Some(ahead)).unwrap(), past);
    }

    #[test]
    fn test_stamps_outside_four_digit_years_rejected() {
        let far = DateTime::from_timestamp(300_000_000_000, 0).unwrap();
        let err = next_stamp(Some(far), None).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_cell_ordering_follows_storage_classes() {
        assert_eq!(Cell::Null.sql_cmp(&Cell::Integer(0)), Ordering::Less);
        assert_eq!(Cell::Integer(10).sql_cmp(&Cell::Text("1".into())), Ordering::Less);
        assert_eq!(Cell::Text("z".into()).sql_cmp(&Cell::Blob(vec![0])), Ordering::Less);
        assert_eq!(Cell::Integer(2).sql_cmp(&Cell::Real(1.5)), Ordering::Greater);
        assert_eq!(
            Cell::Text("a".into()).sql_cmp(&Cell::Text("b".into())),
            Ordering::Less
        );
    }

    #[test]
    fn test_row_lookup_case_insensitive() {
        let mut row = Row::new(
            vec!["Key".to_string(), "value".to_string()],
            vec![Cell::Text("k".into()), Cell::Integer(1)],
        );
        assert_eq!(row.get("key"), Some(&Cell::Text("k".into())));
        assert_eq!(row.take("VALUE"), Some(Cell::Integer(1)));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let registry = BusRegistry::new();
        registry.register("mb", BusProtocol::Memory, None).unwrap();

        let err = registry.register("mb", BusProtocol::Memory, None).err().unwrap();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert!(registry.get("mb").is_ok());
        assert!(matches!(registry.get("other"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_sqlite_requires_url() {
        let err = open(BusProtocol::Sqlite, None).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
