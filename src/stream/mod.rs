//! Stream processor: declarative views over the event log
//!
//! A [`ViewDefinition`] turns raw log rows into `(key, timestamp, value)` triples.
//! Each evaluation is a consistent snapshot of the log at call time, bounded by an
//! optional `since` cursor, sorted by timestamp, with one row per key.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::bus::{format_timestamp, parse_timestamp, Cell, MessageBus, Row};
use crate::{Error, Result};

/// Declares how to project log rows for one role (features or targets).
///
/// The timestamp field must carry the log's `created_at` unchanged; cursor bounds are
/// compared against it as stored text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    query: String,
    key_field: String,
    ts_field: String,
    value_field: String,
}

impl ViewDefinition {
    /// Create a view definition.
    #[must_use]
    pub fn new(
        query: impl Into<String>,
        key_field: impl Into<String>,
        ts_field: impl Into<String>,
        value_field: impl Into<String>,
    ) -> Self {
        Self {
            query: query.into(),
            key_field: key_field.into(),
            ts_field: ts_field.into(),
            value_field: value_field.into(),
        }
    }

    /// The conventional view over one topic:
    /// `SELECT key, created_at, value FROM messages WHERE topic = '<topic>'`.
    #[must_use]
    pub fn for_topic(topic: &str) -> Self {
        Self::new(
            format!(
                "SELECT key, created_at, value FROM messages WHERE topic = '{}'",
                topic.replace('\'', "''")
            ),
            "key",
            "created_at",
            "value",
        )
    }

    /// The view query.
    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Column holding the join key.
    #[must_use]
    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Column holding the event time.
    #[must_use]
    pub fn ts_field(&self) -> &str {
        &self.ts_field
    }

    /// Column holding the payload.
    #[must_use]
    pub fn value_field(&self) -> &str {
        &self.value_field
    }

    /// Check that the definition is usable before it is stored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the query or any field name is blank.
    pub fn validate(&self) -> Result<()> {
        for (what, value) in [
            ("query", &self.query),
            ("key_field", &self.key_field),
            ("ts_field", &self.ts_field),
            ("value_field", &self.value_field),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Validation(format!("view {what} must not be empty")));
            }
        }
        Ok(())
    }

    /// The view query restricted to `since < ts <= until`.
    fn bounded_query(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> String {
        let query = self.query.trim().trim_end_matches(';');
        let column = self.ts_field.replace('"', "\"\"");
        let bounds: Vec<String> = [(since, ">"), (until, "<=")]
            .into_iter()
            .filter_map(|(bound, op)| {
                bound.map(|ts| format!("\"{column}\" {op} '{}'", format_timestamp(ts)))
            })
            .collect();
        if bounds.is_empty() {
            query.to_string()
        } else {
            format!(
                "SELECT * FROM ({query}) AS bounded_view WHERE {}",
                bounds.join(" AND ")
            )
        }
    }
}

/// One projected view row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewRow {
    /// Join key
    pub key: String,
    /// Event time
    pub ts: DateTime<Utc>,
    /// Payload bytes
    pub value: Vec<u8>,
}

/// Snapshot result of one evaluation, in ascending timestamp order.
#[derive(Debug, Clone, Default)]
pub struct ViewRows {
    rows: std::vec::IntoIter<ViewRow>,
    high_water: Option<DateTime<Utc>>,
}

impl ViewRows {
    /// Latest timestamp in the snapshot, if any rows were returned.
    #[must_use]
    pub const fn high_water(&self) -> Option<DateTime<Utc>> {
        self.high_water
    }
}

impl Iterator for ViewRows {
    type Item = ViewRow;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for ViewRows {}

/// Evaluates views against a message bus. Holds no state between calls.
#[derive(Clone)]
pub struct StreamProcessor {
    bus: Arc<dyn MessageBus>,
}

impl StreamProcessor {
    /// Create a processor reading from `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Evaluate a view, optionally bounded to `timestamp > since`.
    ///
    /// Rows are sorted by timestamp (ties keep result order) and de-duplicated by
    /// key: the later timestamp wins, and among equal timestamps the last row in
    /// result order wins.
    ///
    /// # Errors
    ///
    /// Returns `Error::Query` when the query fails or a projected field is missing
    /// or malformed, and `Error::BackendUnavailable` when the bus cannot be read.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use beaver::bus::{MemoryBus, MessageBus};
    /// use beaver::stream::{StreamProcessor, ViewDefinition};
    ///
    /// # fn main() -> beaver::Result<()> {
    /// let bus = Arc::new(MemoryBus::new());
    /// bus.append("features", "a", b"1".to_vec(), None)?;
    /// bus.append("features", "a", b"2".to_vec(), None)?;
    ///
    /// let processor = StreamProcessor::new(bus);
    /// let rows: Vec<_> = processor.evaluate(&ViewDefinition::for_topic("features"), None)?.collect();
    /// assert_eq!(rows.len(), 1);
    /// assert_eq!(rows[0].value, b"2".to_vec());
    /// # Ok(())
    /// # }
    /// ```
    pub fn evaluate(
        &self,
        view: &ViewDefinition,
        since: Option<DateTime<Utc>>,
    ) -> Result<ViewRows> {
        self.evaluate_window(view, since, None)
    }

    /// Evaluate a view over `since < timestamp <= until`.
    ///
    /// Bounding several evaluations by the same `until` (typically the bus's
    /// [`latest`](MessageBus::latest) stamp) makes them agree on which records exist,
    /// even while producers keep appending.
    ///
    /// # Errors
    ///
    /// Same as [`evaluate`](Self::evaluate).
    pub fn evaluate_window(
        &self,
        view: &ViewDefinition,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<ViewRows> {
        let raw = self.bus.query(&view.bounded_query(since, until))?;

        let mut rows = Vec::with_capacity(raw.len());
        for row in raw {
            let projected = Self::project(view, row)?;
            let after = since.map_or(true, |since| projected.ts > since);
            let within = until.map_or(true, |until| projected.ts <= until);
            if after && within {
                rows.push(projected);
            }
        }

        // Stable: equal timestamps keep result (append) order
        rows.sort_by_key(|row| row.ts);

        let mut winner: FxHashMap<&str, usize> = FxHashMap::default();
        for (i, row) in rows.iter().enumerate() {
            winner.insert(row.key.as_str(), i);
        }
        let keep: Vec<bool> = (0..rows.len())
            .map(|i| winner.get(rows[i].key.as_str()) == Some(&i))
            .collect();
        let rows: Vec<ViewRow> = rows
            .into_iter()
            .zip(keep)
            .filter_map(|(row, keep)| keep.then_some(row))
            .collect();

        let high_water = rows.last().map(|row| row.ts);
        Ok(ViewRows {
            rows: rows.into_iter(),
            high_water,
        })
    }

    fn project(view: &ViewDefinition, mut row: Row) -> Result<ViewRow> {
        let key = match row.take(view.key_field()) {
            Some(cell) => cell.as_text().ok_or_else(|| {
                Error::Query(format!("key field '{}' is NULL or not text", view.key_field()))
            })?,
            None => return Err(missing(view.key_field())),
        };
        let ts = match row.take(view.ts_field()) {
            Some(Cell::Text(text)) => parse_timestamp(&text)?,
            Some(other) => {
                return Err(Error::Query(format!(
                    "timestamp field '{}' must be RFC 3339 text, got {other:?}",
                    view.ts_field()
                )))
            }
            None => return Err(missing(view.ts_field())),
        };
        let value = match row.take(view.value_field()) {
            Some(cell) => cell.into_bytes().ok_or_else(|| {
                Error::Query(format!("value field '{}' is NULL", view.value_field()))
            })?,
            None => return Err(missing(view.value_field())),
        };
        Ok(ViewRow { key, ts, value })
    }
}

fn missing(field: &str) -> Error {
    Error::Query(format!("view result has no column '{field}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use chrono::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn bus() -> Arc<MemoryBus> {
        let bus = Arc::new(MemoryBus::new());
        bus.append("f", "b", b"b1".to_vec(), Some(at(2))).unwrap();
        bus.append("f", "a", b"a1".to_vec(), Some(at(1))).unwrap();
        bus.append("t", "a", b"ya".to_vec(), Some(at(3))).unwrap();
        bus.append("f", "c", b"c1".to_vec(), Some(at(4))).unwrap();
        bus
    }

    #[test]
    fn test_rows_sorted_by_timestamp() {
        let processor = StreamProcessor::new(bus());
        let rows = processor.evaluate(&ViewDefinition::for_topic("f"), None).unwrap();
        assert_eq!(rows.high_water(), Some(at(4)));

        let keys: Vec<_> = rows.map(|r| r.key).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_since_is_exclusive() {
        let processor = StreamProcessor::new(bus());
        let rows: Vec<_> = processor
            .evaluate(&ViewDefinition::for_topic("f"), Some(at(2)))
            .unwrap()
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "c");
    }

    #[test]
    fn test_window_upper_bound_is_inclusive() {
        let processor = StreamProcessor::new(bus());
        let view = ViewDefinition::for_topic("f");

        let rows: Vec<_> = processor
            .evaluate_window(&view, Some(at(1)), Some(at(2)))
            .unwrap()
            .map(|r| r.key)
            .collect();
        assert_eq!(rows, vec!["b"]);

        let rows = processor.evaluate_window(&view, None, Some(at(3))).unwrap();
        assert_eq!(rows.high_water(), Some(at(2)));
    }

    #[test]
    fn test_latest_row_per_key_wins() {
        let bus = bus();
        bus.append("f", "a", b"a2".to_vec(), Some(at(5))).unwrap();
        // Same timestamp as the row above: last in result order wins
        bus.append("f", "a", b"a3".to_vec(), Some(at(5))).unwrap();
        // Older timestamp appended later loses
        bus.append("f", "b", b"b0".to_vec(), Some(at(0))).unwrap();

        let processor = StreamProcessor::new(bus);
        let rows: Vec<_> = processor
            .evaluate(&ViewDefinition::for_topic("f"), None)
            .unwrap()
            .collect();

        let pairs: Vec<_> = rows.iter().map(|r| (r.key.as_str(), r.value.clone())).collect();
        assert_eq!(
            pairs,
            vec![("b", b"b1".to_vec()), ("c", b"c1".to_vec()), ("a", b"a3".to_vec())]
        );
    }

    #[test]
    fn test_restartable_snapshot() {
        let processor = StreamProcessor::new(bus());
        let view = ViewDefinition::for_topic("f");
        let first: Vec<_> = processor.evaluate(&view, Some(at(0))).unwrap().collect();
        let second: Vec<_> = processor.evaluate(&view, Some(at(0))).unwrap().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_custom_field_names() {
        let bus = bus();
        let view = ViewDefinition::new(
            "SELECT key AS id, created_at AS ts, value AS x FROM messages WHERE topic = 't'",
            "id",
            "ts",
            "x",
        );
        let processor = StreamProcessor::new(bus);
        let rows: Vec<_> = processor
            .evaluate(&view, Some(at(3) - Duration::seconds(1)))
            .unwrap()
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "a");
        assert_eq!(rows[0].value, b"ya".to_vec());
    }

    #[test]
    fn test_missing_field_is_query_error() {
        let view = ViewDefinition::new("SELECT key, value FROM messages", "key", "created_at", "value");
        let processor = StreamProcessor::new(bus());
        assert!(matches!(processor.evaluate(&view, None), Err(Error::Query(_))));
    }

    #[test]
    fn test_validate_rejects_blank_fields() {
        let view = ViewDefinition::new("SELECT 1", "", "ts", "v");
        assert!(matches!(view.validate(), Err(Error::Validation(_))));
        assert!(ViewDefinition::for_topic("f").validate().is_ok());
    }
}
