//! In-memory event log.
//!
//! Data is lost on process restart. Queries are interpreted by the crate's
//! SQL subset engine over a snapshot of the log.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use super::{next_stamp, BusProtocol, MessageBus, Record, Row};
use crate::query::{QueryEngine, QueryExecutor};
use crate::Result;

/// In-memory append-only log.
///
/// Appends take the write lock only long enough to stamp and push an `Arc`; queries
/// take the read lock only long enough to clone the pointer vector, then run without
/// any lock held, so readers and writers stay decoupled.
///
/// # Example
///
/// ```rust
/// use beaver::bus::{MemoryBus, MessageBus};
///
/// # fn main() -> beaver::Result<()> {
/// let bus = MemoryBus::new();
/// bus.append("t", "k", b"1".to_vec(), None)?;
/// assert_eq!(bus.len()?, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MemoryBus {
    log: RwLock<Log>,
    engine: QueryEngine,
}

#[derive(Default)]
struct Log {
    records: Vec<Arc<Record>>,
    latest: Option<DateTime<Utc>>,
}

impl MemoryBus {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with pre-allocated capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            log: RwLock::new(Log {
                records: Vec::with_capacity(capacity),
                latest: None,
            }),
            engine: QueryEngine::new(),
        }
    }

    fn snapshot(&self) -> Vec<Arc<Record>> {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .clone()
    }
}

impl MessageBus for MemoryBus {
    fn protocol(&self) -> BusProtocol {
        BusProtocol::Memory
    }

    fn append(
        &self,
        topic: &str,
        key: &str,
        value: Vec<u8>,
        at: Option<DateTime<Utc>>,
    ) -> Result<Record> {
        let mut log = self.log.write().unwrap_or_else(PoisonError::into_inner);
        let created_at = next_stamp(at, log.latest)?;
        let record = Record {
            id: log.records.len() as u64 + 1,
            topic: topic.to_string(),
            key: key.to_string(),
            created_at,
            value,
        };
        log.latest = log.latest.max(Some(created_at));
        log.records.push(Arc::new(record.clone()));
        Ok(record)
    }

    fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let plan = self.engine.parse(sql)?;
        let records = self.snapshot();
        QueryExecutor::new().execute(&plan, &records)
    }

    fn len(&self) -> Result<u64> {
        Ok(self
            .log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .len() as u64)
    }

    fn latest(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.log.read().unwrap_or_else(PoisonError::into_inner).latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Cell;

    #[test]
    fn test_append_assigns_sequence() {
        let bus = MemoryBus::new();
        let a = bus.append("t", "a", b"1".to_vec(), None).unwrap();
        let b = bus.append("t", "b", b"2".to_vec(), None).unwrap();

        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(bus.len().unwrap(), 2);
        assert!(!bus.is_empty().unwrap());
    }

    #[test]
    fn test_query_filters_topic_in_append_order() {
        let bus = MemoryBus::with_capacity(8);
        bus.append("features", "1", b"x1".to_vec(), None).unwrap();
        bus.append("targets", "1", b"y1".to_vec(), None).unwrap();
        bus.append("features", "2", b"x2".to_vec(), None).unwrap();

        let rows = bus
            .query("SELECT key, value FROM messages WHERE topic = 'features'")
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("key"), Some(&Cell::Text("1".into())));
        assert_eq!(rows[1].get("value"), Some(&Cell::Blob(b"x2".to_vec())));
    }

    #[test]
    fn test_concurrent_appends() {
        let bus = Arc::new(MemoryBus::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let bus = Arc::clone(&bus);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        bus.append("t", &format!("{t}-{i}"), vec![], None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(bus.len().unwrap(), 400);
        let rows = bus.query("SELECT id FROM messages").unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.get("id").cloned()).collect();
        let expected: Vec<_> = (1..=400).map(|i| Some(Cell::Integer(i))).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_default_stamps_increase_in_append_order() {
        let bus = Arc::new(MemoryBus::new());
        let future = Utc::now() + chrono::Duration::seconds(30);
        bus.append("t", "pinned", vec![], Some(future)).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let bus = Arc::clone(&bus);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        bus.append("t", &format!("{t}-{i}"), vec![], None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stamps: Vec<_> = bus.snapshot().iter().map(|r| r.created_at).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(bus.latest().unwrap(), stamps.last().copied());
    }
}
