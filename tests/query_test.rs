//! Tests for the in-memory SQL subset

use beaver::bus::{Cell, MemoryBus, MessageBus};
use beaver::query::{QueryEngine, Source};
use beaver::Error;
use chrono::DateTime;

fn bus() -> MemoryBus {
    let bus = MemoryBus::new();
    for (i, (topic, key)) in [("f", "a"), ("f", "b"), ("t", "a"), ("f", "c")]
        .into_iter()
        .enumerate()
    {
        let at = DateTime::from_timestamp(1_700_000_000 + i as i64, 0);
        bus.append(topic, key, format!("{i}").into_bytes(), at).unwrap();
    }
    bus
}

#[test]
fn test_query_engine_parse() {
    let plan = QueryEngine::new().parse("SELECT * FROM messages").unwrap();
    assert_eq!(plan.source, Source::Log);
}

#[test]
fn test_query_engine_parse_supported() {
    let queries = [
        "SELECT key, value FROM messages WHERE topic = 'f'",
        "SELECT key AS k, created_at AS ts FROM messages ORDER BY created_at DESC LIMIT 10",
        "SELECT * FROM (SELECT key FROM messages) AS inner_view WHERE key IS NOT NULL",
        "SELECT key FROM messages WHERE NOT (id = 1 OR id IN (2, 3))",
        "SELECT key FROM messages WHERE -id < 0",
    ];

    for sql in queries {
        let result = QueryEngine::new().parse(sql);
        assert!(result.is_ok(), "Query parsing should succeed for: {sql}");
    }
}

#[test]
fn test_query_engine_parse_empty() {
    let result = QueryEngine::new().parse("   ");
    assert!(matches!(result, Err(Error::Query(_))), "Empty query must be rejected");
}

#[test]
fn test_memory_bus_filters_and_orders() {
    let bus = bus();
    let rows = bus
        .query("SELECT key FROM messages WHERE topic = 'f' ORDER BY key DESC")
        .unwrap();
    let keys: Vec<_> = rows.iter().map(|r| r.get("key").cloned().unwrap()).collect();
    assert_eq!(
        keys,
        vec![
            Cell::Text("c".into()),
            Cell::Text("b".into()),
            Cell::Text("a".into())
        ]
    );
}

#[test]
fn test_memory_bus_limit_and_alias() {
    let bus = bus();
    let rows = bus.query("SELECT id AS n FROM messages LIMIT 2").unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].columns(), &["n".to_string()]);
    assert_eq!(rows[1].get("N"), Some(&Cell::Integer(2)));
}

#[test]
fn test_memory_bus_rejects_unsupported_sql() {
    let bus = bus();
    for sql in [
        "SELECT COUNT(*) FROM messages GROUP BY topic",
        "SELECT * FROM events",
        "DELETE FROM messages",
        "SELECT key FROM messages WHERE missing = 1",
    ] {
        assert!(matches!(bus.query(sql), Err(Error::Query(_))), "{sql}");
    }
}
