//! Durable event log queries.
//!
//! Event identity is `(originator_node, sequence_number)`; the UNIQUE
//! constraint plus `ON CONFLICT DO NOTHING` makes re-insertion of a
//! redelivered event a no-op.

use base64::Engine;
use rusqlite::Connection;
use serde_json::json;

use crate::{DbError, Result};
use weft_types::event::{MeshEvent, MeshEventType};
use weft_types::NodeId;

/// Insert an event. Returns false when the `(originator, sequence)` pair
/// was already logged.
pub fn insert(conn: &Connection, event: &MeshEvent, now: u64) -> Result<bool> {
    let event_data = encode_event_data(event)?;
    let inserted = conn.execute(
        "INSERT INTO mesh_event_log
             (event_type, originator_node, affected_node, sequence_number, event_data, processed, created)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
         ON CONFLICT (originator_node, sequence_number) DO NOTHING",
        rusqlite::params![
            event.event_type.as_str(),
            event.originator_node as i64,
            event.affected_node as i64,
            event.sequence as i64,
            event_data,
            now as i64,
        ],
    )?;
    Ok(inserted == 1)
}

/// Whether an event with this identity is already logged.
pub fn exists(conn: &Connection, originator: NodeId, sequence: u64) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM mesh_event_log
         WHERE originator_node = ?1 AND sequence_number = ?2",
        rusqlite::params![originator as i64, sequence as i64],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Mark an event processed.
pub fn mark_processed(conn: &Connection, originator: NodeId, sequence: u64) -> Result<()> {
    conn.execute(
        "UPDATE mesh_event_log SET processed = 1
         WHERE originator_node = ?1 AND sequence_number = ?2",
        rusqlite::params![originator as i64, sequence as i64],
    )?;
    Ok(())
}

/// Oldest unprocessed events, up to `limit`.
pub fn unprocessed(conn: &Connection, limit: u32) -> Result<Vec<MeshEvent>> {
    let mut stmt = conn.prepare(
        "SELECT event_type, originator_node, affected_node, sequence_number, event_data, created
         FROM mesh_event_log WHERE processed = 0
         ORDER BY created ASC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)? as u64,
                row.get::<_, i64>(2)? as u64,
                row.get::<_, i64>(3)? as u64,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)? as u64,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut events = Vec::with_capacity(rows.len());
    for (type_name, originator, affected, sequence, event_data, created) in rows {
        let event_type = MeshEventType::from_name(&type_name)
            .ok_or_else(|| DbError::Serialization(format!("unknown event type {type_name}")))?;
        let (metadata, payload, timestamp) = decode_event_data(event_data.as_deref())?;
        events.push(MeshEvent {
            event_type,
            originator_node: originator,
            affected_node: affected,
            sequence,
            timestamp: timestamp.unwrap_or(created),
            metadata,
            payload,
        });
    }
    Ok(events)
}

/// Count of rows still awaiting processing.
pub fn count_unprocessed(conn: &Connection) -> Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM mesh_event_log WHERE processed = 0",
        [],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

/// Prune processed events created before the cutoff. Returns rows removed.
pub fn delete_processed_before(conn: &Connection, cutoff: u64) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM mesh_event_log WHERE processed = 1 AND created < ?1",
        [cutoff as i64],
    )?;
    Ok(n)
}

fn encode_event_data(event: &MeshEvent) -> Result<String> {
    let payload_b64 = if event.payload.is_empty() {
        String::new()
    } else {
        base64::engine::general_purpose::STANDARD.encode(&event.payload)
    };
    serde_json::to_string(&json!({
        "metadata": event.metadata,
        "payload": payload_b64,
        "timestamp": event.timestamp,
    }))
    .map_err(|e| DbError::Serialization(e.to_string()))
}

type EventData = (
    std::collections::BTreeMap<String, String>,
    Vec<u8>,
    Option<u64>,
);

fn decode_event_data(raw: Option<&str>) -> Result<EventData> {
    let Some(raw) = raw else {
        return Ok((Default::default(), Vec::new(), None));
    };
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| DbError::Serialization(e.to_string()))?;
    let metadata = value
        .get("metadata")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| DbError::Serialization(e.to_string()))?
        .unwrap_or_default();
    let payload = match value.get("payload").and_then(|p| p.as_str()) {
        Some("") | None => Vec::new(),
        Some(b64) => base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| DbError::Serialization(e.to_string()))?,
    };
    let timestamp = value.get("timestamp").and_then(|t| t.as_u64());
    Ok((metadata, payload, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queries::nodes;

    fn setup() -> Connection {
        let conn = crate::open_memory().expect("open");
        for id in [1u64, 2] {
            nodes::upsert(&conn, &nodes::NodeRow::minimal(id, format!("n{id}")), 1)
                .expect("node");
        }
        conn
    }

    fn sample(sequence: u64) -> MeshEvent {
        let mut event = MeshEvent::new(MeshEventType::NodeJoined, 2);
        event.originator_node = 1;
        event.sequence = sequence;
        event.timestamp = 500;
        event.metadata.insert("k".to_string(), "v".to_string());
        event.payload = vec![9, 8, 7];
        event
    }

    #[test]
    fn test_insert_and_duplicate() {
        let conn = setup();
        assert!(insert(&conn, &sample(1), 100).expect("insert"));
        assert!(!insert(&conn, &sample(1), 101).expect("duplicate insert"));
        assert!(exists(&conn, 1, 1).expect("exists"));
        assert!(!exists(&conn, 1, 2).expect("exists"));
    }

    #[test]
    fn test_unprocessed_ordering_and_mark() {
        let conn = setup();
        insert(&conn, &sample(2), 200).expect("insert");
        insert(&conn, &sample(1), 100).expect("insert");

        let pending = unprocessed(&conn, 100).expect("unprocessed");
        assert_eq!(pending.len(), 2);
        // Oldest created first.
        assert_eq!(pending[0].sequence, 1);
        assert_eq!(pending[0].metadata.get("k").map(String::as_str), Some("v"));
        assert_eq!(pending[0].payload, vec![9, 8, 7]);

        mark_processed(&conn, 1, 1).expect("mark");
        let pending = unprocessed(&conn, 100).expect("unprocessed");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sequence, 2);
    }

    #[test]
    fn test_unprocessed_respects_limit() {
        let conn = setup();
        for seq in 1..=5 {
            insert(&conn, &sample(seq), 100 + seq).expect("insert");
        }
        assert_eq!(unprocessed(&conn, 3).expect("unprocessed").len(), 3);
    }

    #[test]
    fn test_prune_processed_only() {
        let conn = setup();
        insert(&conn, &sample(1), 100).expect("insert");
        insert(&conn, &sample(2), 100).expect("insert");
        mark_processed(&conn, 1, 1).expect("mark");

        assert_eq!(count_unprocessed(&conn).expect("count"), 1);
        assert_eq!(delete_processed_before(&conn, 200).expect("prune"), 1);
        assert!(exists(&conn, 1, 2).expect("unprocessed survives"));
    }
}
