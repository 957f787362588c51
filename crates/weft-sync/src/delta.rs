//! Versioned delta application for the mesh system tables.
//!
//! Catch-up records arrive as JSON objects; each table has its own upsert
//! template backed by the store's typed queries, so applying the same
//! record twice converges.

use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::warn;

use crate::{Result, SyncError};
use weft_store::queries::{consensus as consensus_q, membership, mesh as mesh_q, nodes as nodes_q};
use weft_transport::sync::{SyncOperation, SyncRecord};
use weft_types::{coerce, unix_now};

/// System tables kept current through delta sync.
pub const DELTA_TABLES: [&str; 4] = [
    "mesh",
    "nodes",
    "mesh_node_membership",
    "mesh_consensus_state",
];

/// Serve a peer's catch-up request from the local tables.
///
/// Versioning is table-grained: when the peer is behind, the current
/// contents are exported as upserts at the table's present version.
/// Row-grained change tracking is unnecessary because every record
/// applies as an idempotent upsert.
pub fn serve_request(
    conn: &Connection,
    req: &weft_transport::sync::DatabaseSyncRequest,
) -> Result<weft_transport::sync::DatabaseSyncResponse> {
    use weft_transport::sync::DatabaseSyncResponse;

    let table = req.table_name.as_str();
    if !DELTA_TABLES.contains(&table) {
        return Err(SyncError::BadMessage(format!(
            "sync request for unknown table {table}"
        )));
    }
    let version = weft_store::queries::versions::get(conn, table, unix_now())?;
    if req.last_known_version >= version {
        return Ok(DatabaseSyncResponse::caught_up(version));
    }

    let records = weft_store::queries::userdata::read_rows(conn, table)?
        .into_iter()
        .map(|data| SyncRecord {
            operation: SyncOperation::Upsert,
            data,
            version,
        })
        .collect();
    Ok(DatabaseSyncResponse {
        success: true,
        records,
        latest_version: version,
    })
}

/// Apply one sync record to its table.
pub fn apply_record(conn: &Connection, table: &str, record: &SyncRecord) -> Result<()> {
    match record.operation {
        SyncOperation::Insert | SyncOperation::Upsert | SyncOperation::Update => {
            apply_upsert(conn, table, &record.data)
        }
        SyncOperation::Delete => apply_delete(conn, table, &record.data),
    }
}

fn apply_upsert(conn: &Connection, table: &str, data: &Map<String, Value>) -> Result<()> {
    let now = unix_now();
    match table {
        "mesh" => {
            mesh_q::upsert(
                conn,
                &mesh_q::MeshRow {
                    mesh_id: require_str(data, "mesh_id")?,
                    mesh_name: opt_str(data, "mesh_name").unwrap_or_default(),
                    mesh_description: opt_str(data, "mesh_description"),
                    allow_join: opt_bool(data, "allow_join").unwrap_or(true),
                    split_strategy: opt_str(data, "split_strategy")
                        .unwrap_or_else(|| "REQUIRE_MAJORITY".to_string()),
                    status: opt_str(data, "status")
                        .unwrap_or_else(|| weft_store::STATUS_ACTIVE.to_string()),
                },
                now,
            )?;
        }
        "nodes" => {
            let node_id = require_u64(data, "node_id")?;
            nodes_q::upsert(
                conn,
                &nodes_q::NodeRow {
                    node_id,
                    node_name: opt_str(data, "node_name")
                        .unwrap_or_else(|| format!("node-{node_id}")),
                    node_description: opt_str(data, "node_description"),
                    node_public_key: opt_str(data, "node_public_key").unwrap_or_default(),
                    ip_address: opt_str(data, "ip_address").unwrap_or_default(),
                    port: opt_u64(data, "port").unwrap_or(0) as u32,
                    status: opt_str(data, "status")
                        .unwrap_or_else(|| weft_store::STATUS_OFFLINE.to_string()),
                    seed_node: opt_bool(data, "seed_node").unwrap_or(false),
                    region_id: opt_u64(data, "region_id"),
                    original_region_id: opt_u64(data, "original_region_id"),
                },
                now,
            )?;
        }
        "mesh_node_membership" => {
            membership::upsert(
                conn,
                &require_str(data, "mesh_id")?,
                require_u64(data, "node_id")?,
                &opt_str(data, "status").unwrap_or_else(|| weft_store::MEMBER_ACTIVE.to_string()),
                now,
            )?;
        }
        "mesh_consensus_state" => {
            consensus_q::upsert(
                conn,
                &consensus_q::ConsensusRow {
                    mesh_id: require_str(data, "mesh_id")?,
                    total_nodes: opt_u64(data, "total_nodes").unwrap_or(1) as u32,
                    online_nodes: opt_u64(data, "online_nodes").unwrap_or(1) as u32,
                    split_detected: opt_bool(data, "split_detected").unwrap_or(false),
                    majority_side: opt_bool(data, "majority_side").unwrap_or(true),
                    last_consensus_check: opt_u64(data, "last_consensus_check").unwrap_or(now),
                },
            )?;
        }
        other => {
            return Err(SyncError::BadMessage(format!(
                "delta record for unknown table {other}"
            )))
        }
    }
    Ok(())
}

fn apply_delete(conn: &Connection, table: &str, data: &Map<String, Value>) -> Result<()> {
    match table {
        "mesh" => {
            conn.execute(
                "DELETE FROM mesh WHERE mesh_id = ?1",
                [require_str(data, "mesh_id")?],
            )
            .map_err(weft_store::DbError::Sqlite)?;
        }
        "nodes" => {
            let node_id = require_u64(data, "node_id")? as i64;
            // Dependent rows go first so the node row's FKs cannot block.
            conn.execute(
                "DELETE FROM mesh_node_membership WHERE node_id = ?1",
                [node_id],
            )
            .map_err(weft_store::DbError::Sqlite)?;
            conn.execute(
                "DELETE FROM routes WHERE a_node = ?1 OR b_node = ?1",
                [node_id],
            )
            .map_err(weft_store::DbError::Sqlite)?;
            conn.execute("DELETE FROM nodes WHERE node_id = ?1", [node_id])
                .map_err(weft_store::DbError::Sqlite)?;
        }
        "mesh_node_membership" => {
            conn.execute(
                "DELETE FROM mesh_node_membership WHERE mesh_id = ?1 AND node_id = ?2",
                rusqlite::params![
                    require_str(data, "mesh_id")?,
                    require_u64(data, "node_id")? as i64
                ],
            )
            .map_err(weft_store::DbError::Sqlite)?;
        }
        "mesh_consensus_state" => {
            conn.execute(
                "DELETE FROM mesh_consensus_state WHERE mesh_id = ?1",
                [require_str(data, "mesh_id")?],
            )
            .map_err(weft_store::DbError::Sqlite)?;
        }
        other => {
            return Err(SyncError::BadMessage(format!(
                "delta delete for unknown table {other}"
            )))
        }
    }
    Ok(())
}

fn require_str(data: &Map<String, Value>, key: &str) -> Result<String> {
    opt_str(data, key).ok_or_else(|| SyncError::BadMessage(format!("missing field {key}")))
}

fn require_u64(data: &Map<String, Value>, key: &str) -> Result<u64> {
    opt_u64(data, key).ok_or_else(|| SyncError::BadMessage(format!("missing field {key}")))
}

fn opt_str(data: &Map<String, Value>, key: &str) -> Option<String> {
    match data.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn opt_u64(data: &Map<String, Value>, key: &str) -> Option<u64> {
    data.get(key).and_then(coerce::as_u64)
}

fn opt_bool(data: &Map<String, Value>, key: &str) -> Option<bool> {
    match data.get(key) {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => match s.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => {
                warn!(key, value = %s, "unrecognized boolean rendering");
                None
            }
        },
        Some(Value::Number(n)) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(op: SyncOperation, fields: &[(&str, Value)]) -> SyncRecord {
        SyncRecord {
            operation: op,
            data: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            version: 1,
        }
    }

    #[test]
    fn test_upsert_node_record_twice_converges() {
        let conn = weft_store::open_memory().expect("open");
        let rec = record(
            SyncOperation::Upsert,
            &[
                ("node_id", json!("42")),
                ("node_name", json!("n42")),
                ("status", json!("STATUS_ONLINE")),
                ("seed_node", json!("true")),
            ],
        );
        apply_record(&conn, "nodes", &rec).expect("first");
        apply_record(&conn, "nodes", &rec).expect("second");

        let node = nodes_q::get(&conn, 42).expect("node");
        assert_eq!(node.status, "STATUS_ONLINE");
        assert!(node.seed_node);
    }

    #[test]
    fn test_delete_node_removes_dependents() {
        let conn = weft_store::open_memory().expect("open");
        mesh_q::upsert(
            &conn,
            &mesh_q::MeshRow {
                mesh_id: "m".to_string(),
                mesh_name: "m".to_string(),
                mesh_description: None,
                allow_join: true,
                split_strategy: "REQUIRE_MAJORITY".to_string(),
                status: weft_store::STATUS_ACTIVE.to_string(),
            },
            1,
        )
        .expect("mesh");
        for id in [1u64, 2] {
            nodes_q::upsert(&conn, &nodes_q::NodeRow::minimal(id, format!("n{id}")), 1)
                .expect("node");
        }
        membership::upsert(&conn, "m", 2, weft_store::MEMBER_ACTIVE, 1).expect("member");
        weft_store::queries::routes::ensure_pair(&conn, 1, 2, 1).expect("routes");

        let rec = record(SyncOperation::Delete, &[("node_id", json!(2.0))]);
        apply_record(&conn, "nodes", &rec).expect("delete");

        assert!(!nodes_q::exists(&conn, 2).expect("exists"));
        assert!(weft_store::queries::routes::list(&conn).expect("routes").is_empty());
        assert_eq!(membership::count_active(&conn).expect("count"), 0);
    }

    #[test]
    fn test_membership_upsert_from_wire_shapes() {
        let conn = weft_store::open_memory().expect("open");
        mesh_q::upsert(
            &conn,
            &mesh_q::MeshRow {
                mesh_id: "m".to_string(),
                mesh_name: "m".to_string(),
                mesh_description: None,
                allow_join: true,
                split_strategy: "REQUIRE_MAJORITY".to_string(),
                status: weft_store::STATUS_ACTIVE.to_string(),
            },
            1,
        )
        .expect("mesh");
        nodes_q::upsert(&conn, &nodes_q::NodeRow::minimal(7, "n7"), 1).expect("node");

        let rec = record(
            SyncOperation::Insert,
            &[("mesh_id", json!("m")), ("node_id", json!(7.0))],
        );
        apply_record(&conn, "mesh_node_membership", &rec).expect("apply");
        assert_eq!(membership::count_active(&conn).expect("count"), 1);
    }

    #[test]
    fn test_unknown_table_rejected() {
        let conn = weft_store::open_memory().expect("open");
        let rec = record(SyncOperation::Insert, &[("x", json!("1"))]);
        assert!(apply_record(&conn, "wormholes", &rec).is_err());
    }

    #[test]
    fn test_serve_request_round_trip() {
        use weft_transport::sync::DatabaseSyncRequest;

        let provider = weft_store::open_memory().expect("open");
        nodes_q::upsert(&provider, &nodes_q::NodeRow::minimal(5, "n5"), 1).expect("node");
        weft_store::queries::versions::bump(&provider, "nodes", 1).expect("bump");

        let req = DatabaseSyncRequest {
            table_name: "nodes".to_string(),
            last_known_version: 0,
            node_ids: vec![9],
        };
        let resp = serve_request(&provider, &req).expect("serve");
        assert!(resp.success);
        assert_eq!(resp.latest_version, 1);
        assert_eq!(resp.records.len(), 1);

        // Applying the served records on a fresh node reproduces the row.
        let follower = weft_store::open_memory().expect("open");
        for rec in &resp.records {
            apply_record(&follower, "nodes", rec).expect("apply");
        }
        assert!(nodes_q::exists(&follower, 5).expect("exists"));

        // A caught-up peer gets no records back.
        let caught_up = serve_request(
            &provider,
            &DatabaseSyncRequest {
                table_name: "nodes".to_string(),
                last_known_version: 1,
                node_ids: vec![9],
            },
        )
        .expect("serve");
        assert!(caught_up.records.is_empty());
    }

    #[test]
    fn test_serve_request_rejects_unknown_table() {
        use weft_transport::sync::DatabaseSyncRequest;

        let conn = weft_store::open_memory().expect("open");
        let req = DatabaseSyncRequest {
            table_name: "tenants".to_string(),
            last_known_version: 0,
            node_ids: vec![],
        };
        assert!(serve_request(&conn, &req).is_err());
    }
}
