//! Node table queries.

use rusqlite::Connection;

use crate::{DbError, Result};
use weft_types::NodeId;

/// A row in the `nodes` table.
#[derive(Clone, Debug)]
pub struct NodeRow {
    pub node_id: NodeId,
    pub node_name: String,
    pub node_description: Option<String>,
    pub node_public_key: String,
    pub ip_address: String,
    pub port: u32,
    pub status: String,
    pub seed_node: bool,
    pub region_id: Option<u64>,
    pub original_region_id: Option<u64>,
}

impl NodeRow {
    /// A minimal row for a node known only by ID and name.
    pub fn minimal(node_id: NodeId, node_name: impl Into<String>) -> Self {
        Self {
            node_id,
            node_name: node_name.into(),
            node_description: None,
            node_public_key: String::new(),
            ip_address: String::new(),
            port: 0,
            status: crate::STATUS_OFFLINE.to_string(),
            seed_node: false,
            region_id: None,
            original_region_id: None,
        }
    }
}

/// Insert or update a node.
pub fn upsert(conn: &Connection, node: &NodeRow, now: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO nodes (node_id, node_name, node_description, node_public_key,
                            ip_address, port, status, seed_node, region_id, original_region_id,
                            created, updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
         ON CONFLICT (node_id) DO UPDATE SET
             node_name = excluded.node_name,
             node_description = excluded.node_description,
             node_public_key = excluded.node_public_key,
             ip_address = excluded.ip_address,
             port = excluded.port,
             status = excluded.status,
             seed_node = excluded.seed_node,
             region_id = excluded.region_id,
             original_region_id = excluded.original_region_id,
             updated = excluded.updated",
        rusqlite::params![
            node.node_id as i64,
            node.node_name,
            node.node_description,
            node.node_public_key,
            node.ip_address,
            node.port,
            node.status,
            node.seed_node,
            node.region_id.map(|r| r as i64),
            node.original_region_id.map(|r| r as i64),
            now as i64,
        ],
    )?;
    Ok(())
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRow> {
    Ok(NodeRow {
        node_id: row.get::<_, i64>(0)? as u64,
        node_name: row.get(1)?,
        node_description: row.get(2)?,
        node_public_key: row.get(3)?,
        ip_address: row.get(4)?,
        port: row.get::<_, i64>(5)? as u32,
        status: row.get(6)?,
        seed_node: row.get(7)?,
        region_id: row.get::<_, Option<i64>>(8)?.map(|r| r as u64),
        original_region_id: row.get::<_, Option<i64>>(9)?.map(|r| r as u64),
    })
}

const NODE_COLUMNS: &str = "node_id, node_name, node_description, node_public_key, \
                            ip_address, port, status, seed_node, region_id, original_region_id";

/// Get a node by ID.
pub fn get(conn: &Connection, node_id: NodeId) -> Result<NodeRow> {
    conn.query_row(
        &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE node_id = ?1"),
        [node_id as i64],
        row_to_node,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::NotFound(format!("node {node_id}")),
        other => DbError::Sqlite(other),
    })
}

/// Whether a node row exists locally.
pub fn exists(conn: &Connection, node_id: NodeId) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM nodes WHERE node_id = ?1",
        [node_id as i64],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// List all nodes ordered by ID.
pub fn list(conn: &Connection) -> Result<Vec<NodeRow>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY node_id"))?;
    let rows = stmt
        .query_map([], row_to_node)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Update a node's status.
pub fn set_status(conn: &Connection, node_id: NodeId, status: &str, now: u64) -> Result<()> {
    conn.execute(
        "UPDATE nodes SET status = ?2, updated = ?3 WHERE node_id = ?1",
        rusqlite::params![node_id as i64, status, now as i64],
    )?;
    Ok(())
}

/// The seed node's ID, if one is flagged.
pub fn seed_node_id(conn: &Connection) -> Result<Option<NodeId>> {
    let mut stmt =
        conn.prepare("SELECT node_id FROM nodes WHERE seed_node = 1 ORDER BY node_id LIMIT 1")?;
    let mut rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    match rows.next() {
        Some(id) => Ok(Some(id? as u64)),
        None => Ok(None),
    }
}

/// Stash every node's region into `original_region_id` and null `region_id`.
///
/// Run before the regions table is replaced so the FK cannot be violated.
pub fn stash_regions(conn: &Connection, now: u64) -> Result<usize> {
    let n = conn.execute(
        "UPDATE nodes
         SET original_region_id = COALESCE(original_region_id, region_id),
             region_id = NULL,
             updated = ?1
         WHERE region_id IS NOT NULL",
        [now as i64],
    )?;
    Ok(n)
}

/// Restore `region_id` from `original_region_id` for every node whose
/// stashed region now exists in the regions table.
pub fn restore_regions(conn: &Connection, now: u64) -> Result<usize> {
    let n = conn.execute(
        "UPDATE nodes
         SET region_id = original_region_id, updated = ?1
         WHERE region_id IS NULL
           AND original_region_id IS NOT NULL
           AND EXISTS (SELECT 1 FROM regions r WHERE r.region_id = nodes.original_region_id)",
        [now as i64],
    )?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_get_exists() {
        let conn = crate::open_memory().expect("open");
        assert!(!exists(&conn, 7).expect("exists"));

        upsert(&conn, &NodeRow::minimal(7, "node-7"), 100).expect("upsert");
        assert!(exists(&conn, 7).expect("exists"));

        let node = get(&conn, 7).expect("get");
        assert_eq!(node.node_name, "node-7");
        assert!(!node.seed_node);
        assert!(node.region_id.is_none());
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let conn = crate::open_memory().expect("open");
        let mut node = NodeRow::minimal(1, "a");
        upsert(&conn, &node, 100).expect("first");
        node.status = crate::STATUS_ONLINE.to_string();
        upsert(&conn, &node, 200).expect("second");

        assert_eq!(list(&conn).expect("list").len(), 1);
        assert_eq!(get(&conn, 1).expect("get").status, crate::STATUS_ONLINE);
    }

    #[test]
    fn test_seed_node_lookup() {
        let conn = crate::open_memory().expect("open");
        assert!(seed_node_id(&conn).expect("seed").is_none());

        let mut seed = NodeRow::minimal(3, "seed");
        seed.seed_node = true;
        upsert(&conn, &seed, 100).expect("upsert");
        upsert(&conn, &NodeRow::minimal(9, "other"), 100).expect("upsert");

        assert_eq!(seed_node_id(&conn).expect("seed"), Some(3));
    }

    #[test]
    fn test_stash_and_restore_regions() {
        let conn = crate::open_memory().expect("open");
        conn.execute(
            "INSERT INTO regions (region_id, region_name) VALUES (5, 'eu-west')",
            [],
        )
        .expect("region");
        let mut node = NodeRow::minimal(1, "a");
        node.region_id = Some(5);
        upsert(&conn, &node, 100).expect("upsert");

        assert_eq!(stash_regions(&conn, 110).expect("stash"), 1);
        let stashed = get(&conn, 1).expect("get");
        assert_eq!(stashed.region_id, None);
        assert_eq!(stashed.original_region_id, Some(5));

        assert_eq!(restore_regions(&conn, 120).expect("restore"), 1);
        assert_eq!(get(&conn, 1).expect("get").region_id, Some(5));
    }

    #[test]
    fn test_restore_skips_missing_region() {
        let conn = crate::open_memory().expect("open");
        let mut node = NodeRow::minimal(1, "a");
        node.original_region_id = Some(99);
        upsert(&conn, &node, 100).expect("upsert");

        assert_eq!(restore_regions(&conn, 110).expect("restore"), 0);
        assert_eq!(get(&conn, 1).expect("get").region_id, None);
    }

    #[test]
    fn test_large_node_id_roundtrip() {
        let conn = crate::open_memory().expect("open");
        let id = u64::MAX - 1;
        upsert(&conn, &NodeRow::minimal(id, "big"), 100).expect("upsert");
        assert_eq!(get(&conn, id).expect("get").node_id, id);
    }
}
