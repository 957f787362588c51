//! Mesh membership queries.

use rusqlite::Connection;

use crate::Result;
use weft_types::NodeId;

/// Insert or update a membership row.
pub fn upsert(
    conn: &Connection,
    mesh_id: &str,
    node_id: NodeId,
    status: &str,
    now: u64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO mesh_node_membership (mesh_id, node_id, status, joined_at, updated)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT (mesh_id, node_id) DO UPDATE SET
             status = excluded.status,
             updated = excluded.updated",
        rusqlite::params![mesh_id, node_id as i64, status, now as i64],
    )?;
    Ok(())
}

/// Count of ACTIVE members across the mesh.
pub fn count_active(conn: &Connection) -> Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM mesh_node_membership WHERE status = ?1",
        [crate::MEMBER_ACTIVE],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

/// A node's membership status, if it has one.
pub fn status_of(conn: &Connection, node_id: NodeId) -> Result<Option<String>> {
    let mut stmt =
        conn.prepare("SELECT status FROM mesh_node_membership WHERE node_id = ?1 LIMIT 1")?;
    let mut rows = stmt.query_map([node_id as i64], |row| row.get::<_, String>(0))?;
    match rows.next() {
        Some(status) => Ok(Some(status?)),
        None => Ok(None),
    }
}
