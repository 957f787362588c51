//! Local identity queries.
//!
//! `localidentity` is a singleton giving the local node's routing ID.

use rusqlite::Connection;

use crate::Result;
use weft_types::{coerce, NodeId};

/// The local node's routing ID, if initialized.
pub fn get(conn: &Connection) -> Result<Option<NodeId>> {
    let mut stmt = conn.prepare("SELECT identity_id FROM localidentity LIMIT 1")?;
    let mut rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    match rows.next() {
        Some(raw) => Ok(coerce::parse_u64(&raw?)),
        None => Ok(None),
    }
}

/// Set the local node's routing ID, replacing any previous identity.
pub fn set(conn: &Connection, node_id: NodeId) -> Result<()> {
    conn.execute("DELETE FROM localidentity", [])?;
    conn.execute(
        "INSERT INTO localidentity (identity_id) VALUES (?1)",
        [node_id.to_string()],
    )?;
    Ok(())
}
