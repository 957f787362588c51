//! Mesh singleton row queries.

use rusqlite::Connection;

use crate::{DbError, Result};

/// The mesh a node belongs to. One row per database.
#[derive(Clone, Debug)]
pub struct MeshRow {
    pub mesh_id: String,
    pub mesh_name: String,
    pub mesh_description: Option<String>,
    pub allow_join: bool,
    pub split_strategy: String,
    pub status: String,
}

/// Insert or update the mesh row.
pub fn upsert(conn: &Connection, mesh: &MeshRow, now: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO mesh (mesh_id, mesh_name, mesh_description, allow_join, split_strategy, status, created, updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT (mesh_id) DO UPDATE SET
             mesh_name = excluded.mesh_name,
             mesh_description = excluded.mesh_description,
             allow_join = excluded.allow_join,
             split_strategy = excluded.split_strategy,
             status = excluded.status,
             updated = excluded.updated",
        rusqlite::params![
            mesh.mesh_id,
            mesh.mesh_name,
            mesh.mesh_description,
            mesh.allow_join,
            mesh.split_strategy,
            mesh.status,
            now as i64,
        ],
    )?;
    Ok(())
}

/// Get the mesh row, if this node belongs to one.
pub fn get(conn: &Connection) -> Result<Option<MeshRow>> {
    let mut stmt = conn.prepare(
        "SELECT mesh_id, mesh_name, mesh_description, allow_join, split_strategy, status
         FROM mesh LIMIT 1",
    )?;
    let mut rows = stmt.query_map([], |row| {
        Ok(MeshRow {
            mesh_id: row.get(0)?,
            mesh_name: row.get(1)?,
            mesh_description: row.get(2)?,
            allow_join: row.get(3)?,
            split_strategy: row.get(4)?,
            status: row.get(5)?,
        })
    })?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

/// Get the mesh row or fail.
pub fn require(conn: &Connection) -> Result<MeshRow> {
    get(conn)?.ok_or_else(|| DbError::NotFound("mesh".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MeshRow {
        MeshRow {
            mesh_id: "mesh-1".to_string(),
            mesh_name: "primary".to_string(),
            mesh_description: None,
            allow_join: true,
            split_strategy: "REQUIRE_MAJORITY".to_string(),
            status: crate::STATUS_ACTIVE.to_string(),
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let conn = crate::open_memory().expect("open");
        assert!(get(&conn).expect("get").is_none());

        upsert(&conn, &sample(), 100).expect("upsert");
        let row = get(&conn).expect("get").expect("mesh row");
        assert_eq!(row.mesh_id, "mesh-1");
        assert_eq!(row.split_strategy, "REQUIRE_MAJORITY");
    }

    #[test]
    fn test_upsert_twice_updates() {
        let conn = crate::open_memory().expect("open");
        upsert(&conn, &sample(), 100).expect("first");
        let mut changed = sample();
        changed.split_strategy = "SEED_NODE_PREVAILS_IN_EVEN_SPLIT".to_string();
        upsert(&conn, &changed, 200).expect("second");

        let row = require(&conn).expect("require");
        assert_eq!(row.split_strategy, "SEED_NODE_PREVAILS_IN_EVEN_SPLIT");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM mesh", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }
}
