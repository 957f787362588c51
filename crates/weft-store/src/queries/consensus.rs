//! Persisted consensus state queries.

use rusqlite::Connection;

use crate::Result;

/// A row in `mesh_consensus_state`, keyed by mesh.
#[derive(Clone, Debug)]
pub struct ConsensusRow {
    pub mesh_id: String,
    pub total_nodes: u32,
    pub online_nodes: u32,
    pub split_detected: bool,
    /// Whether the local partition held a strict majority at the check.
    pub majority_side: bool,
    pub last_consensus_check: u64,
}

/// Insert or update the consensus counters for a mesh.
pub fn upsert(conn: &Connection, state: &ConsensusRow) -> Result<()> {
    conn.execute(
        "INSERT INTO mesh_consensus_state
             (mesh_id, total_nodes, online_nodes, split_detected, majority_side, last_consensus_check)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (mesh_id) DO UPDATE SET
             total_nodes = excluded.total_nodes,
             online_nodes = excluded.online_nodes,
             split_detected = excluded.split_detected,
             majority_side = excluded.majority_side,
             last_consensus_check = excluded.last_consensus_check",
        rusqlite::params![
            state.mesh_id,
            state.total_nodes,
            state.online_nodes,
            state.split_detected,
            state.majority_side,
            state.last_consensus_check as i64,
        ],
    )?;
    Ok(())
}

/// Read the persisted consensus counters for a mesh.
pub fn get(conn: &Connection, mesh_id: &str) -> Result<Option<ConsensusRow>> {
    let mut stmt = conn.prepare(
        "SELECT mesh_id, total_nodes, online_nodes, split_detected, majority_side, last_consensus_check
         FROM mesh_consensus_state WHERE mesh_id = ?1",
    )?;
    let mut rows = stmt.query_map([mesh_id], |row| {
        Ok(ConsensusRow {
            mesh_id: row.get(0)?,
            total_nodes: row.get(1)?,
            online_nodes: row.get(2)?,
            split_detected: row.get(3)?,
            majority_side: row.get(4)?,
            last_consensus_check: row.get::<_, i64>(5)? as u64,
        })
    })?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}
