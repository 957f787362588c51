//! Per-table version tracking for delta sync.

use rusqlite::Connection;

use crate::Result;

/// Current version of a table, initializing the row to 0 when absent.
pub fn get(conn: &Connection, table: &str, now: u64) -> Result<u64> {
    conn.execute(
        "INSERT INTO mesh_table_versions (table_name, version, last_updated)
         VALUES (?1, 0, ?2)
         ON CONFLICT (table_name) DO NOTHING",
        rusqlite::params![table, now as i64],
    )?;
    let version: i64 = conn.query_row(
        "SELECT version FROM mesh_table_versions WHERE table_name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(version as u64)
}

/// Advance a table's version by one, returning the new value.
///
/// Called after a local write to a replicated system table so peers can
/// ask for everything past their last known version.
pub fn bump(conn: &Connection, table: &str, now: u64) -> Result<u64> {
    let current = get(conn, table, now)?;
    let next = current + 1;
    set(conn, table, next, now)?;
    Ok(next)
}

/// Persist the highest applied version for a table.
pub fn set(conn: &Connection, table: &str, version: u64, now: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO mesh_table_versions (table_name, version, last_updated)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (table_name) DO UPDATE SET
             version = excluded.version,
             last_updated = excluded.last_updated",
        rusqlite::params![table, version as i64, now as i64],
    )?;
    Ok(())
}
