//! Route table queries.
//!
//! Routes are directed rows; a usable link is a forward+reverse pair.

use rusqlite::Connection;

use crate::Result;
use weft_types::NodeId;

/// A row in the `routes` table.
#[derive(Clone, Debug)]
pub struct RouteRow {
    pub a_node: NodeId,
    pub b_node: NodeId,
    pub latency_ms: f64,
    pub status: String,
}

/// Insert or update a route.
pub fn upsert(conn: &Connection, route: &RouteRow, now: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO routes (a_node, b_node, latency_ms, status, created, updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT (a_node, b_node) DO UPDATE SET
             latency_ms = excluded.latency_ms,
             status = excluded.status,
             updated = excluded.updated",
        rusqlite::params![
            route.a_node as i64,
            route.b_node as i64,
            route.latency_ms,
            route.status,
            now as i64,
        ],
    )?;
    Ok(())
}

/// Whether a directed route row exists.
pub fn exists(conn: &Connection, a_node: NodeId, b_node: NodeId) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM routes WHERE a_node = ?1 AND b_node = ?2",
        rusqlite::params![a_node as i64, b_node as i64],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Create the forward and reverse routes between two nodes when absent.
///
/// New rows get `latency_ms = 0` until the transport has probed the link.
pub fn ensure_pair(conn: &Connection, a_node: NodeId, b_node: NodeId, now: u64) -> Result<()> {
    for (from, to) in [(a_node, b_node), (b_node, a_node)] {
        if !exists(conn, from, to)? {
            upsert(
                conn,
                &RouteRow {
                    a_node: from,
                    b_node: to,
                    latency_ms: 0.0,
                    status: crate::STATUS_ACTIVE.to_string(),
                },
                now,
            )?;
        }
    }
    Ok(())
}

/// List all routes.
pub fn list(conn: &Connection) -> Result<Vec<RouteRow>> {
    let mut stmt = conn.prepare(
        "SELECT a_node, b_node, latency_ms, status FROM routes ORDER BY a_node, b_node",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(RouteRow {
                a_node: row.get::<_, i64>(0)? as u64,
                b_node: row.get::<_, i64>(1)? as u64,
                latency_ms: row.get(2)?,
                status: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
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

    #[test]
    fn test_ensure_pair_creates_both_directions() {
        let conn = setup();
        ensure_pair(&conn, 1, 2, 100).expect("ensure");

        assert!(exists(&conn, 1, 2).expect("exists"));
        assert!(exists(&conn, 2, 1).expect("exists"));
        let routes = list(&conn).expect("list");
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].latency_ms, 0.0);
        assert_eq!(routes[0].status, crate::STATUS_ACTIVE);
    }

    #[test]
    fn test_ensure_pair_preserves_existing_latency() {
        let conn = setup();
        upsert(
            &conn,
            &RouteRow {
                a_node: 1,
                b_node: 2,
                latency_ms: 12.5,
                status: crate::STATUS_ACTIVE.to_string(),
            },
            100,
        )
        .expect("upsert");

        ensure_pair(&conn, 1, 2, 200).expect("ensure");
        let routes = list(&conn).expect("list");
        let forward = routes
            .iter()
            .find(|r| r.a_node == 1 && r.b_node == 2)
            .expect("forward route");
        assert_eq!(forward.latency_ms, 12.5);
        assert!(exists(&conn, 2, 1).expect("reverse created"));
    }
}
