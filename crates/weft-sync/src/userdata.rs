//! User-level data snapshot and full-replace application.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::Result;
use weft_store::queries::nodes as nodes_q;
use weft_store::queries::userdata::{self as userdata_q, USER_TABLES, USER_SESSIONS};
use weft_store::DbError;
use weft_types::unix_now;

/// Deadline for the replace transaction.
///
/// SQLite has no server-side statement timeout, so the deadline is
/// enforced between statements.
pub const APPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Rows between deadline checks during bulk insert.
const DEADLINE_STRIDE: usize = 64;

/// All rows of one table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableRows {
    pub table: String,
    pub rows: Vec<Map<String, Value>>,
}

/// A snapshot of every user-level table, in forward dependency order.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserDataSnapshot {
    pub tables: Vec<TableRows>,
}

impl UserDataSnapshot {
    /// Total row count across all tables.
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }
}

/// Read a snapshot of every user-level table.
///
/// Tables are visited in forward dependency order so the snapshot can be
/// applied by inserting front to back. Integer values are stringified by
/// the store layer.
pub fn collect(conn: &Connection) -> Result<UserDataSnapshot> {
    let mut snapshot = UserDataSnapshot::default();
    for table in USER_TABLES {
        if !userdata_q::table_exists(conn, table)? {
            continue;
        }
        snapshot.tables.push(TableRows {
            table: table.to_string(),
            rows: userdata_q::read_rows(conn, table)?,
        });
    }
    Ok(snapshot)
}

/// Replace every user-level table with the snapshot's contents.
///
/// Stale user sessions are invalidated first, outside the transaction.
/// Inside one transaction: node region assignments are stashed (the
/// regions table is about to be replaced), all user tables are deleted in
/// reverse dependency order, and the snapshot is inserted in forward
/// order with per-table upserts. Any foreign-key violation or deadline
/// overrun aborts the whole transaction.
pub fn apply(conn: &mut Connection, snapshot: &UserDataSnapshot) -> Result<()> {
    if userdata_q::table_exists(conn, USER_SESSIONS)? {
        let cleared = userdata_q::clear(conn, USER_SESSIONS)?;
        if cleared > 0 {
            debug!(cleared, "invalidated user sessions");
        }
    }

    let deadline = Instant::now() + APPLY_TIMEOUT;
    let now = unix_now();
    let tx = conn.transaction().map_err(DbError::Sqlite)?;

    nodes_q::stash_regions(&tx, now)?;

    for table in USER_TABLES.iter().rev() {
        check_deadline(deadline, table)?;
        userdata_q::clear(&tx, table)?;
    }

    let by_name: HashMap<&str, &TableRows> = snapshot
        .tables
        .iter()
        .map(|t| (t.table.as_str(), t))
        .collect();
    for table in USER_TABLES {
        let Some(rows) = by_name.get(table) else {
            continue;
        };
        for (idx, row) in rows.rows.iter().enumerate() {
            if idx % DEADLINE_STRIDE == 0 {
                check_deadline(deadline, table)?;
            }
            userdata_q::upsert_row(&tx, table, row).map_err(|e| {
                if let DbError::ForeignKey { table, detail } = &e {
                    warn!(table = %table, detail = %detail, "foreign key violation; aborting replace");
                }
                e
            })?;
        }
    }

    tx.commit().map_err(DbError::Sqlite)?;
    info!(
        tables = snapshot.tables.len(),
        rows = snapshot.row_count(),
        "user data replaced"
    );
    Ok(())
}

fn check_deadline(deadline: Instant, table: &str) -> Result<()> {
    if Instant::now() > deadline {
        return Err(DbError::Deadline(table.to_string()).into());
    }
    Ok(())
}
