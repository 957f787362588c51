//! User-level table replication primitives.
//!
//! The sync manager replicates a closed set of user tables whose declared
//! order respects every foreign key: deletes run in reverse order, inserts
//! in forward order. Column lists and primary keys are introspected from
//! the live schema, and the insert statement is synthesized per table as an
//! `ON CONFLICT (<pk>) DO UPDATE` upsert (plain insert when a table has no
//! primary key).
//!
//! All integer values are read out as strings so 64-bit identifiers survive
//! JSON transport; on the way back in, `*_id` / `*_node` columns are
//! coerced back to integers whatever shape they arrive in.

use base64::Engine;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde_json::{Map, Value};

use crate::{DbError, Result};
use weft_types::coerce;

/// User-level tables in forward dependency order.
pub const USER_TABLES: [&str; 14] = [
    "tenants",
    "users",
    "workspaces",
    "regions",
    "environments",
    "instances",
    "databases",
    "repos",
    "branches",
    "commits",
    "mapping_rules",
    "mappings",
    "mapping_rule_mappings",
    "relationships",
];

/// Session table cleared before a user-data replace.
pub const USER_SESSIONS: &str = "user_sessions";

fn check_ident(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(DbError::Serialization(format!("invalid identifier: {name}")))
    }
}

/// Whether a table exists in the schema.
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Column names of a table, in declaration order.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    check_ident(table)?;
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Primary-key column names of a table, in key order. Empty when the table
/// has no declared primary key.
pub fn primary_key_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    check_ident(table)?;
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut keyed = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(1)?, row.get::<_, i64>(5)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    keyed.retain(|(_, pk)| *pk > 0);
    keyed.sort_by_key(|(_, pk)| *pk);
    Ok(keyed.into_iter().map(|(name, _)| name).collect())
}

/// Read every row of a table as a JSON object, integers stringified.
pub fn read_rows(conn: &Connection, table: &str) -> Result<Vec<Map<String, Value>>> {
    let columns = table_columns(conn, table)?;
    let column_list = columns.join(", ");
    let mut stmt = conn.prepare(&format!("SELECT {column_list} FROM {table}"))?;
    let rows = stmt
        .query_map([], |row| {
            let mut object = Map::new();
            for (idx, column) in columns.iter().enumerate() {
                object.insert(column.clone(), value_to_json(row.get_ref(idx)?));
            }
            Ok(object)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Delete every row of a table. Returns rows removed.
pub fn clear(conn: &Connection, table: &str) -> Result<usize> {
    check_ident(table)?;
    // TRUNCATE-style paths are deliberately avoided: deletes must honor
    // foreign keys row by row instead of cascading into system tables.
    let n = conn
        .execute(&format!("DELETE FROM {table}"), [])
        .map_err(|e| map_table_error(table, e))?;
    Ok(n)
}

/// Insert one row, upserting on the table's primary key when it has one.
///
/// Only columns that exist in both the row object and the live schema are
/// written; unknown keys in the row are ignored.
pub fn upsert_row(conn: &Connection, table: &str, row: &Map<String, Value>) -> Result<()> {
    let mut columns = table_columns(conn, table)?;
    columns.retain(|c| row.contains_key(c.as_str()));
    if columns.is_empty() {
        return Err(DbError::Serialization(format!(
            "row for table {table} has no known columns"
        )));
    }

    let column_list = columns.join(", ");
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");

    let pk = primary_key_columns(conn, table)?;
    let conflict_clause = if pk.is_empty() {
        String::new()
    } else {
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !pk.contains(*c))
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        let pk_list = pk.join(", ");
        if updates.is_empty() {
            format!(" ON CONFLICT ({pk_list}) DO NOTHING")
        } else {
            format!(" ON CONFLICT ({pk_list}) DO UPDATE SET {}", updates.join(", "))
        }
    };

    let sql = format!("INSERT INTO {table} ({column_list}) VALUES ({placeholders}){conflict_clause}");
    let params: Vec<SqlValue> = columns
        .iter()
        .map(|c| json_to_value(c, &row[c.as_str()]))
        .collect();
    conn.execute(&sql, rusqlite::params_from_iter(params))
        .map_err(|e| map_table_error(table, e))?;
    Ok(())
}

/// Row count of a table.
pub fn count(conn: &Connection, table: &str) -> Result<u64> {
    check_ident(table)?;
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(n as u64)
}

/// Tag constraint failures with the table they occurred in.
pub fn map_table_error(table: &str, err: rusqlite::Error) -> DbError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            DbError::ForeignKey {
                table: table.to_string(),
                detail: message.clone().unwrap_or_else(|| failure.to_string()),
            }
        }
        _ => DbError::Sqlite(err),
    }
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::String(i.to_string()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    }
}

fn json_to_value(column: &str, value: &Value) -> SqlValue {
    if coerce::is_id_column(column) {
        if let Some(i) = coerce::as_i64(value) {
            return SqlValue::Integer(i);
        }
        if value.is_null() {
            return SqlValue::Null;
        }
    }
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(u) = n.as_u64() {
                SqlValue::Integer(u as i64)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
