//! # weft-store
//!
//! Durable store for the mesh coordination core: the system tables (mesh,
//! nodes, membership, routes, event log, consensus state, table versions)
//! and the replicated user-level tables, backed by a single SQLite database.
//!
//! ## Schema
//!
//! - WAL mode mandatory
//! - Foreign keys enforced
//! - All timestamps are Unix epoch seconds
//! - Schema version stored in `PRAGMA user_version`
//!
//! Every write the core performs is an upsert, so at-least-once message
//! delivery and replayed sync snapshots stay idempotent.

pub mod migrations;
pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Membership row status for an active member.
pub const MEMBER_ACTIVE: &str = "ACTIVE";
/// Membership row status after a voluntary leave.
pub const MEMBER_LEFT: &str = "LEFT";
/// Membership row status after an eviction.
pub const MEMBER_EVICTED: &str = "EVICTED";

/// Entity status values shared by nodes, routes, and the mesh row.
pub const STATUS_ACTIVE: &str = "STATUS_ACTIVE";
pub const STATUS_ONLINE: &str = "STATUS_ONLINE";
pub const STATUS_OFFLINE: &str = "STATUS_OFFLINE";
pub const STATUS_DEGRADED: &str = "STATUS_DEGRADED";

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("foreign key violation in table {table}: {detail}")]
    ForeignKey { table: String, detail: String },

    #[error("statement deadline exceeded while writing table {0}")]
    Deadline(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// The connection handle shared by the engines.
///
/// Queries are synchronous and short; callers hold the lock only for the
/// duration of a statement (or one replace transaction).
pub type SharedConn = Arc<tokio::sync::Mutex<Connection>>;

/// Open or create the coordination database at the given path.
///
/// Configures WAL mode, foreign keys, and runs any pending migrations.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing and ephemeral nodes).
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

/// Wrap a connection for sharing across the engines.
pub fn into_shared(conn: Connection) -> SharedConn {
    Arc::new(tokio::sync::Mutex::new(conn))
}

/// Configure SQLite pragmas.
fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}
