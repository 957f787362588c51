//! Versioned table sync request/response records.
//!
//! The sync manager issues a [`DatabaseSyncRequest`] per table during
//! catch-up; peers answer with the rows that changed since the requested
//! version, each tagged with the operation to apply.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use weft_types::NodeId;

/// How a sync record is applied to the local table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncOperation {
    Insert,
    Upsert,
    Update,
    Delete,
}

/// One row-level change from a peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncRecord {
    pub operation: SyncOperation,
    /// Column name → value. Numeric IDs travel as strings.
    pub data: Map<String, Value>,
    /// Table version this change belongs to.
    pub version: u64,
}

/// Request for changes to one table since a known version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseSyncRequest {
    pub table_name: String,
    pub last_known_version: u64,
    /// Nodes on whose behalf the request is made (normally just self).
    pub node_ids: Vec<NodeId>,
}

/// Peer answer to a [`DatabaseSyncRequest`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DatabaseSyncResponse {
    pub success: bool,
    pub records: Vec<SyncRecord>,
    /// Highest version the peer holds for the table.
    pub latest_version: u64,
}

impl DatabaseSyncResponse {
    /// An empty "already caught up" response at the given version.
    pub fn caught_up(version: u64) -> Self {
        Self {
            success: true,
            records: Vec::new(),
            latest_version: version,
        }
    }
}
