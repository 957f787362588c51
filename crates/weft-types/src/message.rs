//! The core message envelope exchanged between coordination engines.
//!
//! A [`CoreMessage`] is the JSON payload carried inside a transport
//! envelope. The `msg_type` tag selects a handler on the receiving side;
//! `operation` is a free-form sub-discriminator within a type. All 64-bit
//! identifiers inside `data` are serialized as strings so they survive
//! JSON-number float64 rounding on any peer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::unix_now;

/// Closed set of message types handled by the coordination core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    DbUpdate,
    AnchorQuery,
    AnchorResult,
    Command,
    Response,
    MeshEvent,
    DatabaseSyncRequest,
    MeshSyncRequest,
    MeshSyncResponse,
    NodeJoinNotify,
    NodeJoinBroadcast,
    NodeJoinAck,
    UserDataSyncRequest,
    UserDataSyncResponse,
}

impl MessageType {
    /// The wire tag for this message type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::DbUpdate => "db_update",
            MessageType::AnchorQuery => "anchor_query",
            MessageType::AnchorResult => "anchor_result",
            MessageType::Command => "command",
            MessageType::Response => "response",
            MessageType::MeshEvent => "mesh_event",
            MessageType::DatabaseSyncRequest => "database_sync_request",
            MessageType::MeshSyncRequest => "mesh_sync_request",
            MessageType::MeshSyncResponse => "mesh_sync_response",
            MessageType::NodeJoinNotify => "node_join_notify",
            MessageType::NodeJoinBroadcast => "node_join_broadcast",
            MessageType::NodeJoinAck => "node_join_ack",
            MessageType::UserDataSyncRequest => "user_data_sync_request",
            MessageType::UserDataSyncResponse => "user_data_sync_response",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload envelope for all core messaging.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreMessage {
    /// Handler-selecting tag.
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Sub-discriminator, free-form within a type.
    #[serde(default)]
    pub operation: String,
    /// Open keyed payload. Numeric IDs travel as strings.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Correlator for the request-response pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Unix seconds, stamped at send.
    #[serde(default)]
    pub timestamp: u64,
}

impl CoreMessage {
    /// Create a message with an empty data map and a current timestamp.
    pub fn new(msg_type: MessageType, operation: impl Into<String>) -> Self {
        Self {
            msg_type,
            operation: operation.into(),
            data: Map::new(),
            request_id: None,
            timestamp: unix_now(),
        }
    }

    /// Insert a data entry, consuming and returning the message.
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Serialize to the JSON byte form carried inside a transport envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a message from transport payload bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
