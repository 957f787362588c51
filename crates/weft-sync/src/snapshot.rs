//! Mesh snapshot wire records.
//!
//! The snapshot a seed hands to a joining node: the mesh row, every known
//! node, and every route. All 64-bit identifiers travel as strings.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{Result, SyncError};
use weft_store::queries::mesh::MeshRow;
use weft_store::queries::nodes::NodeRow;
use weft_store::queries::routes::RouteRow;
use weft_types::coerce;

/// Wire form of the mesh row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshRecord {
    pub mesh_id: String,
    pub mesh_name: String,
    #[serde(default)]
    pub mesh_description: Option<String>,
    pub allow_join: bool,
    pub split_strategy: String,
    pub status: String,
}

/// Wire form of one node row.
///
/// `original_region_id` carries the node's region assignment through the
/// bootstrap window; `region_id` itself is never part of a snapshot
/// because the regions table arrives later, with the user data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub node_name: String,
    #[serde(default)]
    pub node_description: Option<String>,
    #[serde(default)]
    pub node_public_key: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub port: u32,
    pub status: String,
    pub seed_node: bool,
    #[serde(default)]
    pub original_region_id: Option<String>,
}

/// Wire form of one route row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteRecord {
    pub a_node: String,
    pub b_node: String,
    pub latency_ms: f64,
    pub status: String,
}

/// The complete bootstrap snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MeshSnapshot {
    pub mesh: Option<MeshRecord>,
    pub nodes: Vec<NodeRecord>,
    pub routes: Vec<RouteRecord>,
}

impl MeshRecord {
    pub fn from_row(row: &MeshRow) -> Self {
        Self {
            mesh_id: row.mesh_id.clone(),
            mesh_name: row.mesh_name.clone(),
            mesh_description: row.mesh_description.clone(),
            allow_join: row.allow_join,
            split_strategy: row.split_strategy.clone(),
            status: row.status.clone(),
        }
    }

    pub fn into_row(self) -> MeshRow {
        MeshRow {
            mesh_id: self.mesh_id,
            mesh_name: self.mesh_name,
            mesh_description: self.mesh_description,
            allow_join: self.allow_join,
            split_strategy: self.split_strategy,
            status: self.status,
        }
    }
}

impl NodeRecord {
    pub fn from_row(row: &NodeRow) -> Self {
        Self {
            node_id: row.node_id.to_string(),
            node_name: row.node_name.clone(),
            node_description: row.node_description.clone(),
            node_public_key: row.node_public_key.clone(),
            ip_address: row.ip_address.clone(),
            port: row.port,
            status: row.status.clone(),
            seed_node: row.seed_node,
            // Export whichever region assignment is current.
            original_region_id: row
                .region_id
                .or(row.original_region_id)
                .map(|r| r.to_string()),
        }
    }

    /// Parse the routing ID, tolerating float renderings.
    pub fn parsed_node_id(&self) -> Result<u64> {
        coerce::parse_u64(&self.node_id)
            .ok_or_else(|| SyncError::BadMessage(format!("bad node_id: {}", self.node_id)))
    }

    /// Convert into a store row with `region_id` left NULL for the
    /// bootstrap window.
    pub fn into_row(self) -> Result<NodeRow> {
        let node_id = self.parsed_node_id()?;
        let original_region_id = match &self.original_region_id {
            None => None,
            Some(raw) => Some(coerce::parse_u64(raw).ok_or_else(|| {
                SyncError::BadMessage(format!("bad original_region_id: {raw}"))
            })?),
        };
        Ok(NodeRow {
            node_id,
            node_name: self.node_name,
            node_description: self.node_description,
            node_public_key: self.node_public_key,
            ip_address: self.ip_address,
            port: self.port,
            status: self.status,
            seed_node: self.seed_node,
            region_id: None,
            original_region_id,
        })
    }
}

impl RouteRecord {
    pub fn from_row(row: &RouteRow) -> Self {
        Self {
            a_node: row.a_node.to_string(),
            b_node: row.b_node.to_string(),
            latency_ms: row.latency_ms,
            status: row.status.clone(),
        }
    }

    pub fn into_row(self) -> Result<RouteRow> {
        let a_node = coerce::parse_u64(&self.a_node)
            .ok_or_else(|| SyncError::BadMessage(format!("bad a_node: {}", self.a_node)))?;
        let b_node = coerce::parse_u64(&self.b_node)
            .ok_or_else(|| SyncError::BadMessage(format!("bad b_node: {}", self.b_node)))?;
        Ok(RouteRow {
            a_node,
            b_node,
            latency_ms: self.latency_ms,
            status: self.status,
        })
    }
}

impl MeshSnapshot {
    /// Encode as the three `mesh` / `nodes` / `routes` structures carried
    /// in a `mesh_sync_response` message.
    pub fn to_message_data(&self) -> Result<Map<String, Value>> {
        let mut data = Map::new();
        data.insert("mesh".to_string(), serde_json::to_value(&self.mesh)?);
        data.insert("nodes".to_string(), json!({ "nodes": self.nodes }));
        data.insert("routes".to_string(), json!({ "routes": self.routes }));
        Ok(data)
    }

    /// Decode from `mesh_sync_response` message data.
    pub fn from_message_data(data: &Map<String, Value>) -> Result<Self> {
        let mesh = match data.get("mesh") {
            None | Some(Value::Null) => None,
            Some(value) => Some(serde_json::from_value(value.clone())?),
        };
        let nodes = match data.get("nodes").and_then(|n| n.get("nodes")) {
            None => Vec::new(),
            Some(value) => serde_json::from_value(value.clone())?,
        };
        let routes = match data.get("routes").and_then(|r| r.get("routes")) {
            None => Vec::new(),
            Some(value) => serde_json::from_value(value.clone())?,
        };
        Ok(Self { mesh, nodes, routes })
    }
}
