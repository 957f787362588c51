//! Session, topology, and metrics reports from the mesh service.

use serde::{Deserialize, Serialize};

use weft_types::NodeId;

/// One live peer session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionInfo {
    pub peer_node_id: NodeId,
    /// Remote address in display form; empty when unknown.
    #[serde(default)]
    pub remote_addr: String,
    /// Unix seconds when the session was established.
    #[serde(default)]
    pub established_at: u64,
}

/// All live peer sessions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionList {
    pub sessions: Vec<SessionInfo>,
}

impl SessionList {
    /// Number of live peers (excluding the local node).
    pub fn peer_count(&self) -> u32 {
        self.sessions.len() as u32
    }
}

/// A bidirectional link between two nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopologyLink {
    pub a_node: NodeId,
    pub b_node: NodeId,
}

/// Mesh topology as known to the transport.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TopologyReport {
    pub nodes: Vec<NodeId>,
    pub links: Vec<TopologyLink>,
}

/// Message counters for observability.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub sent: u64,
    pub delivered: u64,
    pub acked: u64,
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_count() {
        let list = SessionList {
            sessions: vec![
                SessionInfo {
                    peer_node_id: 2,
                    remote_addr: String::new(),
                    established_at: 0,
                },
                SessionInfo {
                    peer_node_id: 3,
                    remote_addr: String::new(),
                    established_at: 0,
                },
            ],
        };
        assert_eq!(list.peer_count(), 2);
        assert_eq!(SessionList::default().peer_count(), 0);
    }
}
