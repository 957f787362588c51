//! weft-simnet: a single-process mesh for development and demos.
//!
//! Spins up N nodes on the in-process hub transport, seeds a mesh on node
//! 1, joins the rest through the full bootstrap handshake, and prints the
//! converged state. Runs until Ctrl-C.
//!
//! Usage: `weft-simnet [node_count]` (default 3).

use std::sync::Arc;

use tracing::{info, warn};

use weft_node::{Node, NodeConfig};
use weft_transport::hub::Hub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("weft=info".parse()?),
        )
        .init();

    let node_count: u64 = std::env::args()
        .nth(1)
        .map(|raw| raw.parse())
        .transpose()?
        .unwrap_or(3)
        .max(1);

    info!(node_count, "starting simulated mesh");
    let hub = Hub::new();
    let mut nodes = Vec::new();

    // Node 1 seeds the mesh.
    let mut seed_config = NodeConfig::in_memory(1);
    seed_config.seed_node = true;
    let seed = Node::new(seed_config, Arc::new(hub.attach(1))).await?;
    seed.start().await?;
    seed.initialize_mesh("simnet", "simulated mesh").await?;
    nodes.push(seed);

    // The rest join through the bootstrap handshake.
    for node_id in 2..=node_count {
        let node = Node::new(NodeConfig::in_memory(node_id), Arc::new(hub.attach(node_id))).await?;
        node.start().await?;
        if let Err(e) = node.join_mesh(1).await {
            warn!(node = node_id, error = %e, "join failed");
        }
        nodes.push(node);
    }

    for node in &nodes {
        let state = node.consensus().trigger_consensus_check().await?;
        let status = node.status().await?;
        info!(
            node = node.node_id(),
            total = state.total_nodes,
            online = state.online_nodes,
            writes = state.can_accept_writes,
            known_nodes = status.known_nodes,
            backlog = status.unprocessed_events,
            "member state"
        );
    }

    info!("mesh is up; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    for node in &nodes {
        node.stop().await;
    }
    info!("simnet stopped");
    Ok(())
}
