//! Shared helpers for the multi-node integration suites.
//!
//! Every suite builds a simulated mesh on the in-process hub transport:
//! real nodes, real databases (in-memory SQLite), real bootstrap
//! handshakes; only the network is simulated.

use std::sync::Arc;
use std::time::Duration;

use weft_node::{Node, NodeConfig};
use weft_transport::hub::{Hub, HubTransport};
use weft_types::NodeId;

/// A simulated mesh on one in-process hub.
pub struct SimMesh {
    pub hub: Arc<Hub>,
}

impl SimMesh {
    pub fn new() -> Self {
        init_tracing();
        Self { hub: Hub::new() }
    }

    /// Start a seed node and initialize the mesh on it.
    pub async fn spawn_seed(
        &self,
        node_id: NodeId,
        split_strategy: Option<&str>,
    ) -> Node<HubTransport> {
        let mut config = NodeConfig::in_memory(node_id);
        config.seed_node = true;
        config.split_strategy = split_strategy.map(str::to_string);
        let node = Node::new(config, Arc::new(self.hub.attach(node_id)))
            .await
            .expect("seed node");
        node.start().await.expect("start seed");
        node.initialize_mesh("mesh-1", "integration mesh")
            .await
            .expect("initialize mesh");
        node
    }

    /// Start a member node and run the full join handshake against the
    /// seed.
    pub async fn spawn_member(&self, node_id: NodeId, seed: NodeId) -> Node<HubTransport> {
        let node = self.spawn_detached(node_id).await;
        node.join_mesh(seed).await.expect("join mesh");
        node
    }

    /// Start a node without joining anything.
    pub async fn spawn_detached(&self, node_id: NodeId) -> Node<HubTransport> {
        let config = NodeConfig::in_memory(node_id);
        let node = Node::new(config, Arc::new(self.hub.attach(node_id)))
            .await
            .expect("node");
        node.start().await.expect("start");
        node
    }
}

impl Default for SimMesh {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll a condition until it holds, failing after 5 s.
pub async fn wait_until<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(probe().await, "timed out waiting for: {what}");
}

/// Wait until a node's ACTIVE membership count converges.
///
/// Join broadcasts fan out on a detached task, so membership rows on
/// established members trail the joiner's handshake slightly.
pub async fn wait_for_members(node: &Node<HubTransport>, expected: u32) {
    let db = node.db().clone();
    let what = format!("node {} sees {expected} active members", node.node_id());
    wait_until(&what, move || {
        let db = db.clone();
        async move {
            let conn = db.lock().await;
            weft_store::queries::membership::count_active(&conn).expect("count") == expected
        }
    })
    .await;
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
