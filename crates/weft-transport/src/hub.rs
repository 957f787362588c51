//! In-process hub transport.
//!
//! Routes envelopes between nodes living in the same process. Used by the
//! integration tests and by single-process meshes; it honors the same
//! contract a networked mesh service does, including broadcast fan-out,
//! per-envelope message IDs, and session enumeration.
//!
//! The hub can be partitioned into visibility groups to exercise
//! split-brain behavior: nodes only see and reach nodes in their own group.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::envelope::{
    AckRequest, ReceivedMessage, SendReceipt, SendRequest, SendStatus, SubscribeFilter,
};
use crate::session::{MessageMetrics, SessionInfo, SessionList, TopologyLink, TopologyReport};
use crate::sync::{DatabaseSyncRequest, DatabaseSyncResponse};
use crate::{Result, Subscription, Transport, TransportError};
use weft_types::event::MeshStateEvent;
use weft_types::message::{CoreMessage, MessageType};
use weft_types::{NodeId, BROADCAST_ALL};

/// Buffer size of each node's subscription stream.
const SUBSCRIPTION_BUFFER: usize = 1024;

/// Answers database sync requests on behalf of the mesh.
pub type SyncResponder =
    Arc<dyn Fn(DatabaseSyncRequest) -> DatabaseSyncResponse + Send + Sync + 'static>;

#[derive(Default)]
struct HubState {
    subscribers: HashMap<NodeId, mpsc::Sender<ReceivedMessage>>,
    /// Source filters by subscriber; empty means all sources.
    filters: HashMap<NodeId, Vec<NodeId>>,
    /// Visibility group per node; nodes default to group 0.
    groups: HashMap<NodeId, u32>,
    /// Log of every application ack, for test assertions.
    acks: Vec<AckRequest>,
    sync_responder: Option<SyncResponder>,
}

/// The shared in-process message hub. One per simulated mesh.
pub struct Hub {
    state: Mutex<HubState>,
    msg_counter: AtomicU64,
    sent: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    dropped: AtomicU64,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
            msg_counter: AtomicU64::new(1),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Create a transport endpoint for `node_id` on this hub.
    pub fn attach(self: &Arc<Self>, node_id: NodeId) -> HubTransport {
        HubTransport {
            node_id,
            hub: Arc::clone(self),
        }
    }

    /// Partition the hub into visibility groups.
    ///
    /// Nodes not named in any group land in group 0 together with the
    /// first group.
    pub fn set_partition(&self, groups: &[&[NodeId]]) {
        let mut state = self.lock_state();
        state.groups.clear();
        for (idx, members) in groups.iter().enumerate() {
            for node in *members {
                state.groups.insert(*node, idx as u32);
            }
        }
    }

    /// Remove all partitions; every node sees every other node again.
    pub fn heal_partition(&self) {
        self.lock_state().groups.clear();
    }

    /// All application acks observed so far.
    pub fn acks(&self) -> Vec<AckRequest> {
        self.lock_state().acks.clone()
    }

    /// Install the callback answering database sync requests.
    pub fn set_sync_responder(&self, responder: SyncResponder) {
        self.lock_state().sync_responder = Some(responder);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, HubState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn group_of(state: &HubState, node: NodeId) -> u32 {
        state.groups.get(&node).copied().unwrap_or(0)
    }

    fn next_msg_id(&self) -> u64 {
        self.msg_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn deliver(
        &self,
        targets: Vec<(NodeId, mpsc::Sender<ReceivedMessage>)>,
        msg: ReceivedMessage,
    ) {
        for (node, tx) in targets {
            match tx.try_send(msg.clone()) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(dst = node, "hub dropped message: subscriber buffer full or gone");
                }
            }
        }
    }

    fn accepts_source(state: &HubState, subscriber: NodeId, src: NodeId) -> bool {
        match state.filters.get(&subscriber) {
            None => true,
            Some(sources) => sources.is_empty() || sources.contains(&src),
        }
    }

    /// Collect reachable delivery targets for an envelope from `src`.
    fn targets_for(&self, src: NodeId, dst: NodeId) -> Result<Vec<(NodeId, mpsc::Sender<ReceivedMessage>)>> {
        let state = self.lock_state();
        let src_group = Self::group_of(&state, src);
        if dst == BROADCAST_ALL {
            Ok(state
                .subscribers
                .iter()
                .filter(|(node, _)| {
                    **node != src
                        && Self::group_of(&state, **node) == src_group
                        && Self::accepts_source(&state, **node, src)
                })
                .map(|(node, tx)| (*node, tx.clone()))
                .collect())
        } else {
            if Self::group_of(&state, dst) != src_group {
                return Err(TransportError::Unavailable(format!(
                    "no session to node {dst}"
                )));
            }
            let tx = state.subscribers.get(&dst).ok_or_else(|| {
                TransportError::Unavailable(format!("node {dst} is not subscribed"))
            })?;
            if !Self::accepts_source(&state, dst, src) {
                // Filtered out on the receive side; the send still counts
                // as accepted.
                return Ok(Vec::new());
            }
            Ok(vec![(dst, tx.clone())])
        }
    }
}

/// A node's endpoint on an in-process [`Hub`].
#[derive(Clone)]
pub struct HubTransport {
    node_id: NodeId,
    hub: Arc<Hub>,
}

impl HubTransport {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }
}

impl Transport for HubTransport {
    async fn send(&self, req: SendRequest) -> Result<SendReceipt> {
        let targets = self.hub.targets_for(self.node_id, req.dst_node)?;
        let msg_id = self.hub.next_msg_id();
        self.hub.sent.fetch_add(1, Ordering::Relaxed);
        self.hub.deliver(
            targets,
            ReceivedMessage {
                src_node: self.node_id,
                msg_id,
                corr_id: req.corr_id,
                require_ack: req.require_ack,
                payload: req.payload,
            },
        );
        Ok(SendReceipt {
            msg_id,
            status: SendStatus::Delivered,
            require_ack: req.require_ack,
        })
    }

    async fn subscribe(&self, filter: SubscribeFilter) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut state = self.hub.lock_state();
        state.subscribers.insert(self.node_id, tx);
        state.filters.insert(self.node_id, filter.src_nodes);
        Ok(Subscription::new(rx))
    }

    async fn ack_message(&self, ack: AckRequest) -> Result<()> {
        self.hub.acked.fetch_add(1, Ordering::Relaxed);
        self.hub.lock_state().acks.push(ack);
        Ok(())
    }

    async fn broadcast_state_event(&self, event: MeshStateEvent) -> Result<()> {
        let payload = CoreMessage::new(MessageType::MeshEvent, "broadcast")
            .with_data(
                "event",
                serde_json::to_value(&event)
                    .map_err(|e| TransportError::Serialization(e.to_string()))?,
            )
            .to_bytes()
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        let targets = self.hub.targets_for(self.node_id, BROADCAST_ALL)?;
        let msg_id = self.hub.next_msg_id();
        self.hub.sent.fetch_add(1, Ordering::Relaxed);
        self.hub.deliver(
            targets,
            ReceivedMessage {
                src_node: self.node_id,
                msg_id,
                corr_id: 0,
                require_ack: false,
                payload,
            },
        );
        Ok(())
    }

    async fn request_database_sync(
        &self,
        req: DatabaseSyncRequest,
    ) -> Result<DatabaseSyncResponse> {
        let responder = self.hub.lock_state().sync_responder.clone();
        match responder {
            Some(responder) => Ok(responder(req)),
            None => Ok(DatabaseSyncResponse::caught_up(req.last_known_version)),
        }
    }

    async fn sessions(&self) -> Result<SessionList> {
        let state = self.hub.lock_state();
        let my_group = Hub::group_of(&state, self.node_id);
        let sessions = state
            .subscribers
            .keys()
            .filter(|node| **node != self.node_id && Hub::group_of(&state, **node) == my_group)
            .map(|node| SessionInfo {
                peer_node_id: *node,
                remote_addr: format!("hub://{node}"),
                established_at: 0,
            })
            .collect();
        Ok(SessionList { sessions })
    }

    async fn topology(&self) -> Result<TopologyReport> {
        let state = self.hub.lock_state();
        let my_group = Hub::group_of(&state, self.node_id);
        let nodes: Vec<NodeId> = state
            .subscribers
            .keys()
            .filter(|node| Hub::group_of(&state, **node) == my_group)
            .copied()
            .collect();
        let mut links = Vec::new();
        for (i, a) in nodes.iter().enumerate() {
            for b in nodes.iter().skip(i + 1) {
                links.push(TopologyLink {
                    a_node: *a,
                    b_node: *b,
                });
            }
        }
        Ok(TopologyReport { nodes, links })
    }

    async fn message_metrics(&self) -> Result<MessageMetrics> {
        Ok(MessageMetrics {
            sent: self.hub.sent.load(Ordering::Relaxed),
            delivered: self.hub.delivered.load(Ordering::Relaxed),
            acked: self.hub.acked.load(Ordering::Relaxed),
            dropped: self.hub.dropped.load(Ordering::Relaxed),
        })
    }
}
