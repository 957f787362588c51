//! Node wiring and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{NodeConfig, NodeError, Result};
use weft_comm::handler::{handler, InboundContext};
use weft_comm::CommManager;
use weft_consensus::ConsensusChecker;
use weft_events::EventManager;
use weft_store::queries::{identity, membership, mesh as mesh_q, nodes as nodes_q};
use weft_store::SharedConn;
use weft_sync::snapshot::{MeshSnapshot, NodeRecord};
use weft_sync::userdata::UserDataSnapshot;
use weft_sync::SyncManager;
use weft_transport::envelope::SubscribeFilter;
use weft_transport::Transport;
use weft_types::consensus::{ConsensusState, SplitStrategy};
use weft_types::event::{MeshEvent, MeshEventType};
use weft_types::message::{CoreMessage, MessageType};
use weft_types::{unix_now, NodeId};

/// Point-in-time diagnostic summary of a node.
#[derive(Clone, Debug, serde::Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub mesh_id: Option<String>,
    /// Rows in the local nodes table.
    pub known_nodes: u32,
    /// ACTIVE membership rows.
    pub active_members: u32,
    /// Event-log rows awaiting processing.
    pub unprocessed_events: u64,
    pub consensus: ConsensusState,
    pub transport: weft_transport::session::MessageMetrics,
}

/// One mesh node: the four engines over a shared store and transport.
pub struct Node<T: Transport> {
    config: NodeConfig,
    db: SharedConn,
    comm: Arc<CommManager<T>>,
    events: Arc<EventManager<T>>,
    consensus: Arc<ConsensusChecker<T>>,
    sync: Arc<SyncManager<T>>,
}

impl<T: Transport> Node<T> {
    /// Construct and wire a node. Two phases: every engine is created
    /// with its direct collaborators, then the back-pointers and message
    /// handlers are installed.
    pub async fn new(config: NodeConfig, transport: Arc<T>) -> Result<Self> {
        config.validate()?;
        let node_id = config.node_id;

        let conn = match config.db_path() {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        NodeError::Config(format!("cannot create data dir: {e}"))
                    })?;
                }
                weft_store::open(&path)?
            }
            None => weft_store::open_memory()?,
        };

        // Local identity and own node row.
        if let Some(existing) = identity::get(&conn)? {
            if existing != node_id {
                warn!(
                    existing,
                    configured = node_id,
                    "local identity changed; overwriting"
                );
            }
        }
        identity::set(&conn, node_id)?;
        // Refresh the own row in place; a restarting node keeps its region
        // assignment and any previously learned fields.
        let mut own = match nodes_q::get(&conn, node_id) {
            Ok(existing) => existing,
            Err(weft_store::DbError::NotFound(_)) => {
                nodes_q::NodeRow::minimal(node_id, config.effective_name())
            }
            Err(e) => return Err(e.into()),
        };
        own.node_name = config.effective_name();
        own.ip_address = config.ip_address.clone();
        own.port = config.port;
        own.seed_node = config.seed_node;
        own.status = weft_store::STATUS_ONLINE.to_string();
        nodes_q::upsert(&conn, &own, unix_now())?;

        let db = weft_store::into_shared(conn);

        let strategy_override = match &config.split_strategy {
            None => None,
            Some(raw) => match raw.parse::<SplitStrategy>() {
                Ok(strategy) => Some(strategy),
                Err(e) => {
                    warn!(error = %e, "ignoring configured split strategy");
                    None
                }
            },
        };

        // Phase one: construction with direct collaborators.
        let comm = CommManager::new(node_id, Arc::clone(&transport));
        let events = EventManager::new(node_id, db.clone(), Arc::clone(&comm)).await?;
        let consensus =
            ConsensusChecker::new(node_id, db.clone(), Arc::clone(&transport), strategy_override);
        let sync = SyncManager::new(node_id, db.clone(), transport);

        // Phase two: back-pointers and handler registration.
        consensus.set_events(Arc::clone(&events));
        events.set_consensus(consensus.clone());
        events.set_sync(sync.clone());
        sync.set_comm(Arc::clone(&comm));
        events.register_mesh_event_handler();
        sync.register_handlers()?;
        register_placeholder_handlers(&comm);

        Ok(Self {
            config,
            db,
            comm,
            events,
            consensus,
            sync,
        })
    }

    /// Open the subscription stream and start the event tasks.
    pub async fn start(&self) -> Result<()> {
        self.consensus.restore_persisted().await?;
        self.comm.subscribe(SubscribeFilter::default()).await?;
        self.events.start();
        info!(node = self.config.node_id, "node started");
        Ok(())
    }

    /// Stop the engines; bounded waits throughout.
    pub async fn stop(&self) {
        self.events.stop().await;
        self.comm.stop().await;
        info!(node = self.config.node_id, "node stopped");
    }

    /// Create the mesh this node will seed.
    pub async fn initialize_mesh(&self, mesh_id: &str, mesh_name: &str) -> Result<()> {
        let strategy = self
            .config
            .split_strategy
            .clone()
            .unwrap_or_else(|| SplitStrategy::default().as_str().to_string());
        let conn = self.db.lock().await;
        let now = unix_now();
        mesh_q::upsert(
            &conn,
            &mesh_q::MeshRow {
                mesh_id: mesh_id.to_string(),
                mesh_name: mesh_name.to_string(),
                mesh_description: None,
                allow_join: true,
                split_strategy: strategy,
                status: weft_store::STATUS_ACTIVE.to_string(),
            },
            now,
        )?;
        membership::upsert(
            &conn,
            mesh_id,
            self.config.node_id,
            weft_store::MEMBER_ACTIVE,
            now,
        )?;
        info!(mesh = mesh_id, "mesh initialized");
        Ok(())
    }

    /// Join an existing mesh through its seed node.
    ///
    /// The bootstrap order matters: the mesh snapshot must be applied
    /// (with node regions left NULL) before the join is announced, and
    /// the user data must arrive before regions can be restored.
    pub async fn join_mesh(&self, seed: NodeId) -> Result<()> {
        info!(node = self.config.node_id, seed, "joining mesh");

        // Mesh snapshot.
        let response = self
            .bootstrap_request(seed, CoreMessage::new(MessageType::MeshSyncRequest, "snapshot"))
            .await?;
        if response.msg_type != MessageType::MeshSyncResponse {
            return Err(NodeError::Bootstrap(format!(
                "expected mesh_sync_response, got {}",
                response.msg_type
            )));
        }
        let snapshot = MeshSnapshot::from_message_data(&response.data)?;
        self.sync.apply_synced_mesh_data(&snapshot).await?;

        // Count ourselves as an active member of the mesh we just learned.
        {
            let conn = self.db.lock().await;
            if let Some(mesh) = mesh_q::get(&conn)? {
                membership::upsert(
                    &conn,
                    &mesh.mesh_id,
                    self.config.node_id,
                    weft_store::MEMBER_ACTIVE,
                    unix_now(),
                )?;
            }
        }

        // Join notification; the seed broadcasts to the rest.
        let own_record = {
            let conn = self.db.lock().await;
            NodeRecord::from_row(&nodes_q::get(&conn, self.config.node_id)?)
        };
        let notify = CoreMessage::new(MessageType::NodeJoinNotify, "join")
            .with_data("node", serde_json::to_value(&own_record).map_err(weft_sync::SyncError::from)?)
            .with_data("node_id", json!(self.config.node_id.to_string()));
        let ack = self.bootstrap_request(seed, notify).await?;
        if ack.msg_type != MessageType::NodeJoinAck {
            return Err(NodeError::Bootstrap(format!(
                "expected node_join_ack, got {}",
                ack.msg_type
            )));
        }
        let accepted = match ack.data.get("success") {
            None => true,
            Some(value) => value.as_bool().unwrap_or(value.as_str() == Some("true")),
        };
        if !accepted {
            let reason = ack
                .data
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("join refused");
            return Err(NodeError::Bootstrap(format!("seed refused join: {reason}")));
        }

        // User-level data replace.
        let response = self
            .bootstrap_request(
                seed,
                CoreMessage::new(MessageType::UserDataSyncRequest, "snapshot"),
            )
            .await?;
        let user_data: UserDataSnapshot = match response.data.get("user_data") {
            Some(value) => {
                serde_json::from_value(value.clone()).map_err(weft_sync::SyncError::from)?
            }
            None => UserDataSnapshot::default(),
        };
        self.sync.apply_user_data_sync(&user_data).await?;

        // Regions exist now; restore node assignments.
        self.sync.restore_region_ids().await?;

        // Announce and settle into normal operation.
        self.events
            .publish_event(MeshEvent::new(MeshEventType::NodeStarted, self.config.node_id))
            .await?;
        self.consensus.trigger_consensus_check().await?;

        info!(node = self.config.node_id, "mesh join complete");
        Ok(())
    }

    /// The local write gate.
    pub async fn can_accept_writes(&self) -> bool {
        self.consensus.can_accept_writes().await
    }

    /// Diagnostic summary: local table counts, consensus view, and
    /// transport counters.
    pub async fn status(&self) -> Result<NodeStatus> {
        let (mesh_id, known_nodes, active_members, unprocessed_events) = {
            let conn = self.db.lock().await;
            (
                mesh_q::get(&conn)?.map(|m| m.mesh_id),
                nodes_q::list(&conn)?.len() as u32,
                membership::count_active(&conn)?,
                weft_store::queries::events::count_unprocessed(&conn)?,
            )
        };
        Ok(NodeStatus {
            node_id: self.config.node_id,
            mesh_id,
            known_nodes,
            active_members,
            unprocessed_events,
            consensus: self.consensus.state().await,
            transport: self.comm.transport_metrics().await?,
        })
    }

    /// Current consensus snapshot.
    pub async fn consensus_state(&self) -> ConsensusState {
        self.consensus.state().await
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn comm(&self) -> &Arc<CommManager<T>> {
        &self.comm
    }

    pub fn events(&self) -> &Arc<EventManager<T>> {
        &self.events
    }

    pub fn consensus(&self) -> &Arc<ConsensusChecker<T>> {
        &self.consensus
    }

    pub fn sync(&self) -> &Arc<SyncManager<T>> {
        &self.sync
    }

    pub fn db(&self) -> &SharedConn {
        &self.db
    }

    /// One bootstrap request/response exchange over the callback channel.
    async fn bootstrap_request(&self, dst: NodeId, msg: CoreMessage) -> Result<CoreMessage> {
        let step = msg.msg_type;
        let (tx, mut rx) = mpsc::channel(1);
        self.comm.send_with_callback(dst, msg, tx).await?;

        let wait = Duration::from_secs(self.config.bootstrap_timeout_secs);
        let ack = tokio::time::timeout(wait, rx.recv())
            .await
            .map_err(|_| NodeError::Bootstrap(format!("{step}: no reply within {wait:?}")))?
            .ok_or_else(|| NodeError::Bootstrap(format!("{step}: channel closed")))?;
        if !ack.success {
            return Err(NodeError::Bootstrap(format!("{step}: {}", ack.message)));
        }
        ack.response
            .ok_or_else(|| NodeError::Bootstrap(format!("{step}: ack carried no response")))
    }
}

/// Handlers for the domain-level message types the core only dispatches.
///
/// Domain logic (database updates, anchor queries, administrative
/// commands) lives outside the coordination core; these handlers keep the
/// dispatch path well-defined until the owning feature attaches its own.
fn register_placeholder_handlers<T: Transport>(comm: &Arc<CommManager<T>>) {
    for msg_type in [
        MessageType::DbUpdate,
        MessageType::AnchorQuery,
        MessageType::AnchorResult,
        MessageType::Command,
    ] {
        comm.register_handler(
            msg_type,
            handler(move |ctx: InboundContext| async move {
                debug!(
                    msg_type = %ctx.message.msg_type,
                    operation = %ctx.message.operation,
                    src = ctx.src_node,
                    "no domain handler attached"
                );
                Ok(())
            }),
        );
    }
}
