//! The sync manager.

use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::delta::{self, DELTA_TABLES};
use crate::snapshot::{MeshRecord, MeshSnapshot, NodeRecord, RouteRecord};
use crate::userdata::{self, UserDataSnapshot};
use crate::{Result, SyncError};
use weft_comm::handler::{handler, InboundContext};
use weft_comm::CommManager;
use weft_events::hooks::{HookFuture, SyncHook};
use weft_store::queries::{
    membership, mesh as mesh_q, nodes as nodes_q, routes as routes_q, versions,
};
use weft_store::SharedConn;
use weft_transport::sync::{DatabaseSyncRequest, DatabaseSyncResponse};
use weft_transport::Transport;
use weft_types::message::{CoreMessage, MessageType};
use weft_types::{coerce, unix_now, NodeId, BROADCAST_ALL};

/// Deadline for the detached join broadcast.
const JOIN_BROADCAST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bootstrap and catch-up replication across peers.
pub struct SyncManager<T: Transport> {
    local_node: NodeId,
    db: SharedConn,
    transport: Arc<T>,
    comm: StdRwLock<Option<Arc<CommManager<T>>>>,
}

impl<T: Transport> SyncManager<T> {
    pub fn new(local_node: NodeId, db: SharedConn, transport: Arc<T>) -> Arc<Self> {
        Arc::new(Self {
            local_node,
            db,
            transport,
            comm: StdRwLock::new(None),
        })
    }

    /// Install the communication manager back-pointer.
    pub fn set_comm(&self, comm: Arc<CommManager<T>>) {
        match self.comm.write() {
            Ok(mut guard) => *guard = Some(comm),
            Err(poisoned) => *poisoned.into_inner() = Some(comm),
        }
    }

    fn comm(&self) -> Result<Arc<CommManager<T>>> {
        let guard = match self.comm.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone().ok_or(SyncError::NotWired)
    }

    /// Whether a node is already known locally. Used to deduplicate
    /// broadcast join notifications.
    pub async fn node_exists(&self, node_id: NodeId) -> Result<bool> {
        let conn = self.db.lock().await;
        Ok(nodes_q::exists(&conn, node_id)?)
    }

    // ------------------------------------------------------------------
    // Mesh (system) snapshot
    // ------------------------------------------------------------------

    /// Export the mesh, node, and route tables for a joining peer.
    pub async fn mesh_data_for_sync(&self) -> Result<MeshSnapshot> {
        let conn = self.db.lock().await;
        Ok(MeshSnapshot {
            mesh: mesh_q::get(&conn)?.as_ref().map(MeshRecord::from_row),
            nodes: nodes_q::list(&conn)?
                .iter()
                .map(NodeRecord::from_row)
                .collect(),
            routes: routes_q::list(&conn)?
                .iter()
                .map(RouteRecord::from_row)
                .collect(),
        })
    }

    /// Apply a peer's mesh snapshot.
    ///
    /// Nodes land with `region_id` NULL (the regions table has not been
    /// synced yet); after the rows exist, a forward and reverse route to
    /// every synced node is stitched in if absent. Safe to re-apply.
    pub async fn apply_synced_mesh_data(&self, snapshot: &MeshSnapshot) -> Result<()> {
        let conn = self.db.lock().await;
        let now = unix_now();

        if let Some(mesh) = &snapshot.mesh {
            mesh_q::upsert(&conn, &mesh.clone().into_row(), now)?;
        }
        let mesh_id = mesh_q::get(&conn)?.map(|m| m.mesh_id);

        for record in &snapshot.nodes {
            let row = record.clone().into_row()?;
            nodes_q::upsert(&conn, &row, now)?;
            if let Some(mesh_id) = &mesh_id {
                membership::upsert(&conn, mesh_id, row.node_id, weft_store::MEMBER_ACTIVE, now)?;
            }
        }
        for route in &snapshot.routes {
            routes_q::upsert(&conn, &route.clone().into_row()?, now)?;
        }
        for record in &snapshot.nodes {
            let node_id = record.parsed_node_id()?;
            if node_id != self.local_node {
                routes_q::ensure_pair(&conn, self.local_node, node_id, now)?;
            }
        }

        // Local copies of the replicated tables changed; let peers see it
        // through delta sync.
        versions::bump(&conn, "mesh", now)?;
        versions::bump(&conn, "nodes", now)?;
        versions::bump(&conn, "mesh_node_membership", now)?;

        info!(
            nodes = snapshot.nodes.len(),
            routes = snapshot.routes.len(),
            "mesh snapshot applied"
        );
        Ok(())
    }

    /// Register a joining node and stitch routes to it.
    pub async fn add_joining_node(&self, node_id: NodeId, record: &NodeRecord) -> Result<()> {
        let conn = self.db.lock().await;
        let now = unix_now();
        nodes_q::upsert(&conn, &record.clone().into_row()?, now)?;
        if let Some(mesh) = mesh_q::get(&conn)? {
            membership::upsert(&conn, &mesh.mesh_id, node_id, weft_store::MEMBER_ACTIVE, now)?;
        }
        if node_id != self.local_node {
            routes_q::ensure_pair(&conn, self.local_node, node_id, now)?;
        }
        versions::bump(&conn, "nodes", now)?;
        versions::bump(&conn, "mesh_node_membership", now)?;
        info!(node = node_id, "joining node registered");
        Ok(())
    }

    /// Restore `nodes.region_id` from the stashed assignment once the
    /// regions table exists (bootstrap step after user data arrives).
    pub async fn restore_region_ids(&self) -> Result<usize> {
        let conn = self.db.lock().await;
        let restored = nodes_q::restore_regions(&conn, unix_now())?;
        if restored > 0 {
            debug!(restored, "node regions restored");
        }
        Ok(restored)
    }

    // ------------------------------------------------------------------
    // User-level data
    // ------------------------------------------------------------------

    /// Export every user-level table.
    pub async fn user_data_for_sync(&self) -> Result<UserDataSnapshot> {
        let conn = self.db.lock().await;
        userdata::collect(&conn)
    }

    /// Replace the local user-level tables with a peer snapshot.
    pub async fn apply_user_data_sync(&self, snapshot: &UserDataSnapshot) -> Result<()> {
        let mut conn = self.db.lock().await;
        userdata::apply(&mut conn, snapshot)
    }

    // ------------------------------------------------------------------
    // Table delta sync
    // ------------------------------------------------------------------

    /// Catch up the mesh system tables from peers, one table at a time.
    pub async fn sync_table_deltas(&self) -> Result<()> {
        for table in DELTA_TABLES {
            let last_known = {
                let conn = self.db.lock().await;
                versions::get(&conn, table, unix_now())?
            };
            let response = self
                .transport
                .request_database_sync(DatabaseSyncRequest {
                    table_name: table.to_string(),
                    last_known_version: last_known,
                    node_ids: vec![self.local_node],
                })
                .await?;
            if !response.success {
                warn!(table, "peer refused database sync request");
                continue;
            }

            let mut applied_version = last_known;
            let conn = self.db.lock().await;
            for record in &response.records {
                match delta::apply_record(&conn, table, record) {
                    Ok(()) => applied_version = applied_version.max(record.version),
                    Err(e) => warn!(table, error = %e, "failed to apply delta record"),
                }
            }
            if applied_version > last_known {
                versions::set(&conn, table, applied_version, unix_now())?;
                debug!(table, version = applied_version, "table caught up");
            }
        }
        Ok(())
    }

    /// Serve a peer's catch-up request from the local store. The mesh
    /// service routes `DatabaseSyncRequest`s here on provider nodes.
    pub async fn handle_database_sync_request(
        &self,
        req: &DatabaseSyncRequest,
    ) -> Result<DatabaseSyncResponse> {
        let conn = self.db.lock().await;
        delta::serve_request(&conn, req)
    }

    // ------------------------------------------------------------------
    // Join handshake handlers
    // ------------------------------------------------------------------

    /// Register the sync-side message handlers. Part of two-phase wiring;
    /// requires the communication manager back-pointer.
    pub fn register_handlers(self: &Arc<Self>) -> Result<()> {
        let comm = self.comm()?;

        let sm = Arc::clone(self);
        comm.register_handler(
            MessageType::MeshSyncRequest,
            handler(move |ctx| {
                let sm = Arc::clone(&sm);
                async move {
                    sm.handle_mesh_sync_request(ctx).await?;
                    Ok(())
                }
            }),
        );

        let sm = Arc::clone(self);
        comm.register_handler(
            MessageType::NodeJoinNotify,
            handler(move |ctx| {
                let sm = Arc::clone(&sm);
                async move {
                    sm.handle_node_join_notify(ctx).await?;
                    Ok(())
                }
            }),
        );

        let sm = Arc::clone(self);
        comm.register_handler(
            MessageType::NodeJoinBroadcast,
            handler(move |ctx| {
                let sm = Arc::clone(&sm);
                async move {
                    sm.handle_node_join_broadcast(ctx).await?;
                    Ok(())
                }
            }),
        );

        let sm = Arc::clone(self);
        comm.register_handler(
            MessageType::UserDataSyncRequest,
            handler(move |ctx| {
                let sm = Arc::clone(&sm);
                async move {
                    sm.handle_user_data_sync_request(ctx).await?;
                    Ok(())
                }
            }),
        );

        // Responses to the bootstrap requests are consumed through the
        // callback channel; the handlers only keep the registry quiet.
        for msg_type in [
            MessageType::MeshSyncResponse,
            MessageType::NodeJoinAck,
            MessageType::UserDataSyncResponse,
        ] {
            comm.register_handler(
                msg_type,
                handler(move |ctx: InboundContext| async move {
                    debug!(
                        msg_type = %ctx.message.msg_type,
                        src = ctx.src_node,
                        "correlated response delivered via callback"
                    );
                    Ok(())
                }),
            );
        }
        Ok(())
    }

    /// A joiner asked for the mesh snapshot: reply on the same
    /// correlation ID so its callback fires.
    async fn handle_mesh_sync_request(&self, ctx: InboundContext) -> Result<()> {
        let snapshot = self.mesh_data_for_sync().await?;
        let mut reply = CoreMessage::new(MessageType::MeshSyncResponse, "snapshot");
        reply.data = snapshot.to_message_data()?;
        self.comm()?
            .send_with_corr_id(ctx.src_node, reply, ctx.corr_id)
            .await?;
        Ok(())
    }

    /// Direct join notification from a joiner: register it, broadcast the
    /// join to the rest of the mesh, and ack on the same correlation ID.
    /// A mesh with `allow_join` cleared refuses with a negative ack body.
    async fn handle_node_join_notify(&self, ctx: InboundContext) -> Result<()> {
        let node_value = ctx
            .message
            .data
            .get("node")
            .cloned()
            .ok_or_else(|| SyncError::BadMessage("node_join_notify without node".into()))?;
        let record: NodeRecord = serde_json::from_value(node_value.clone())?;
        let node_id = record.parsed_node_id()?;

        let allow_join = {
            let conn = self.db.lock().await;
            mesh_q::get(&conn)?.map(|m| m.allow_join).unwrap_or(true)
        };
        if !allow_join {
            warn!(node = node_id, "refusing join: mesh is closed");
            let refusal = CoreMessage::new(MessageType::NodeJoinAck, "ack")
                .with_data("success", json!(false))
                .with_data("reason", json!("mesh is closed to joins"))
                .with_data("node_id", json!(node_id.to_string()));
            self.comm()?
                .send_with_corr_id(ctx.src_node, refusal, ctx.corr_id)
                .await?;
            return Ok(());
        }

        self.add_joining_node(node_id, &record).await?;

        // Detached broadcast: the dispatcher must not wait on a
        // mesh-wide fan-out.
        let comm = self.comm()?;
        let broadcast = CoreMessage::new(MessageType::NodeJoinBroadcast, "node_joined")
            .with_data("node_id", json!(node_id.to_string()))
            .with_data("node", node_value);
        tokio::spawn(async move {
            match tokio::time::timeout(
                JOIN_BROADCAST_TIMEOUT,
                comm.send(BROADCAST_ALL, broadcast),
            )
            .await
            {
                Ok(Ok(_)) => debug!(node = node_id, "join broadcast sent"),
                Ok(Err(e)) => warn!(node = node_id, error = %e, "join broadcast failed"),
                Err(_) => warn!(node = node_id, "join broadcast timed out"),
            }
        });

        let ack = CoreMessage::new(MessageType::NodeJoinAck, "ack")
            .with_data("success", json!(true))
            .with_data("node_id", json!(node_id.to_string()));
        self.comm()?
            .send_with_corr_id(ctx.src_node, ack, ctx.corr_id)
            .await?;
        Ok(())
    }

    /// Broadcast join notification: register the node if it is new.
    /// Never re-broadcasts and never acks.
    async fn handle_node_join_broadcast(&self, ctx: InboundContext) -> Result<()> {
        let node_id = ctx
            .message
            .data
            .get("node_id")
            .and_then(coerce::as_u64)
            .ok_or_else(|| SyncError::BadMessage("node_join_broadcast without node_id".into()))?;

        if node_id == self.local_node {
            return Ok(());
        }
        if self.node_exists(node_id).await? {
            debug!(node = node_id, "join broadcast for known node");
            return Ok(());
        }

        let record = match ctx.message.data.get("node") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => NodeRecord {
                node_id: node_id.to_string(),
                node_name: format!("node-{node_id}"),
                node_description: None,
                node_public_key: String::new(),
                ip_address: String::new(),
                port: 0,
                status: weft_store::STATUS_ONLINE.to_string(),
                seed_node: false,
                original_region_id: None,
            },
        };
        self.add_joining_node(node_id, &record).await?;
        Ok(())
    }

    /// A joiner asked for the user-level tables: reply on the same
    /// correlation ID.
    async fn handle_user_data_sync_request(&self, ctx: InboundContext) -> Result<()> {
        let snapshot = self.user_data_for_sync().await?;
        let reply = CoreMessage::new(MessageType::UserDataSyncResponse, "snapshot")
            .with_data("user_data", serde_json::to_value(&snapshot)?);
        self.comm()?
            .send_with_corr_id(ctx.src_node, reply, ctx.corr_id)
            .await?;
        Ok(())
    }
}

impl<T: Transport> SyncHook for SyncManager<T> {
    fn catch_up(&self, trigger_node: NodeId) -> HookFuture<'_> {
        Box::pin(async move {
            debug!(trigger = trigger_node, "starting table delta catch-up");
            if let Err(e) = self.sync_table_deltas().await {
                warn!(error = %e, "table delta catch-up failed");
            }
        })
    }
}
