//! The consensus checker.

use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{rules, Result};
use weft_events::hooks::{ConsensusHook, HookFuture};
use weft_events::EventManager;
use weft_store::queries::{consensus as consensus_q, membership, mesh, nodes};
use weft_store::SharedConn;
use weft_transport::Transport;
use weft_types::consensus::{ConsensusState, SplitStrategy};
use weft_types::event::{MeshEvent, MeshEventType};
use weft_types::{unix_now, NodeId};

/// Minimum spacing between periodic split checks.
const CHECK_DEBOUNCE: Duration = Duration::from_secs(10);

/// Detects split-brain and gates local write acceptance.
pub struct ConsensusChecker<T: Transport> {
    local_node: NodeId,
    db: SharedConn,
    transport: Arc<T>,
    events: StdRwLock<Option<Arc<EventManager<T>>>>,
    state: RwLock<ConsensusState>,
    last_check: Mutex<Option<Instant>>,
    /// Configuration override; when unset the mesh row decides.
    strategy_override: Option<SplitStrategy>,
}

impl<T: Transport> ConsensusChecker<T> {
    pub fn new(
        local_node: NodeId,
        db: SharedConn,
        transport: Arc<T>,
        strategy_override: Option<SplitStrategy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_node,
            db,
            transport,
            events: StdRwLock::new(None),
            state: RwLock::new(ConsensusState::default()),
            last_check: Mutex::new(None),
            strategy_override,
        })
    }

    /// Seed the in-memory state from the persisted counters.
    ///
    /// Run once at startup so a node that crashed while split does not
    /// fire a spurious SPLIT_RESOLVED edge on its first check.
    pub async fn restore_persisted(&self) -> Result<()> {
        let row = {
            let conn = self.db.lock().await;
            match mesh::get(&conn)? {
                None => None,
                Some(mesh_row) => consensus_q::get(&conn, &mesh_row.mesh_id)?,
            }
        };
        let Some(row) = row else {
            return Ok(());
        };
        let mut state = self.state.write().await;
        state.total_nodes = row.total_nodes;
        state.online_nodes = row.online_nodes;
        state.split_detected = row.split_detected;
        state.is_majority_partition = row.majority_side;
        debug!(
            split = row.split_detected,
            total = row.total_nodes,
            "restored persisted consensus state"
        );
        Ok(())
    }

    /// Install the event manager back-pointer.
    pub fn set_events(&self, events: Arc<EventManager<T>>) {
        match self.events.write() {
            Ok(mut guard) => *guard = Some(events),
            Err(poisoned) => *poisoned.into_inner() = Some(events),
        }
    }

    /// The current write-gate decision.
    pub async fn can_accept_writes(&self) -> bool {
        self.state.read().await.can_accept_writes
    }

    /// A snapshot of the current consensus state.
    pub async fn state(&self) -> ConsensusState {
        self.state.read().await.clone()
    }

    /// Debounced check, invoked from the event manager's periodic task.
    pub async fn periodic_check(&self) -> Result<()> {
        {
            let mut last = lock(&self.last_check);
            if let Some(at) = *last {
                if at.elapsed() < CHECK_DEBOUNCE {
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }
        self.check_split_brain().await?;
        Ok(())
    }

    /// Manual re-check, returning the resulting state.
    pub async fn trigger_consensus_check(&self) -> Result<ConsensusState> {
        self.check_split_brain().await
    }

    /// Recompute the consensus state, fire edge transitions, and persist.
    pub async fn check_split_brain(&self) -> Result<ConsensusState> {
        let (mesh_id, total_nodes, strategy, seed_node_id) = self.read_inputs().await?;

        let sessions = self.transport.sessions().await?;
        let online_nodes = sessions.peer_count() + 1;
        let seed_in_partition = self.local_node == seed_node_id
            || sessions
                .sessions
                .iter()
                .any(|s| s.peer_node_id == seed_node_id);

        let split_detected = rules::detect_split(total_nodes, online_nodes);
        let can_accept_writes = if split_detected {
            rules::can_accept_writes_in_split(strategy, total_nodes, online_nodes, seed_in_partition)
        } else {
            true
        };

        let new_state = ConsensusState {
            total_nodes,
            online_nodes,
            split_detected,
            is_majority_partition: online_nodes >= rules::majority(total_nodes),
            split_strategy: strategy,
            seed_node_id,
            can_accept_writes,
        };

        let previous = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, new_state.clone())
        };

        if !previous.split_detected && new_state.split_detected {
            self.publish_transition(MeshEventType::SplitDetected, &new_state)
                .await;
            self.handle_split_brain(&new_state);
        } else if previous.split_detected && !new_state.split_detected {
            self.publish_transition(MeshEventType::SplitResolved, &new_state)
                .await;
            self.resolve_split_brain();
        }

        if let Some(mesh_id) = mesh_id {
            let conn = self.db.lock().await;
            consensus_q::upsert(
                &conn,
                &consensus_q::ConsensusRow {
                    mesh_id,
                    total_nodes: new_state.total_nodes,
                    online_nodes: new_state.online_nodes,
                    split_detected: new_state.split_detected,
                    majority_side: new_state.is_majority_partition,
                    last_consensus_check: unix_now(),
                },
            )?;
        }

        Ok(new_state)
    }

    /// Split onset: the gate is already computed; log the decision loudly.
    fn handle_split_brain(&self, state: &ConsensusState) {
        if state.can_accept_writes {
            warn!(
                total = state.total_nodes,
                online = state.online_nodes,
                strategy = %state.split_strategy,
                "split-brain detected; this partition keeps accepting writes"
            );
        } else {
            warn!(
                total = state.total_nodes,
                online = state.online_nodes,
                strategy = %state.split_strategy,
                "split-brain detected; rejecting writes until the mesh heals"
            );
        }
    }

    /// Split cleared: writes re-enable optimistically; the SPLIT_RESOLVED
    /// event drives the sync manager's catch-up when it is processed.
    fn resolve_split_brain(&self) {
        info!("split-brain resolved; write acceptance restored");
    }

    async fn read_inputs(
        &self,
    ) -> Result<(Option<String>, u32, SplitStrategy, NodeId)> {
        let conn = self.db.lock().await;
        let mesh_row = mesh::get(&conn)?;

        let total_nodes = match &mesh_row {
            // A clean node with no mesh row counts only itself.
            None => 1,
            Some(_) => membership::count_active(&conn)?.max(1),
        };

        let strategy = match self.strategy_override {
            Some(strategy) => strategy,
            None => match &mesh_row {
                None => SplitStrategy::default(),
                Some(row) => row.split_strategy.parse().unwrap_or_else(|e| {
                    warn!(error = %e, "falling back to REQUIRE_MAJORITY");
                    SplitStrategy::RequireMajority
                }),
            },
        };

        let seed_node_id = nodes::seed_node_id(&conn)?.unwrap_or(0);
        Ok((
            mesh_row.map(|m| m.mesh_id),
            total_nodes,
            strategy,
            seed_node_id,
        ))
    }

    async fn publish_transition(&self, event_type: MeshEventType, state: &ConsensusState) {
        let events = match self.events.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(events) = events else {
            debug!(event = %event_type, "no event manager attached; transition not published");
            return;
        };
        let event = MeshEvent::new(event_type, 0)
            .with_metadata("split_strategy", state.split_strategy.as_str())
            .with_metadata("total_nodes", state.total_nodes.to_string())
            .with_metadata("online_nodes", state.online_nodes.to_string());
        if let Err(e) = events.publish_event(event).await {
            warn!(event = %event_type, error = %e, "failed to publish consensus transition");
        }
    }
}

impl<T: Transport> ConsensusHook for ConsensusChecker<T> {
    fn periodic_check(&self) -> HookFuture<'_> {
        Box::pin(async move {
            if let Err(e) = ConsensusChecker::periodic_check(self).await {
                warn!(error = %e, "periodic consensus check failed");
            }
        })
    }

    fn recheck(&self) -> HookFuture<'_> {
        Box::pin(async move {
            if let Err(e) = self.check_split_brain().await {
                warn!(error = %e, "consensus recheck failed");
            }
        })
    }
}

fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_comm::CommManager;
    use weft_store::queries::mesh::MeshRow;
    use weft_store::queries::nodes::NodeRow;
    use weft_transport::envelope::SubscribeFilter;
    use weft_transport::hub::{Hub, HubTransport};

    /// A mesh of `nodes` members on one hub; every node is subscribed so
    /// sessions are visible. Node 1 is the seed.
    async fn build_mesh(
        hub: &Arc<Hub>,
        local: NodeId,
        members: &[NodeId],
        strategy: &str,
    ) -> (SharedConn, Arc<HubTransport>) {
        let conn = weft_store::open_memory().expect("open");
        mesh::upsert(
            &conn,
            &MeshRow {
                mesh_id: "m".to_string(),
                mesh_name: "m".to_string(),
                mesh_description: None,
                allow_join: true,
                split_strategy: strategy.to_string(),
                status: weft_store::STATUS_ACTIVE.to_string(),
            },
            1,
        )
        .expect("mesh");
        for id in members {
            let mut node = NodeRow::minimal(*id, format!("n{id}"));
            node.seed_node = *id == 1;
            nodes::upsert(&conn, &node, 1).expect("node");
            membership::upsert(&conn, "m", *id, weft_store::MEMBER_ACTIVE, 1).expect("member");
        }
        let transport = Arc::new(hub.attach(local));
        (weft_store::into_shared(conn), transport)
    }

    async fn subscribe_all(hub: &Arc<Hub>, ids: &[NodeId]) {
        for id in ids {
            let t = hub.attach(*id);
            let _ = t
                .subscribe(SubscribeFilter::default())
                .await
                .expect("subscribe");
        }
    }

    #[tokio::test]
    async fn test_healthy_mesh_accepts_writes() {
        let hub = Hub::new();
        subscribe_all(&hub, &[1, 2, 3, 4]).await;
        let (db, transport) = build_mesh(&hub, 1, &[1, 2, 3, 4], "REQUIRE_MAJORITY").await;
        let checker = ConsensusChecker::new(1, db, transport, None);

        let state = checker.check_split_brain().await.expect("check");
        assert!(!state.split_detected);
        assert!(state.can_accept_writes);
        assert_eq!(state.total_nodes, 4);
        assert_eq!(state.online_nodes, 4);
        assert_eq!(state.seed_node_id, 1);
    }

    #[tokio::test]
    async fn test_minority_partition_rejects_writes() {
        let hub = Hub::new();
        subscribe_all(&hub, &[1, 2, 3, 4]).await;
        hub.set_partition(&[&[1], &[2, 3, 4]]);
        let (db, transport) = build_mesh(&hub, 1, &[1, 2, 3, 4], "REQUIRE_MAJORITY").await;
        let checker = ConsensusChecker::new(1, db, transport, None);

        let state = checker.check_split_brain().await.expect("check");
        assert!(state.split_detected);
        assert!(!state.can_accept_writes);
        assert!(!state.is_majority_partition);
        assert!(!checker.can_accept_writes().await);
    }

    #[tokio::test]
    async fn test_even_split_seed_side_prevails() {
        let hub = Hub::new();
        subscribe_all(&hub, &[1, 2, 3, 4]).await;
        hub.set_partition(&[&[1, 2], &[3, 4]]);

        // Node 2 sees the seed in its partition.
        let (db, transport) =
            build_mesh(&hub, 2, &[1, 2, 3, 4], "SEED_NODE_PREVAILS_IN_EVEN_SPLIT").await;
        let checker = ConsensusChecker::new(2, db, transport, None);
        let state = checker.check_split_brain().await.expect("check");
        assert!(state.split_detected);
        assert!(state.can_accept_writes);

        // Node 3 does not.
        let (db, transport) =
            build_mesh(&hub, 3, &[1, 2, 3, 4], "SEED_NODE_PREVAILS_IN_EVEN_SPLIT").await;
        let checker = ConsensusChecker::new(3, db, transport, None);
        let state = checker.check_split_brain().await.expect("check");
        assert!(state.split_detected);
        assert!(!state.can_accept_writes);
    }

    #[tokio::test]
    async fn test_unknown_strategy_falls_back_to_majority() {
        let hub = Hub::new();
        subscribe_all(&hub, &[1, 2]).await;
        hub.set_partition(&[&[1], &[2]]);
        let (db, transport) = build_mesh(&hub, 1, &[1, 2], "COIN_FLIP").await;
        let checker = ConsensusChecker::new(1, db, transport, None);

        let state = checker.check_split_brain().await.expect("check");
        assert_eq!(state.split_strategy, SplitStrategy::RequireMajority);
        assert!(state.split_detected);
        assert!(!state.can_accept_writes);
    }

    #[tokio::test]
    async fn test_clean_node_defaults_to_single_member() {
        let hub = Hub::new();
        let conn = weft_store::open_memory().expect("open");
        let db = weft_store::into_shared(conn);
        let transport = Arc::new(hub.attach(1));
        let checker = ConsensusChecker::new(1, db.clone(), transport, None);

        let state = checker.check_split_brain().await.expect("check");
        assert_eq!(state.total_nodes, 1);
        assert!(!state.split_detected);
        assert!(state.can_accept_writes);

        // No mesh row: nothing persisted.
        let conn = db.lock().await;
        assert!(consensus_q::get(&conn, "m").expect("get").is_none());
    }

    #[tokio::test]
    async fn test_state_persisted_for_mesh() {
        let hub = Hub::new();
        subscribe_all(&hub, &[1, 2]).await;
        let (db, transport) = build_mesh(&hub, 1, &[1, 2], "REQUIRE_MAJORITY").await;
        let checker = ConsensusChecker::new(1, db.clone(), transport, None);
        checker.check_split_brain().await.expect("check");

        let conn = db.lock().await;
        let row = consensus_q::get(&conn, "m").expect("get").expect("row");
        assert_eq!(row.total_nodes, 2);
        assert_eq!(row.online_nodes, 2);
        assert!(!row.split_detected);
    }

    #[tokio::test]
    async fn test_split_edges_publish_events() {
        let hub = Hub::new();
        subscribe_all(&hub, &[2, 3, 4]).await;
        let (db, transport) = build_mesh(&hub, 1, &[1, 2, 3, 4], "REQUIRE_MAJORITY").await;

        let comm = CommManager::new(1, transport.clone());
        comm.subscribe(SubscribeFilter::default())
            .await
            .expect("subscribe");
        let events = weft_events::EventManager::new(1, db.clone(), comm)
            .await
            .expect("events");
        let checker = ConsensusChecker::new(1, db.clone(), transport, None);
        checker.set_events(events);

        // Healthy first.
        checker.check_split_brain().await.expect("check");
        // Partition away everyone else.
        hub.set_partition(&[&[1], &[2, 3, 4]]);
        let state = checker.check_split_brain().await.expect("check");
        assert!(state.split_detected);
        {
            let conn = db.lock().await;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM mesh_event_log WHERE event_type = 'SPLIT_DETECTED'",
                    [],
                    |r| r.get(0),
                )
                .expect("count");
            assert_eq!(count, 1);
        }

        // Heal; the falling edge publishes SPLIT_RESOLVED and reopens the
        // gate.
        hub.heal_partition();
        let state = checker.check_split_brain().await.expect("check");
        assert!(!state.split_detected);
        assert!(state.can_accept_writes);
        let conn = db.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM mesh_event_log WHERE event_type = 'SPLIT_RESOLVED'",
                [],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_restore_persisted_keeps_split_flag() {
        let hub = Hub::new();
        subscribe_all(&hub, &[1, 2]).await;
        let (db, transport) = build_mesh(&hub, 1, &[1, 2], "REQUIRE_MAJORITY").await;
        {
            let conn = db.lock().await;
            consensus_q::upsert(
                &conn,
                &consensus_q::ConsensusRow {
                    mesh_id: "m".to_string(),
                    total_nodes: 4,
                    online_nodes: 1,
                    split_detected: true,
                    majority_side: false,
                    last_consensus_check: 123,
                },
            )
            .expect("persist");
        }

        let checker = ConsensusChecker::new(1, db, transport, None);
        checker.restore_persisted().await.expect("restore");
        let state = checker.state().await;
        assert!(state.split_detected);
        assert!(!state.is_majority_partition);

        // The mesh is actually healthy now, so the first real check fires
        // the falling edge instead of silently flipping.
        let state = checker.check_split_brain().await.expect("check");
        assert!(!state.split_detected);
    }

    #[tokio::test]
    async fn test_periodic_check_debounces() {
        let hub = Hub::new();
        subscribe_all(&hub, &[1, 2]).await;
        let (db, transport) = build_mesh(&hub, 1, &[1, 2], "REQUIRE_MAJORITY").await;
        let checker = ConsensusChecker::new(1, db, transport, None);

        checker.periodic_check().await.expect("first");
        let before = checker.state().await;
        assert_eq!(before.online_nodes, 2);

        // Partition now; the debounced second call must not re-check.
        hub.set_partition(&[&[1], &[2]]);
        checker.periodic_check().await.expect("debounced");
        assert!(!checker.state().await.split_detected);

        // A manual trigger bypasses the debounce.
        let state = checker.trigger_consensus_check().await.expect("trigger");
        assert!(state.split_detected);
    }
}
