//! The event manager.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::hooks::{ConsensusHook, SyncHook};
use crate::{EventError, Result};
use weft_comm::handler::handler;
use weft_comm::CommManager;
use weft_store::queries::{events, membership, mesh, nodes};
use weft_store::SharedConn;
use weft_transport::Transport;
use weft_types::event::{MeshEvent, MeshEventType, MeshStateEvent};
use weft_types::message::MessageType;
use weft_types::{unix_now, NodeId};

/// Bound on events queued for broadcast.
const PUBLISH_QUEUE: usize = 256;

/// Bound on received events queued for processing.
const PROCESS_QUEUE: usize = 1024;

/// Broadcast of one event is given this long before it is dropped.
const BROADCAST_TIMEOUT: Duration = Duration::from_secs(2);

/// Period of the reconciliation task.
const PERIODIC_INTERVAL: Duration = Duration::from_secs(30);

/// Batch size of the periodic unprocessed scan.
const PERIODIC_BATCH: u32 = 100;

/// Processed log rows older than this are pruned.
const PRUNE_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

/// Cap on waiting for the three tasks at stop.
const STOP_WAIT: Duration = Duration::from_secs(3);

/// Orders, persists, and broadcasts mesh state events.
pub struct EventManager<T: Transport> {
    local_node: NodeId,
    db: SharedConn,
    comm: Arc<CommManager<T>>,
    /// Per-node monotonic sequence counter, seeded from the durable log.
    sequence: AtomicU64,
    publish_tx: mpsc::Sender<MeshEvent>,
    publish_rx: Mutex<Option<mpsc::Receiver<MeshEvent>>>,
    process_tx: mpsc::Sender<MeshEvent>,
    process_rx: Mutex<Option<mpsc::Receiver<MeshEvent>>>,
    consensus: RwLock<Option<Arc<dyn ConsensusHook>>>,
    sync: RwLock<Option<Arc<dyn SyncHook>>>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> EventManager<T> {
    /// Create an event manager.
    ///
    /// The sequence counter resumes from the highest sequence this node
    /// has ever logged, so restarts never reuse an event identity.
    pub async fn new(
        local_node: NodeId,
        db: SharedConn,
        comm: Arc<CommManager<T>>,
    ) -> Result<Arc<Self>> {
        let last_sequence = {
            let conn = db.lock().await;
            conn.query_row(
                "SELECT COALESCE(MAX(sequence_number), 0) FROM mesh_event_log
                 WHERE originator_node = ?1",
                [local_node as i64],
                |row| row.get::<_, i64>(0),
            )
            .map_err(weft_store::DbError::Sqlite)? as u64
        };

        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_QUEUE);
        let (process_tx, process_rx) = mpsc::channel(PROCESS_QUEUE);
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Arc::new(Self {
            local_node,
            db,
            comm,
            sequence: AtomicU64::new(last_sequence),
            publish_tx,
            publish_rx: Mutex::new(Some(publish_rx)),
            process_tx,
            process_rx: Mutex::new(Some(process_rx)),
            consensus: RwLock::new(None),
            sync: RwLock::new(None),
            running: AtomicBool::new(true),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Install the consensus checker back-pointer.
    pub fn set_consensus(&self, hook: Arc<dyn ConsensusHook>) {
        *write(&self.consensus) = Some(hook);
    }

    /// Install the sync manager back-pointer.
    pub fn set_sync(&self, hook: Arc<dyn SyncHook>) {
        *write(&self.sync) = Some(hook);
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// Publish a mesh event: assign identity, persist, queue for broadcast.
    ///
    /// Fails without side effects when the publish queue is full.
    pub async fn publish_event(&self, mut event: MeshEvent) -> Result<()> {
        let permit = self
            .publish_tx
            .try_reserve()
            .map_err(|_| EventError::PublishQueueFull)?;

        event.originator_node = self.local_node;
        event.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        event.timestamp = unix_now();

        if !self.persist_event(&event).await? {
            debug!(
                event = %event.event_type,
                affected = event.affected_node,
                "event not persisted; skipping broadcast"
            );
            return Ok(());
        }

        trace!(
            event = %event.event_type,
            sequence = event.sequence,
            "event published"
        );
        permit.send(event);
        Ok(())
    }

    /// Accept an event received from a peer: discard known identities,
    /// persist, and queue for processing.
    pub async fn handle_received_event(&self, event: MeshEvent, src_node: NodeId) -> Result<()> {
        {
            let conn = self.db.lock().await;
            if events::exists(&conn, event.originator_node, event.sequence)? {
                debug!(
                    originator = event.originator_node,
                    sequence = event.sequence,
                    src = src_node,
                    "event already logged"
                );
                return Ok(());
            }
        }
        if !self.persist_event(&event).await? {
            return Ok(());
        }
        if self.process_tx.try_send(event).is_err() {
            // The row is persisted unprocessed; the periodic scan picks
            // it up.
            warn!("process queue full; deferring event to periodic scan");
        }
        Ok(())
    }

    /// Persist an event iff its originator (and affected node, when set)
    /// are known locally. Returns whether a row was written.
    ///
    /// A missing originator means bootstrap has not yet supplied that
    /// node; the event is dropped, not failed.
    async fn persist_event(&self, event: &MeshEvent) -> Result<bool> {
        let conn = self.db.lock().await;
        if !nodes::exists(&conn, event.originator_node)? {
            debug!(
                originator = event.originator_node,
                "originator unknown; skipping event"
            );
            return Ok(false);
        }
        if event.affected_node != 0 && !nodes::exists(&conn, event.affected_node)? {
            debug!(
                affected = event.affected_node,
                "affected node unknown; skipping event"
            );
            return Ok(false);
        }
        Ok(events::insert(&conn, event, unix_now())?)
    }

    /// Register the `mesh_event` message handler with the communication
    /// manager. Part of two-phase wiring.
    pub fn register_mesh_event_handler(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.comm.register_handler(
            MessageType::MeshEvent,
            handler(move |ctx| {
                let manager = Arc::clone(&manager);
                async move {
                    let record = ctx
                        .message
                        .data
                        .get("event")
                        .cloned()
                        .ok_or("mesh_event message carries no event record")?;
                    let wire: MeshStateEvent = serde_json::from_value(record)?;
                    let event = wire.into_event()?;
                    manager.handle_received_event(event, ctx.src_node).await?;
                    Ok(())
                }
            }),
        );
    }

    /// Start the publisher, processor, and periodic tasks.
    pub fn start(self: &Arc<Self>) {
        let Some(mut publish_rx) = lock(&self.publish_rx).take() else {
            warn!("event manager already started");
            return;
        };
        let Some(mut process_rx) = lock(&self.process_rx).take() else {
            warn!("event manager already started");
            return;
        };

        // Publisher: broadcast locally published events.
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let publisher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = publish_rx.recv() => match event {
                        Some(event) => manager.broadcast(event).await,
                        None => break,
                    }
                }
            }
        });

        // Processor: dispatch received events.
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let processor = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = process_rx.recv() => match event {
                        Some(event) => manager.process_one(&event).await,
                        None => break,
                    }
                }
            }
        });

        // Periodic: reconcile unprocessed rows, prune, drive consensus.
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let periodic = tokio::spawn(async move {
            let mut tick = tokio::time::interval(PERIODIC_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tick.tick() => manager.periodic_pass().await,
                }
            }
        });

        lock(&self.tasks).extend([publisher, processor, periodic]);
        info!("event manager started");
    }

    /// Stop the three tasks, waiting up to a bounded time for them.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        let deadline = Instant::now() + STOP_WAIT;
        for handle in handles {
            let abort = handle.abort_handle();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                warn!("event task did not stop in time; aborting");
                abort.abort();
            }
        }
        info!("event manager stopped");
    }

    async fn broadcast(&self, event: MeshEvent) {
        let wire = MeshStateEvent::from_event(&event);
        match tokio::time::timeout(BROADCAST_TIMEOUT, self.comm.broadcast_event(wire)).await {
            Ok(Ok(())) => {
                trace!(event = %event.event_type, sequence = event.sequence, "event broadcast");
            }
            Ok(Err(e)) => {
                if self.running.load(Ordering::SeqCst) {
                    error!(event = %event.event_type, error = %e, "event broadcast failed");
                } else {
                    debug!(event = %event.event_type, error = %e, "broadcast failed during shutdown");
                }
            }
            Err(_) => warn!(event = %event.event_type, "event broadcast timed out"),
        }
    }

    async fn process_one(&self, event: &MeshEvent) {
        match self.dispatch_event(event).await {
            Ok(()) => {
                let conn = self.db.lock().await;
                if let Err(e) =
                    events::mark_processed(&conn, event.originator_node, event.sequence)
                {
                    warn!(error = %e, "failed to mark event processed");
                }
            }
            Err(e) => {
                warn!(
                    event = %event.event_type,
                    originator = event.originator_node,
                    sequence = event.sequence,
                    error = %e,
                    "event handler failed; row stays unprocessed"
                );
            }
        }
    }

    /// One periodic reconciliation pass.
    async fn periodic_pass(&self) {
        let pending = {
            let conn = self.db.lock().await;
            match events::unprocessed(&conn, PERIODIC_BATCH) {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(error = %e, "unprocessed scan failed");
                    Vec::new()
                }
            }
        };
        for event in &pending {
            self.process_one(event).await;
        }

        let cutoff = unix_now().saturating_sub(PRUNE_AGE.as_secs());
        {
            let conn = self.db.lock().await;
            match events::delete_processed_before(&conn, cutoff) {
                Ok(0) => {}
                Ok(n) => debug!(pruned = n, "pruned processed events"),
                Err(e) => warn!(error = %e, "event prune failed"),
            }
        }

        let consensus = read(&self.consensus).clone();
        if let Some(consensus) = consensus {
            consensus.periodic_check().await;
        }
    }

    /// Apply one event to local state, delegating to the consensus
    /// checker and sync manager where required.
    async fn dispatch_event(&self, event: &MeshEvent) -> Result<()> {
        use MeshEventType::*;

        let affected = event.affected_node;
        match event.event_type {
            NodeJoined => {
                self.update_membership(affected, weft_store::MEMBER_ACTIVE).await?;
                self.update_node_status(affected, weft_store::STATUS_ONLINE).await?;
            }
            NodeLeft => {
                self.update_membership(affected, weft_store::MEMBER_LEFT).await?;
                self.update_node_status(affected, weft_store::STATUS_OFFLINE).await?;
            }
            NodeEvicted => {
                self.update_membership(affected, weft_store::MEMBER_EVICTED).await?;
                self.update_node_status(affected, weft_store::STATUS_OFFLINE).await?;
            }
            SessionAdded | NodeStarted | SessionRecovered => {
                self.update_node_status(affected, weft_store::STATUS_ONLINE).await?;
            }
            SessionRemoved | NodeShutdown => {
                self.update_node_status(affected, weft_store::STATUS_OFFLINE).await?;
            }
            SessionInterrupted => {
                self.update_node_status(affected, weft_store::STATUS_DEGRADED).await?;
            }
            NodeOffline => {
                self.update_node_status(affected, weft_store::STATUS_OFFLINE).await?;
                let consensus = read(&self.consensus).clone();
                if let Some(consensus) = consensus {
                    consensus.recheck().await;
                }
            }
            SplitDetected => {
                let consensus = read(&self.consensus).clone();
                if let Some(consensus) = consensus {
                    consensus.recheck().await;
                }
            }
            NodeRecovered => {
                self.update_node_status(affected, weft_store::STATUS_ONLINE).await?;
                let sync = read(&self.sync).clone();
                if let Some(sync) = sync {
                    sync.catch_up(affected).await;
                }
            }
            SplitResolved => {
                let sync = read(&self.sync).clone();
                if let Some(sync) = sync {
                    sync.catch_up(affected).await;
                }
            }
        }
        Ok(())
    }

    async fn update_node_status(&self, node_id: NodeId, status: &str) -> Result<()> {
        if node_id == 0 {
            return Ok(());
        }
        let conn = self.db.lock().await;
        if nodes::exists(&conn, node_id)? {
            nodes::set_status(&conn, node_id, status, unix_now())?;
        }
        Ok(())
    }

    async fn update_membership(&self, node_id: NodeId, status: &str) -> Result<()> {
        if node_id == 0 {
            return Ok(());
        }
        let conn = self.db.lock().await;
        let Some(mesh_row) = mesh::get(&conn)? else {
            return Ok(());
        };
        if nodes::exists(&conn, node_id)? {
            membership::upsert(&conn, &mesh_row.mesh_id, node_id, status, unix_now())?;
        }
        Ok(())
    }
}

fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<V>(rwlock: &RwLock<V>) -> std::sync::RwLockWriteGuard<'_, V> {
    match rwlock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<V>(rwlock: &RwLock<V>) -> std::sync::RwLockReadGuard<'_, V> {
    match rwlock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookFuture;
    use std::sync::atomic::AtomicU32;
    use weft_store::queries::mesh::MeshRow;
    use weft_store::queries::nodes::NodeRow;
    use weft_transport::envelope::SubscribeFilter;
    use weft_transport::hub::{Hub, HubTransport};

    struct CountingConsensus {
        periodic: AtomicU32,
        rechecks: AtomicU32,
    }

    impl ConsensusHook for CountingConsensus {
        fn periodic_check(&self) -> HookFuture<'_> {
            self.periodic.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
        fn recheck(&self) -> HookFuture<'_> {
            self.rechecks.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    struct CountingSync {
        catch_ups: AtomicU32,
    }

    impl SyncHook for CountingSync {
        fn catch_up(&self, _trigger_node: NodeId) -> HookFuture<'_> {
            self.catch_ups.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    async fn test_db(local: NodeId, peers: &[NodeId]) -> SharedConn {
        let conn = weft_store::open_memory().expect("open");
        mesh::upsert(
            &conn,
            &MeshRow {
                mesh_id: "m".to_string(),
                mesh_name: "m".to_string(),
                mesh_description: None,
                allow_join: true,
                split_strategy: "REQUIRE_MAJORITY".to_string(),
                status: weft_store::STATUS_ACTIVE.to_string(),
            },
            1,
        )
        .expect("mesh");
        nodes::upsert(&conn, &NodeRow::minimal(local, format!("n{local}")), 1).expect("node");
        for peer in peers {
            nodes::upsert(&conn, &NodeRow::minimal(*peer, format!("n{peer}")), 1).expect("node");
        }
        weft_store::into_shared(conn)
    }

    async fn test_manager(
        hub: &Arc<Hub>,
        local: NodeId,
        peers: &[NodeId],
    ) -> Arc<EventManager<HubTransport>> {
        let comm = CommManager::new(local, Arc::new(hub.attach(local)));
        comm.subscribe(SubscribeFilter::default())
            .await
            .expect("subscribe");
        let db = test_db(local, peers).await;
        EventManager::new(local, db, comm).await.expect("manager")
    }

    fn event(event_type: MeshEventType, affected: NodeId) -> MeshEvent {
        MeshEvent::new(event_type, affected)
    }

    #[tokio::test]
    async fn test_publish_assigns_identity_and_persists() {
        let hub = Hub::new();
        let em = test_manager(&hub, 1, &[2]).await;

        em.publish_event(event(MeshEventType::NodeJoined, 2))
            .await
            .expect("publish");
        em.publish_event(event(MeshEventType::NodeStarted, 2))
            .await
            .expect("publish");

        let conn = em.db.lock().await;
        assert!(events::exists(&conn, 1, 1).expect("exists"));
        assert!(events::exists(&conn, 1, 2).expect("exists"));
    }

    #[tokio::test]
    async fn test_sequence_resumes_from_log() {
        let hub = Hub::new();
        let comm = CommManager::new(1, Arc::new(hub.attach(1)));
        let db = test_db(1, &[2]).await;
        {
            let conn = db.lock().await;
            let mut seeded = event(MeshEventType::NodeJoined, 2);
            seeded.originator_node = 1;
            seeded.sequence = 5;
            events::insert(&conn, &seeded, 1).expect("seed");
        }
        let em = EventManager::new(1, db, comm).await.expect("manager");
        em.publish_event(event(MeshEventType::NodeStarted, 2))
            .await
            .expect("publish");

        let conn = em.db.lock().await;
        assert!(events::exists(&conn, 1, 6).expect("exists"));
    }

    #[tokio::test]
    async fn test_publish_queue_full_fails_cleanly() {
        let hub = Hub::new();
        let em = test_manager(&hub, 1, &[2]).await;

        // The publisher task is not started, so the queue only drains on
        // failure.
        for _ in 0..PUBLISH_QUEUE {
            em.publish_event(event(MeshEventType::SessionAdded, 2))
                .await
                .expect("publish");
        }
        let err = em
            .publish_event(event(MeshEventType::SessionAdded, 2))
            .await
            .expect_err("queue full");
        assert!(matches!(err, EventError::PublishQueueFull));

        // The failed publish left no row behind.
        let conn = em.db.lock().await;
        assert!(!events::exists(&conn, 1, PUBLISH_QUEUE as u64 + 1).expect("exists"));
    }

    #[tokio::test]
    async fn test_received_duplicate_discarded() {
        let hub = Hub::new();
        let em = test_manager(&hub, 1, &[2]).await;

        let mut incoming = event(MeshEventType::NodeStarted, 2);
        incoming.originator_node = 2;
        incoming.sequence = 1;
        em.handle_received_event(incoming.clone(), 2)
            .await
            .expect("first");
        em.handle_received_event(incoming, 2).await.expect("duplicate");

        let conn = em.db.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM mesh_event_log WHERE originator_node = 2",
                [],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_unknown_originator_skipped() {
        let hub = Hub::new();
        let em = test_manager(&hub, 1, &[2]).await;

        let mut incoming = event(MeshEventType::NodeStarted, 2);
        incoming.originator_node = 99;
        incoming.sequence = 1;
        em.handle_received_event(incoming, 99).await.expect("handle");

        let conn = em.db.lock().await;
        assert!(!events::exists(&conn, 99, 1).expect("exists"));
    }

    #[tokio::test]
    async fn test_dispatch_updates_membership_and_status() {
        let hub = Hub::new();
        let em = test_manager(&hub, 1, &[2]).await;

        let mut left = event(MeshEventType::NodeLeft, 2);
        left.originator_node = 1;
        left.sequence = 1;
        em.dispatch_event(&left).await.expect("dispatch");

        let conn = em.db.lock().await;
        assert_eq!(
            nodes::get(&conn, 2).expect("node").status,
            weft_store::STATUS_OFFLINE
        );
        assert_eq!(
            membership::status_of(&conn, 2).expect("membership").as_deref(),
            Some(weft_store::MEMBER_LEFT)
        );
    }

    #[tokio::test]
    async fn test_node_offline_triggers_consensus_recheck() {
        let hub = Hub::new();
        let em = test_manager(&hub, 1, &[2]).await;
        let consensus = Arc::new(CountingConsensus {
            periodic: AtomicU32::new(0),
            rechecks: AtomicU32::new(0),
        });
        em.set_consensus(consensus.clone());

        let mut offline = event(MeshEventType::NodeOffline, 2);
        offline.originator_node = 1;
        offline.sequence = 1;
        em.dispatch_event(&offline).await.expect("dispatch");

        assert_eq!(consensus.rechecks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovery_triggers_sync_catch_up() {
        let hub = Hub::new();
        let em = test_manager(&hub, 1, &[2]).await;
        let sync = Arc::new(CountingSync {
            catch_ups: AtomicU32::new(0),
        });
        em.set_sync(sync.clone());

        for (seq, event_type) in [
            (1, MeshEventType::NodeRecovered),
            (2, MeshEventType::SplitResolved),
        ] {
            let mut evt = event(event_type, 2);
            evt.originator_node = 1;
            evt.sequence = seq;
            em.dispatch_event(&evt).await.expect("dispatch");
        }

        assert_eq!(sync.catch_ups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_event_flows_across_the_mesh() {
        let hub = Hub::new();
        let a = test_manager(&hub, 1, &[2]).await;
        let b = test_manager(&hub, 2, &[1]).await;

        a.start();
        b.start();
        b.register_mesh_event_handler();

        a.publish_event(event(MeshEventType::NodeStarted, 1))
            .await
            .expect("publish");

        // B persists the received event under A's identity.
        let mut found = false;
        for _ in 0..200 {
            {
                let conn = b.db.lock().await;
                if events::exists(&conn, 1, 1).expect("exists") {
                    found = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(found, "event did not reach node B");

        a.stop().await;
        b.stop().await;
    }
}
