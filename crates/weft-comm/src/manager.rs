//! The communication manager.
//!
//! One manager per node. It owns the single subscription stream, the
//! handler registry, the dedup map, and the two correlation tables
//! (pending requests by `request_id`, pending ack callbacks by `corr_id`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::dedup::{DedupKey, DedupMap};
use crate::handler::{Handler, InboundContext, ResponseAck};
use crate::{CommError, Result};
use weft_transport::envelope::{
    AckRequest, DeliveryMode, Header, ReceivedMessage, SendRequest, SubscribeFilter,
    HDR_BROADCAST, HDR_MESSAGE_TYPE, HDR_OPERATION, HDR_SOURCE_NODE,
};
use weft_transport::Transport;
use weft_types::event::MeshStateEvent;
use weft_types::message::{CoreMessage, MessageType};
use weft_types::{unix_now, NodeId, BROADCAST_ALL};

/// Bound on the hand-off buffer between the reader and the dispatcher.
const INBOUND_BUFFER: usize = 1024;

/// Ack sends are bounded so shutdown can never block behind one.
const ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Keepalive tick, below the transport's 30 s heartbeat.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(25);

/// Dedup sweeper period.
const SWEEP_PERIOD: Duration = Duration::from_secs(300);

/// Cap on waiting for the reader/dispatch/sweeper tasks at stop.
const STOP_WAIT: Duration = Duration::from_secs(3);

/// QoS class and transport partition for a message type.
///
/// DB updates ride the high-priority class on their own partition; anchor
/// queries and commands keep interactive priority but are partitioned so
/// bulk traffic cannot reorder them.
pub fn qos_for(msg_type: MessageType) -> (u32, u32) {
    match msg_type {
        MessageType::DbUpdate => (2, 1),
        MessageType::AnchorQuery => (1, 2),
        MessageType::Command => (1, 0),
        _ => (1, 1),
    }
}

/// Correlated messaging front-end over the transport adapter.
pub struct CommManager<T: Transport> {
    local_node: NodeId,
    transport: Arc<T>,
    handlers: RwLock<HashMap<MessageType, Handler>>,
    pending_requests: Mutex<HashMap<String, oneshot::Sender<CoreMessage>>>,
    pending_acks: Mutex<HashMap<u64, mpsc::Sender<ResponseAck>>>,
    dedup: Mutex<DedupMap>,
    /// Monotonic correlation clock (nanoseconds, strictly increasing).
    corr_clock: AtomicU64,
    running: AtomicBool,
    subscribed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> CommManager<T> {
    /// Create a manager for the given local node over a transport.
    pub fn new(local_node: NodeId, transport: Arc<T>) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            local_node,
            transport,
            handlers: RwLock::new(HashMap::new()),
            pending_requests: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
            dedup: Mutex::new(DedupMap::new()),
            corr_clock: AtomicU64::new(0),
            running: AtomicBool::new(true),
            subscribed: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register (or replace) the handler for a message type.
    pub fn register_handler(&self, msg_type: MessageType, handler: Handler) {
        write(&self.handlers).insert(msg_type, handler);
    }

    /// Fire-and-forget send with a fresh correlation ID.
    ///
    /// Returns the transport message ID once the transport has accepted
    /// the envelope; remote processing is confirmed separately via acks.
    pub async fn send(&self, dst: NodeId, msg: CoreMessage) -> Result<u64> {
        let corr_id = self.next_corr_id();
        self.send_with_corr_id(dst, msg, corr_id).await
    }

    /// Send preserving a caller-supplied correlation ID.
    ///
    /// Used by handlers producing responses, so the originator's callback
    /// channel can match the reply to its request.
    pub async fn send_with_corr_id(
        &self,
        dst: NodeId,
        mut msg: CoreMessage,
        corr_id: u64,
    ) -> Result<u64> {
        msg.timestamp = unix_now();
        let req = self.build_request(dst, &msg, corr_id)?;
        match self.transport.send(req).await {
            Ok(receipt) => {
                trace!(dst, corr_id, msg_type = %msg.msg_type, "sent");
                Ok(receipt.msg_id)
            }
            Err(e) if !self.is_running() => {
                debug!(dst, error = %e, "send failed during shutdown");
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send, registering `ack_tx` to receive a [`ResponseAck`] when a
    /// message bearing the same correlation ID arrives back.
    ///
    /// The registration happens before transmission so the callback cannot
    /// lose the race against a fast peer.
    pub async fn send_with_callback(
        &self,
        dst: NodeId,
        msg: CoreMessage,
        ack_tx: mpsc::Sender<ResponseAck>,
    ) -> Result<u64> {
        let corr_id = self.next_corr_id();
        lock(&self.pending_acks).insert(corr_id, ack_tx);
        match self.send_with_corr_id(dst, msg, corr_id).await {
            Ok(_) => Ok(corr_id),
            Err(e) => {
                lock(&self.pending_acks).remove(&corr_id);
                Err(e)
            }
        }
    }

    /// Send and wait up to `timeout` for a `response`-typed message whose
    /// `request_id` matches.
    pub async fn send_with_response(
        &self,
        dst: NodeId,
        mut msg: CoreMessage,
        timeout: Duration,
    ) -> Result<CoreMessage> {
        let request_id = self.generate_request_id();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending_requests).insert(request_id.clone(), tx);
        msg.request_id = Some(request_id.clone());

        if let Err(e) = self.send(dst, msg).await {
            lock(&self.pending_requests).remove(&request_id);
            return Err(e);
        }

        let mut shutdown = self.shutdown_tx.subscribe();
        let result = tokio::select! {
            res = tokio::time::timeout(timeout, rx) => match res {
                Ok(Ok(message)) => Ok(message),
                Ok(Err(_)) => Err(CommError::ShuttingDown),
                Err(_) => Err(CommError::ResponseTimeout(timeout)),
            },
            _ = shutdown.recv() => Err(CommError::ShuttingDown),
        };
        if result.is_err() {
            lock(&self.pending_requests).remove(&request_id);
        }
        result
    }

    /// Message counters from the underlying transport.
    pub async fn transport_metrics(&self) -> Result<weft_transport::session::MessageMetrics> {
        Ok(self.transport.message_metrics().await?)
    }

    /// Mesh topology as the underlying transport sees it.
    pub async fn transport_topology(&self) -> Result<weft_transport::session::TopologyReport> {
        Ok(self.transport.topology().await?)
    }

    /// Broadcast a mesh state event to every node.
    pub async fn broadcast_event(&self, event: MeshStateEvent) -> Result<()> {
        match self.transport.broadcast_state_event(event).await {
            Ok(()) => Ok(()),
            Err(e) if !self.is_running() => {
                debug!(error = %e, "state event broadcast failed during shutdown");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open the manager's single subscription stream and start the reader,
    /// dispatcher, and dedup sweeper tasks.
    pub async fn subscribe(self: &Arc<Self>, filter: SubscribeFilter) -> Result<()> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(CommError::AlreadySubscribed);
        }
        let mut sub = match self.transport.subscribe(filter).await {
            Ok(sub) => sub,
            Err(e) => {
                self.subscribed.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let (inbound_tx, mut inbound_rx) = mpsc::channel::<ReceivedMessage>(INBOUND_BUFFER);

        // Reader: blocking receives off the stream, forwarded to the
        // dispatcher through the bounded buffer.
        let mgr = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let reader = tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_PERIOD);
            keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        sub.close();
                        break;
                    }
                    received = sub.recv() => match received {
                        Some(msg) => {
                            if inbound_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            if mgr.is_running() {
                                warn!("subscription stream ended");
                            }
                            break;
                        }
                    },
                    _ = keepalive.tick() => {
                        // Keeps the stream select armed below the
                        // transport's heartbeat period.
                        trace!("subscription keepalive");
                    }
                }
            }
        });

        // Dispatcher: one envelope at a time through the pipeline.
        let mgr = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let dispatcher = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    received = inbound_rx.recv() => match received {
                        Some(msg) => mgr.process_message(msg).await,
                        None => break,
                    }
                }
            }
        });

        // Sweeper: expire dedup entries.
        let mgr = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_PERIOD);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tick.tick() => {
                        let removed = lock(&mgr.dedup).sweep(Instant::now());
                        if removed > 0 {
                            debug!(removed, "swept dedup entries");
                        }
                    }
                }
            }
        });

        lock(&self.tasks).extend([reader, dispatcher, sweeper]);
        Ok(())
    }

    /// Stop the manager: cancel the tasks, close the stream, and fail all
    /// pending request waits.
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
                warn!("communication task did not stop in time; aborting");
                abort.abort();
            }
        }

        // Dropping the senders wakes every pending request with an error.
        lock(&self.pending_requests).clear();
        lock(&self.pending_acks).clear();
        write(&self.handlers).clear();
        self.subscribed.store(false, Ordering::SeqCst);
    }

    /// The receive pipeline for one inbound envelope.
    async fn process_message(&self, received: ReceivedMessage) {
        let key = DedupKey {
            src_node: received.src_node,
            msg_id: received.msg_id,
            corr_id: received.corr_id,
        };
        if lock(&self.dedup).check_and_record(key, Instant::now()) {
            debug!(src = received.src_node, msg_id = received.msg_id, "duplicate delivery");
            if received.require_ack {
                // Positive ack so the transport stops retrying.
                self.ack(&received, true, "duplicate delivery").await;
            }
            return;
        }

        let message = match CoreMessage::from_bytes(&received.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(src = received.src_node, error = %e, "malformed payload");
                if received.require_ack {
                    self.ack(&received, false, "malformed payload").await;
                }
                return;
            }
        };

        // Response fast path: hand the message to its waiting request.
        if message.msg_type == MessageType::Response {
            if let Some(request_id) = message.request_id.clone() {
                let waiter = lock(&self.pending_requests).remove(&request_id);
                if let Some(tx) = waiter {
                    let _ = tx.send(message.clone());
                    if received.require_ack {
                        self.ack(&received, true, "response delivered").await;
                    }
                    self.deliver_response_ack(&received, true, "response delivered", message);
                    return;
                }
            }
        }

        let handler = read(&self.handlers).get(&message.msg_type).cloned();
        let (success, note) = match handler {
            Some(handler) => {
                let ctx = InboundContext {
                    src_node: received.src_node,
                    msg_id: received.msg_id,
                    corr_id: received.corr_id,
                    message: message.clone(),
                };
                match handler(ctx).await {
                    Ok(()) => (true, "processed"),
                    Err(e) => {
                        error!(
                            msg_type = %message.msg_type,
                            src = received.src_node,
                            error = %e,
                            "handler failed"
                        );
                        (false, "handler failed")
                    }
                }
            }
            None => {
                warn!(msg_type = %message.msg_type, "no handler registered");
                (true, "no handler registered")
            }
        };

        if received.require_ack {
            let acked = self.ack(&received, success, note).await;
            if acked && received.corr_id > 0 {
                self.deliver_response_ack(&received, success, note, message);
            }
        }
    }

    /// Send the transport-level ack for a received envelope. Returns
    /// whether the ack was delivered.
    async fn ack(&self, received: &ReceivedMessage, success: bool, note: &str) -> bool {
        let ack = AckRequest {
            src_node: received.src_node,
            msg_id: received.msg_id,
            success,
            message: note.to_string(),
        };
        match tokio::time::timeout(ACK_TIMEOUT, self.transport.ack_message(ack)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                if self.is_running() {
                    warn!(msg_id = received.msg_id, error = %e, "ack failed");
                } else {
                    debug!(msg_id = received.msg_id, error = %e, "ack failed during shutdown");
                }
                false
            }
            Err(_) => {
                warn!(msg_id = received.msg_id, "ack timed out");
                false
            }
        }
    }

    /// Deliver an application-level ack to the callback registered under
    /// this envelope's correlation ID, if any. Never blocks.
    fn deliver_response_ack(
        &self,
        received: &ReceivedMessage,
        success: bool,
        note: &str,
        response: CoreMessage,
    ) {
        let waiter = lock(&self.pending_acks).remove(&received.corr_id);
        if let Some(tx) = waiter {
            let ack = ResponseAck {
                msg_id: received.msg_id,
                success,
                message: note.to_string(),
                response: Some(response),
            };
            if tx.try_send(ack).is_err() {
                debug!(corr_id = received.corr_id, "ack callback receiver gone or full");
            }
        }
    }

    fn build_request(&self, dst: NodeId, msg: &CoreMessage, corr_id: u64) -> Result<SendRequest> {
        let payload = msg.to_bytes()?;
        let (qos_class, partition) = qos_for(msg.msg_type);
        let broadcast = dst == BROADCAST_ALL;
        let mut headers = vec![
            Header::new(HDR_MESSAGE_TYPE, msg.msg_type.as_str().as_bytes().to_vec()),
            Header::new(HDR_OPERATION, msg.operation.as_bytes().to_vec()),
            Header::new(HDR_SOURCE_NODE, self.local_node.to_string().into_bytes()),
        ];
        if broadcast {
            headers.push(Header::new(HDR_BROADCAST, b"true".to_vec()));
        }
        Ok(SendRequest {
            dst_node: dst,
            payload,
            corr_id,
            // Broadcast receivers never ack: the sender cannot collect a
            // mesh-wide quorum of acks and receivers must not re-trigger it.
            require_ack: !broadcast,
            mode: DeliveryMode::FireAndForget,
            qos_class,
            partition,
            headers,
        })
    }

    /// Strictly increasing correlation IDs derived from the wall clock in
    /// nanoseconds.
    fn next_corr_id(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut prev = self.corr_clock.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self.corr_clock.compare_exchange_weak(
                prev,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }

    fn generate_request_id(&self) -> String {
        let mut buf = [0u8; 8];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut buf);
        format!("req-{}-{}", self.local_node, hex::encode(buf))
    }
}

/// Lock a mutex, recovering from poisoning (a panicked task must not take
/// the whole manager down with it).
fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// As [`lock`], for the handler registry's write side.
fn write<V>(rwlock: &RwLock<V>) -> std::sync::RwLockWriteGuard<'_, V> {
    match rwlock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// As [`lock`], for the handler registry's read side.
fn read<V>(rwlock: &RwLock<V>) -> std::sync::RwLockReadGuard<'_, V> {
    match rwlock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler;
    use std::sync::atomic::AtomicU32;
    use weft_transport::hub::{Hub, HubTransport};

    async fn subscribed_manager(
        hub: &Arc<Hub>,
        node: NodeId,
    ) -> Arc<CommManager<HubTransport>> {
        let mgr = CommManager::new(node, Arc::new(hub.attach(node)));
        mgr.subscribe(SubscribeFilter::default())
            .await
            .expect("subscribe");
        mgr
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cond(), "condition not reached in time");
    }

    #[test]
    fn test_qos_derivation() {
        assert_eq!(qos_for(MessageType::DbUpdate), (2, 1));
        assert_eq!(qos_for(MessageType::AnchorQuery), (1, 2));
        assert_eq!(qos_for(MessageType::Command), (1, 0));
        assert_eq!(qos_for(MessageType::MeshEvent), (1, 1));
    }

    #[tokio::test]
    async fn test_corr_ids_strictly_increase() {
        let hub = Hub::new();
        let mgr = CommManager::new(1, Arc::new(hub.attach(1)));
        let mut prev = 0;
        for _ in 0..1000 {
            let next = mgr.next_corr_id();
            assert!(next > prev);
            prev = next;
        }
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let hub = Hub::new();
        let a = subscribed_manager(&hub, 1).await;
        let b = subscribed_manager(&hub, 2).await;

        let responder = Arc::clone(&b);
        b.register_handler(
            MessageType::AnchorQuery,
            handler(move |ctx: InboundContext| {
                let comm = Arc::clone(&responder);
                async move {
                    let mut reply = CoreMessage::new(MessageType::Response, "get_status")
                        .with_data("status", serde_json::json!("READY"));
                    reply.request_id = ctx.message.request_id.clone();
                    comm.send_with_corr_id(ctx.src_node, reply, ctx.corr_id)
                        .await?;
                    Ok(())
                }
            }),
        );

        let query = CoreMessage::new(MessageType::AnchorQuery, "get_status");
        let response = a
            .send_with_response(2, query, Duration::from_secs(5))
            .await
            .expect("response");
        assert_eq!(response.msg_type, MessageType::Response);
        assert_eq!(
            response.data.get("status").and_then(|v| v.as_str()),
            Some("READY")
        );
    }

    #[tokio::test]
    async fn test_response_timeout_cleans_pending() {
        let hub = Hub::new();
        let a = subscribed_manager(&hub, 1).await;
        let _b = subscribed_manager(&hub, 2).await;

        let err = a
            .send_with_response(
                2,
                CoreMessage::new(MessageType::AnchorQuery, "never_answered"),
                Duration::from_millis(50),
            )
            .await
            .expect_err("should time out");
        assert!(matches!(err, CommError::ResponseTimeout(_)));
        assert!(lock(&a.pending_requests).is_empty());
    }

    #[tokio::test]
    async fn test_callback_receives_response_ack() {
        let hub = Hub::new();
        let a = subscribed_manager(&hub, 1).await;
        let b = subscribed_manager(&hub, 2).await;

        let responder = Arc::clone(&b);
        b.register_handler(
            MessageType::MeshSyncRequest,
            handler(move |ctx: InboundContext| {
                let comm = Arc::clone(&responder);
                async move {
                    let reply = CoreMessage::new(MessageType::MeshSyncResponse, "snapshot")
                        .with_data("mesh", serde_json::json!({"mesh_id": "m"}));
                    comm.send_with_corr_id(ctx.src_node, reply, ctx.corr_id)
                        .await?;
                    Ok(())
                }
            }),
        );
        // The response lands with no handler on A; that is still a success.
        let (tx, mut rx) = mpsc::channel(1);
        a.send_with_callback(2, CoreMessage::new(MessageType::MeshSyncRequest, "snapshot"), tx)
            .await
            .expect("send");

        let ack = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("ack in time")
            .expect("ack");
        assert!(ack.success);
        let response = ack.response.expect("response message");
        assert_eq!(response.msg_type, MessageType::MeshSyncResponse);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_processes_once_acks_thrice() {
        let hub = Hub::new();
        let b = subscribed_manager(&hub, 2).await;

        let invocations = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&invocations);
        b.register_handler(
            MessageType::Command,
            handler(move |_ctx: InboundContext| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let payload = CoreMessage::new(MessageType::Command, "restart")
            .to_bytes()
            .expect("serialize");
        let envelope = ReceivedMessage {
            src_node: 1,
            msg_id: 77,
            corr_id: 5,
            require_ack: true,
            payload,
        };
        for _ in 0..3 {
            b.process_message(envelope.clone()).await;
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        let acks = hub.acks();
        assert_eq!(acks.len(), 3);
        assert!(acks.iter().all(|a| a.success && a.msg_id == 77));
    }

    #[tokio::test]
    async fn test_unregistered_type_acks_success() {
        let hub = Hub::new();
        let b = subscribed_manager(&hub, 2).await;

        let payload = CoreMessage::new(MessageType::DbUpdate, "upsert")
            .to_bytes()
            .expect("serialize");
        b.process_message(ReceivedMessage {
            src_node: 1,
            msg_id: 10,
            corr_id: 0,
            require_ack: true,
            payload,
        })
        .await;

        let acks = hub.acks();
        assert_eq!(acks.len(), 1);
        assert!(acks[0].success);
    }

    #[tokio::test]
    async fn test_handler_error_shapes_negative_ack() {
        let hub = Hub::new();
        let b = subscribed_manager(&hub, 2).await;
        b.register_handler(
            MessageType::Command,
            handler(|_ctx: InboundContext| async move { Err("deliberate failure".into()) }),
        );

        let payload = CoreMessage::new(MessageType::Command, "explode")
            .to_bytes()
            .expect("serialize");
        b.process_message(ReceivedMessage {
            src_node: 1,
            msg_id: 11,
            corr_id: 0,
            require_ack: true,
            payload,
        })
        .await;

        let acks = hub.acks();
        assert_eq!(acks.len(), 1);
        assert!(!acks[0].success);
    }

    #[tokio::test]
    async fn test_malformed_payload_acks_failure() {
        let hub = Hub::new();
        let b = subscribed_manager(&hub, 2).await;
        b.process_message(ReceivedMessage {
            src_node: 1,
            msg_id: 12,
            corr_id: 0,
            require_ack: true,
            payload: b"not json".to_vec(),
        })
        .await;

        let acks = hub.acks();
        assert_eq!(acks.len(), 1);
        assert!(!acks[0].success);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_request() {
        let hub = Hub::new();
        let a = subscribed_manager(&hub, 1).await;
        let _b = subscribed_manager(&hub, 2).await;

        let waiter = {
            let a = Arc::clone(&a);
            tokio::spawn(async move {
                a.send_with_response(
                    2,
                    CoreMessage::new(MessageType::Command, "slow"),
                    Duration::from_secs(30),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.stop().await;

        let result = waiter.await.expect("join");
        assert!(matches!(result, Err(CommError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_second_subscribe_rejected() {
        let hub = Hub::new();
        let a = subscribed_manager(&hub, 1).await;
        let err = a
            .subscribe(SubscribeFilter::default())
            .await
            .expect_err("second subscribe");
        assert!(matches!(err, CommError::AlreadySubscribed));
    }

    #[tokio::test]
    async fn test_broadcast_send_skips_ack_requirement() {
        let hub = Hub::new();
        let a = subscribed_manager(&hub, 1).await;
        let b = subscribed_manager(&hub, 2).await;

        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        b.register_handler(
            MessageType::NodeJoinBroadcast,
            handler(move |_ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        a.send(BROADCAST_ALL, CoreMessage::new(MessageType::NodeJoinBroadcast, "join"))
            .await
            .expect("broadcast");

        wait_for(|| seen.load(Ordering::SeqCst) == 1).await;
        // Broadcast envelopes are not ack-eligible.
        assert!(hub.acks().is_empty());
    }
}
