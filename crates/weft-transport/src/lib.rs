//! # weft-transport
//!
//! The transport adapter contract consumed by the coordination core, plus an
//! in-process hub implementation used by tests and single-process meshes.
//!
//! The mesh service itself is an external collaborator: it moves opaque
//! payload bytes between node IDs, maintains peer sessions, and confirms
//! delivery. The core only depends on the [`Transport`] trait defined here.
//!
//! ## Architecture
//!
//! ```text
//! Communication Manager
//!     |
//!     v
//! Transport (trait)          -- send / subscribe / ack / broadcast / sync
//!     |
//!     v
//! mesh service (external)    -- sessions, routing, delivery, heartbeats
//! ```

pub mod envelope;
pub mod hub;
pub mod session;
pub mod sync;

use std::future::Future;

use tokio::sync::mpsc;

use crate::envelope::{AckRequest, ReceivedMessage, SendReceipt, SendRequest, SubscribeFilter};
use crate::session::{MessageMetrics, SessionList, TopologyReport};
use crate::sync::{DatabaseSyncRequest, DatabaseSyncResponse};
use weft_types::event::MeshStateEvent;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The mesh service cannot be reached, or the peer has no session.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// A bounded wait elapsed before the operation completed.
    #[error("transport timeout: {0}")]
    Timeout(String),

    /// The subscription stream or the transport itself has been closed.
    #[error("transport closed")]
    Closed,

    /// Payload encode/decode failure at the transport boundary.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not occur in normal operation).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// One streaming subscription delivering inbound envelopes.
///
/// Closing the subscription stops delivery; messages already buffered are
/// still drained by `recv`.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<ReceivedMessage>,
}

impl Subscription {
    /// Wrap a receiving channel as a subscription stream.
    pub fn new(rx: mpsc::Receiver<ReceivedMessage>) -> Self {
        Self { rx }
    }

    /// Blocking receive of the next inbound envelope.
    ///
    /// Returns `None` once the stream is closed and drained.
    pub async fn recv(&mut self) -> Option<ReceivedMessage> {
        self.rx.recv().await
    }

    /// Close the stream. Buffered messages remain receivable.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Operations the coordination core consumes from the mesh service.
///
/// Implementations must be cheap to clone through `Arc` and safe to call
/// from any task.
pub trait Transport: Send + Sync + 'static {
    /// Hand an envelope to the mesh service for delivery.
    ///
    /// Returns once the service has accepted the send; delivery and remote
    /// processing happen asynchronously.
    fn send(&self, req: SendRequest) -> impl Future<Output = Result<SendReceipt>> + Send;

    /// Open a streaming subscription for inbound envelopes.
    fn subscribe(&self, filter: SubscribeFilter)
        -> impl Future<Output = Result<Subscription>> + Send;

    /// Confirm (or refuse) processing of a received envelope.
    fn ack_message(&self, ack: AckRequest) -> impl Future<Output = Result<()>> + Send;

    /// Broadcast a mesh state event to every node in the mesh.
    fn broadcast_state_event(
        &self,
        event: MeshStateEvent,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Request versioned table records from peers.
    fn request_database_sync(
        &self,
        req: DatabaseSyncRequest,
    ) -> impl Future<Output = Result<DatabaseSyncResponse>> + Send;

    /// Enumerate live peer sessions.
    fn sessions(&self) -> impl Future<Output = Result<SessionList>> + Send;

    /// Current mesh topology as known to the transport.
    fn topology(&self) -> impl Future<Output = Result<TopologyReport>> + Send;

    /// Message counters for observability.
    fn message_metrics(&self) -> impl Future<Output = Result<MessageMetrics>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::Unavailable("no session to node 9".to_string());
        assert_eq!(err.to_string(), "transport unavailable: no session to node 9");
        assert_eq!(TransportError::Closed.to_string(), "transport closed");
    }

    #[tokio::test]
    async fn test_subscription_drains_after_close() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new(rx);
        tx.send(ReceivedMessage {
            src_node: 1,
            msg_id: 10,
            corr_id: 0,
            require_ack: false,
            payload: vec![1],
        })
        .await
        .expect("send");
        sub.close();
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }
}
