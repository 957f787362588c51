//! Handler registry types.
//!
//! Handlers are async closures keyed by message type. A handler's error
//! never propagates to the transport; it only shapes the acknowledgment
//! sent back to the peer. Handlers run on the dispatch task, so anything
//! they send must be fire-and-forget: blocking on a reply inside a handler
//! would stall the pipeline that delivers the reply.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use weft_types::message::CoreMessage;
use weft_types::NodeId;

/// Error type handlers may return; used only to shape the ack.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Future returned by a handler invocation.
pub type HandlerFuture = Pin<Box<dyn Future<Output = std::result::Result<(), HandlerError>> + Send>>;

/// A registered message handler.
pub type Handler = Arc<dyn Fn(InboundContext) -> HandlerFuture + Send + Sync>;

/// Everything a handler learns about one inbound envelope.
#[derive(Clone, Debug)]
pub struct InboundContext {
    pub src_node: NodeId,
    pub msg_id: u64,
    /// Correlation ID of the envelope; echo it on replies so the sender's
    /// callback channel can match.
    pub corr_id: u64,
    pub message: CoreMessage,
}

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(InboundContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Application-level acknowledgment delivered to a callback channel
/// registered with `send_with_callback`.
#[derive(Clone, Debug)]
pub struct ResponseAck {
    /// Message ID of the envelope that completed the exchange.
    pub msg_id: u64,
    /// Whether the local handler (or response delivery) succeeded.
    pub success: bool,
    /// Short human-readable status.
    pub message: String,
    /// The peer's message, when one arrived with the matching correlation.
    pub response: Option<CoreMessage>,
}
