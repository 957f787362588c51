//! Transport envelope types.
//!
//! The envelope is what the mesh service actually carries: routing fields,
//! correlation ID, delivery knobs, and the opaque payload. Field semantics
//! are bit-exact where peers interoperate.

use serde::{Deserialize, Serialize};

use weft_types::NodeId;

/// Header key naming the core message type inside the payload.
pub const HDR_MESSAGE_TYPE: &str = "message_type";
/// Header key naming the payload's operation sub-discriminator.
pub const HDR_OPERATION: &str = "operation";
/// Header key carrying the sender's node ID as a decimal string.
pub const HDR_SOURCE_NODE: &str = "source_node";
/// Header present (value `true`) on mesh-wide broadcasts.
pub const HDR_BROADCAST: &str = "broadcast";

/// Delivery mode requested from the mesh service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Accept-and-forget: the sender does not wait for remote processing.
    #[default]
    FireAndForget,
}

/// A single envelope header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Outbound envelope handed to the mesh service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendRequest {
    /// Destination node; [`weft_types::BROADCAST_ALL`] fans out to all.
    pub dst_node: NodeId,
    /// Opaque payload bytes (a JSON-encoded core message).
    pub payload: Vec<u8>,
    /// Caller-chosen monotonic correlation ID, echoed on responses.
    pub corr_id: u64,
    /// Whether the receiving node must confirm processing.
    pub require_ack: bool,
    pub mode: DeliveryMode,
    /// Higher is more urgent.
    pub qos_class: u32,
    /// Transport-level ordering partition.
    pub partition: u32,
    pub headers: Vec<Header>,
}

/// Outcome of handing an envelope to the mesh service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    /// Accepted and queued for delivery.
    Queued,
    /// Delivered to the destination's subscription stream.
    Delivered,
    /// The service could not route the envelope.
    Failed,
}

/// Receipt returned by [`crate::Transport::send`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Service-assigned message ID, used for acknowledgment.
    pub msg_id: u64,
    pub status: SendStatus,
    pub require_ack: bool,
}

/// Inbound envelope delivered through a subscription stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub src_node: NodeId,
    pub msg_id: u64,
    pub corr_id: u64,
    pub require_ack: bool,
    pub payload: Vec<u8>,
}

/// Application-level confirmation of a received envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckRequest {
    /// Node the original envelope came from.
    pub src_node: NodeId,
    /// The received envelope's message ID.
    pub msg_id: u64,
    /// Whether the handler processed the message successfully.
    pub success: bool,
    /// Short human-readable status.
    pub message: String,
}

/// Filter for a subscription stream. An empty filter receives everything.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SubscribeFilter {
    /// Restrict to specific source nodes; empty means all sources.
    #[serde(default)]
    pub src_nodes: Vec<NodeId>,
}
