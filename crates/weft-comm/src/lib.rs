//! # weft-comm
//!
//! The communication manager: correlated request/response and
//! fire-and-forget messaging over the transport adapter, with receive-side
//! deduplication, type-keyed handler dispatch, and application-level
//! acknowledgment callbacks.
//!
//! ## Architecture
//!
//! ```text
//! engines (events / sync / consensus)
//!     |
//!     v
//! CommManager            -- send primitives, handler registry, dedup
//!     |  reader task     -- blocking receives off one subscription stream
//!     |  dispatch task   -- per-envelope processing pipeline
//!     |  sweeper task    -- expires dedup entries
//!     v
//! Transport (weft-transport)
//! ```

pub mod dedup;
pub mod handler;
pub mod manager;

pub use handler::{Handler, InboundContext, ResponseAck};
pub use manager::CommManager;

/// Error types for communication manager operations.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// The transport rejected or failed the operation.
    #[error(transparent)]
    Transport(#[from] weft_transport::TransportError),

    /// A request/response wait elapsed.
    #[error("timed out after {0:?} waiting for response")]
    ResponseTimeout(std::time::Duration),

    /// The manager is stopping; the wait was abandoned.
    #[error("communication manager is shutting down")]
    ShuttingDown,

    /// The manager already holds its single subscription stream.
    #[error("already subscribed")]
    AlreadySubscribed,

    /// Payload encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for communication manager operations.
pub type Result<T> = std::result::Result<T, CommError>;
