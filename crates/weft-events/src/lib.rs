//! # weft-events
//!
//! The event manager: orders, persists, and broadcasts mesh state events.
//!
//! Every event is persisted to the durable log before it is queued
//! anywhere, on both the publish and the receive path. Three long-lived
//! tasks drain the work:
//!
//! - **publisher** broadcasts locally published events to the mesh,
//! - **processor** dispatches received events to their handlers,
//! - **periodic** re-processes anything left unprocessed, prunes old log
//!   rows, and drives the consensus checker's periodic check.

pub mod hooks;
pub mod manager;

pub use hooks::{ConsensusHook, SyncHook};
pub use manager::EventManager;

/// Error types for event manager operations.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The bounded publish queue is full; the event was not enqueued.
    #[error("publish queue is full")]
    PublishQueueFull,

    /// Durable log failure.
    #[error(transparent)]
    Store(#[from] weft_store::DbError),

    /// A wire event record could not be decoded.
    #[error(transparent)]
    Decode(#[from] weft_types::event::EventDecodeError),
}

/// Result type alias for event manager operations.
pub type Result<T> = std::result::Result<T, EventError>;
