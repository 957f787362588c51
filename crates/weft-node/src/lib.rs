//! # weft-node
//!
//! Composition root for one mesh node: opens the store, constructs the
//! four engines, wires their back-pointers, registers message handlers,
//! and drives the lifecycle (`start`, `join_mesh`, `stop`).
//!
//! Engines are created with their direct collaborators and late-bound to
//! each other afterwards, in dependency order:
//!
//! ```text
//! CommManager ──▶ Transport
//! EventManager ──▶ CommManager            (mesh_event handler installed back)
//! ConsensusChecker ◀──▶ EventManager      (hook + back-pointer)
//! SyncManager ◀── EventManager            (catch-up hook)
//! SyncManager ──▶ CommManager             (join handshake handlers)
//! ```

pub mod config;
pub mod node;

pub use config::NodeConfig;
pub use node::{Node, NodeStatus};

/// Error types for node lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Store(#[from] weft_store::DbError),

    #[error(transparent)]
    Comm(#[from] weft_comm::CommError),

    #[error(transparent)]
    Events(#[from] weft_events::EventError),

    #[error(transparent)]
    Consensus(#[from] weft_consensus::ConsensusError),

    #[error(transparent)]
    Sync(#[from] weft_sync::SyncError),

    /// A bootstrap step failed or returned a refusal.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
