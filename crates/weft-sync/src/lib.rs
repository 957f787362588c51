//! # weft-sync
//!
//! The sync manager: bootstrap and catch-up replication across peers.
//!
//! Three replication paths:
//!
//! - **Mesh snapshot**: the system tables (mesh, nodes, routes) exported
//!   by a seed and applied by a joining node, with route stitching.
//! - **User-data replace**: a full snapshot of the user-level tables,
//!   applied in one transaction with foreign-key-ordered deletes and
//!   inserts.
//! - **Table delta sync**: versioned catch-up of the mesh system tables
//!   after a peer recovers or a split resolves.
//!
//! The join handshake (`mesh_sync_request`, `node_join_notify`,
//! `node_join_broadcast`, `user_data_sync_request`) is implemented as
//! communication-manager handlers registered by [`SyncManager::register_handlers`].

pub mod delta;
pub mod manager;
pub mod snapshot;
pub mod userdata;

pub use manager::SyncManager;

/// Error types for sync operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] weft_store::DbError),

    #[error(transparent)]
    Comm(#[from] weft_comm::CommError),

    #[error(transparent)]
    Transport(#[from] weft_transport::TransportError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A peer message is missing or mistypes a required field.
    #[error("malformed sync message: {0}")]
    BadMessage(String),

    /// The communication manager back-pointer has not been installed yet.
    #[error("sync manager is not wired to a communication manager")]
    NotWired,
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
