//! # weft-consensus
//!
//! Split-brain detection and the local write gate.
//!
//! The checker counts ACTIVE members from the membership table and live
//! peer sessions from the transport. When the local node cannot observe a
//! strict majority, the mesh is split and the configured
//! [`weft_types::consensus::SplitStrategy`] decides whether this side may
//! keep accepting writes.
//!
//! This is best-effort, eventually consistent gating, not linearizable
//! consensus: both sides of a partition converge once events flow again.

pub mod checker;
pub mod rules;

pub use checker::ConsensusChecker;

/// Error types for consensus operations.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error(transparent)]
    Store(#[from] weft_store::DbError),

    #[error(transparent)]
    Transport(#[from] weft_transport::TransportError),
}

/// Result type alias for consensus operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;
