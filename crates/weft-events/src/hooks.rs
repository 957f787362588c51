//! Late-bound collaborator hooks.
//!
//! The event manager sits between the consensus checker and the sync
//! manager, and each of those calls back into it. The cycles are broken by
//! letting the event manager call its collaborators through these object
//! traits, installed by setters after construction.
//!
//! Hook implementations log their own failures; nothing propagates back
//! into event processing.

use std::future::Future;
use std::pin::Pin;

use weft_types::NodeId;

/// Future returned by hook invocations.
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// The consensus checker, as seen from the event manager.
pub trait ConsensusHook: Send + Sync {
    /// Debounced periodic split check, run from the periodic task.
    fn periodic_check(&self) -> HookFuture<'_>;

    /// Immediate re-check, run when an event suggests the topology
    /// degraded (`NODE_OFFLINE`, `SPLIT_DETECTED`).
    fn recheck(&self) -> HookFuture<'_>;
}

/// The sync manager, as seen from the event manager.
pub trait SyncHook: Send + Sync {
    /// Catch-up replication after a peer recovered or a split resolved.
    fn catch_up(&self, trigger_node: NodeId) -> HookFuture<'_>;
}
