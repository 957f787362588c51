//! Receive-side deduplication.
//!
//! The transport retries unacknowledged envelopes, so handlers must not
//! run twice for the same delivery. An envelope is identified by
//! `(src_node, msg_id, corr_id)`; entries expire after a fixed window,
//! beyond which redelivery falls back on handler idempotence (every core
//! write is an upsert).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use weft_types::NodeId;

/// How long a processed envelope stays recognizable as a duplicate.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// Entries older than this are removed by the sweeper.
pub const SWEEP_AGE: Duration = Duration::from_secs(120);

/// Identity of one delivered envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub src_node: NodeId,
    pub msg_id: u64,
    pub corr_id: u64,
}

/// Map of recently processed envelopes.
#[derive(Debug, Default)]
pub struct DedupMap {
    entries: HashMap<DedupKey, Instant>,
}

impl DedupMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an envelope, reporting whether it is a recent duplicate.
    ///
    /// A fresh or expired key is (re)stamped with `now` and reported as
    /// new; a key seen within [`DEDUP_WINDOW`] is a duplicate.
    pub fn check_and_record(&mut self, key: DedupKey, now: Instant) -> bool {
        match self.entries.get(&key) {
            Some(seen) if now.duration_since(*seen) < DEDUP_WINDOW => true,
            _ => {
                self.entries.insert(key, now);
                false
            }
        }
    }

    /// Drop entries older than [`SWEEP_AGE`]. Returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, seen| now.duration_since(*seen) < SWEEP_AGE);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
