//! Consensus state and split-brain policy types.

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Policy for accepting writes while the mesh is split.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitStrategy {
    /// In an exact even split, the partition holding the seed node keeps
    /// accepting writes; any strict majority always does.
    SeedNodePrevailsInEvenSplit,
    /// Only a strict majority partition accepts writes.
    #[default]
    RequireMajority,
}

impl SplitStrategy {
    /// The persisted / wire name of this strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitStrategy::SeedNodePrevailsInEvenSplit => "SEED_NODE_PREVAILS_IN_EVEN_SPLIT",
            SplitStrategy::RequireMajority => "REQUIRE_MAJORITY",
        }
    }
}

impl std::fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a stored strategy name is not recognized. Callers fall back
/// to [`SplitStrategy::RequireMajority`] after logging.
#[derive(Debug, thiserror::Error)]
#[error("unknown split strategy: {0}")]
pub struct UnknownSplitStrategy(pub String);

impl std::str::FromStr for SplitStrategy {
    type Err = UnknownSplitStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SEED_NODE_PREVAILS_IN_EVEN_SPLIT" => Ok(SplitStrategy::SeedNodePrevailsInEvenSplit),
            "REQUIRE_MAJORITY" => Ok(SplitStrategy::RequireMajority),
            other => Err(UnknownSplitStrategy(other.to_string())),
        }
    }
}

/// Snapshot of the local node's view of mesh consensus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusState {
    /// Count of ACTIVE members, from the membership table.
    pub total_nodes: u32,
    /// Live peer sessions plus one for the local node.
    pub online_nodes: u32,
    pub split_detected: bool,
    /// Whether the local partition holds a strict majority.
    pub is_majority_partition: bool,
    pub split_strategy: SplitStrategy,
    /// The seed node, used as the even-split tiebreaker. Zero when unknown.
    pub seed_node_id: NodeId,
    /// The write gate: false while this side of a split must reject writes.
    pub can_accept_writes: bool,
}

impl Default for ConsensusState {
    fn default() -> Self {
        Self {
            total_nodes: 1,
            online_nodes: 1,
            split_detected: false,
            is_majority_partition: true,
            split_strategy: SplitStrategy::default(),
            seed_node_id: 0,
            can_accept_writes: true,
        }
    }
}
