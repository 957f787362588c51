//! Pure split-brain decision rules.

use weft_types::consensus::SplitStrategy;

/// Smallest strict majority of `total` nodes.
pub fn majority(total: u32) -> u32 {
    total / 2 + 1
}

/// Whether the local view constitutes a split.
///
/// A single-node mesh can never split.
pub fn detect_split(total: u32, online: u32) -> bool {
    total > 1 && online < majority(total)
}

/// Whether writes stay enabled while split.
///
/// `seed_in_partition` is true when the local node is the seed or can see
/// the seed among its live sessions; under the even-split policy the
/// seed's whole partition prevails.
pub fn can_accept_writes_in_split(
    strategy: SplitStrategy,
    total: u32,
    online: u32,
    seed_in_partition: bool,
) -> bool {
    if online >= majority(total) {
        return true;
    }
    match strategy {
        SplitStrategy::SeedNodePrevailsInEvenSplit => {
            total % 2 == 0 && online == total / 2 && seed_in_partition
        }
        SplitStrategy::RequireMajority => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_node_never_splits() {
        assert!(!detect_split(1, 1));
        assert!(!detect_split(0, 1));
    }

    #[test]
    fn test_two_node_mesh_one_online() {
        assert!(detect_split(2, 1));
        // Seed side prevails in the 1/1 split, non-seed side does not.
        assert!(can_accept_writes_in_split(
            SplitStrategy::SeedNodePrevailsInEvenSplit,
            2,
            1,
            true
        ));
        assert!(!can_accept_writes_in_split(
            SplitStrategy::SeedNodePrevailsInEvenSplit,
            2,
            1,
            false
        ));
        assert!(!can_accept_writes_in_split(
            SplitStrategy::RequireMajority,
            2,
            1,
            true
        ));
    }

    #[test]
    fn test_four_node_mesh_even_split() {
        assert!(detect_split(4, 2));
        // REQUIRE_MAJORITY: both halves reject.
        assert!(!can_accept_writes_in_split(
            SplitStrategy::RequireMajority,
            4,
            2,
            true
        ));
        assert!(!can_accept_writes_in_split(
            SplitStrategy::RequireMajority,
            4,
            2,
            false
        ));
        // Seed policy: only the seed's half accepts.
        assert!(can_accept_writes_in_split(
            SplitStrategy::SeedNodePrevailsInEvenSplit,
            4,
            2,
            true
        ));
        assert!(!can_accept_writes_in_split(
            SplitStrategy::SeedNodePrevailsInEvenSplit,
            4,
            2,
            false
        ));
    }

    #[test]
    fn test_strict_majority_always_accepts() {
        for strategy in [
            SplitStrategy::RequireMajority,
            SplitStrategy::SeedNodePrevailsInEvenSplit,
        ] {
            assert!(can_accept_writes_in_split(strategy, 4, 3, false));
            assert!(can_accept_writes_in_split(strategy, 5, 3, false));
        }
    }

    #[test]
    fn test_odd_total_has_no_even_split_escape() {
        assert!(detect_split(5, 2));
        assert!(!can_accept_writes_in_split(
            SplitStrategy::SeedNodePrevailsInEvenSplit,
            5,
            2,
            true
        ));
    }

    #[test]
    fn test_majority_math() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(5), 3);
    }
}
