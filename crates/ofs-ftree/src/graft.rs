//! Branch grafting: populating fresh tree nodes from a contingent of
//! reserved block addresses.
//!
//! These helpers are pure with respect to I/O: they fill in the in-memory
//! node blocks and per-level address arrays of one slot, and the state
//! machine writes the result back afterwards. Capacity growth is resumable
//! by construction — a graft stops the moment the contingent runs dry and
//! reports the level it stopped at, and a follow-up request picks up from
//! the leaf count recorded by the completed step.

use ofs_error::OfsError;
use ofs_ondisk::{InnerNode, InnerNodeBlock, LeafNode, LeafNodeBlock, NodeHash};
use ofs_types::{
    BlockAddress, Generation, TreeDegree, INITIAL_GENERATION, INVALID_KEY_ID,
    INVALID_VIRTUAL_ADDRESS, LEVEL_SLOTS, TREE_MAX_LEVEL,
};
use tracing::trace;

/// A run of physical addresses reserved for one extension step, consumed
/// front to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockContingent {
    next: BlockAddress,
    remaining: u64,
}

impl BlockContingent {
    #[must_use]
    pub fn new(first: BlockAddress, count: u64) -> Self {
        Self {
            next: first,
            remaining: count,
        }
    }

    /// Number of addresses not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Consume the next address, or `None` once the contingent is dry.
    pub fn take(&mut self) -> Option<BlockAddress> {
        if self.remaining == 0 {
            return None;
        }
        let taken = self.next;
        self.next = self.next.checked_add(1)?;
        self.remaining -= 1;
        Some(taken)
    }
}

/// What a graft accomplished: how many leaf records it populated and the
/// level at which the contingent ran dry (the level write-back starts from).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraftReport {
    pub leaves_added: u64,
    pub stopped_level: u32,
}

/// Graft a fresh branch below the attachment point.
///
/// Starting one level below `attach_level` and proceeding downward, consume
/// one address per inner level for a fresh inner node (stamped `gen`, hash
/// left empty until write-back); at level 1, consume one address per leaf
/// record — starting at `attach_child` only at the attachment level itself,
/// otherwise from record 0 — until the contingent is dry or the leaf block
/// is full. Levels strictly between the attachment point and the bottom are
/// reset to all-unallocated first. Records below `attach_child` at the
/// attachment level are never touched.
#[allow(clippy::too_many_arguments)]
pub fn graft_branch(
    attach_level: u32,
    attach_child: u32,
    degree: TreeDegree,
    gen: Generation,
    contingent: &mut BlockContingent,
    inner: &mut [InnerNodeBlock; LEVEL_SLOTS],
    leaves: &mut LeafNodeBlock,
    new_addrs: &mut [BlockAddress; LEVEL_SLOTS],
) -> GraftReport {
    let mut leaves_added = 0_u64;
    let mut stopped_level = attach_level;

    // Everything below the attachment point belongs to the new branch.
    for level in 1..attach_level {
        if level > 1 {
            inner[level as usize].reset();
        } else {
            leaves.reset();
        }
        trace!(level, "reset level for graft");
    }

    if contingent.remaining() > 0 {
        for level in (1..=attach_level).rev() {
            stopped_level = level;

            if level > 1 {
                let Some(addr) = contingent.take() else {
                    break;
                };
                let child_idx = if level == attach_level { attach_child } else { 0 };
                let child_level = level - 1;

                new_addrs[child_level as usize] = addr;
                inner[level as usize].nodes[child_idx as usize] = InnerNode {
                    addr,
                    gen,
                    hash: NodeHash::ZERO,
                };
                trace!(
                    level,
                    child = child_idx,
                    %addr,
                    "grafted inner node"
                );
            } else {
                let first_child = if level == attach_level { attach_child } else { 0 };

                for child_idx in first_child..degree.get() {
                    let Some(addr) = contingent.take() else {
                        break;
                    };
                    leaves.nodes[child_idx as usize] = LeafNode {
                        addr,
                        last_vba: INVALID_VIRTUAL_ADDRESS,
                        alloc_gen: INITIAL_GENERATION,
                        free_gen: INITIAL_GENERATION,
                        last_key: INVALID_KEY_ID,
                        reserved: false,
                    };
                    trace!(child = child_idx, %addr, "grafted leaf record");
                    leaves_added += 1;
                }
            }
        }
    }

    GraftReport {
        leaves_added,
        stopped_level,
    }
}

/// Raise the tree by one level when it already addresses its maximum leaf
/// index for the current shape.
///
/// Demotes the old root record — address, generation, and hash unchanged —
/// to child 0 of a new top-level node block, consumes one contingent address
/// for that new block, and rewrites the root identity to point at it (hash
/// empty until write-back). Doubles addressable capacity per degree stride.
pub fn raise_root(
    root: &mut InnerNode,
    max_level: &mut u32,
    gen: Generation,
    contingent: &mut BlockContingent,
    inner: &mut [InnerNodeBlock; LEVEL_SLOTS],
    new_addrs: &mut [BlockAddress; LEVEL_SLOTS],
) -> Result<(), OfsError> {
    if *max_level >= TREE_MAX_LEVEL {
        return Err(OfsError::InvalidCall("raise root past the maximum tree level"));
    }
    let Some(addr) = contingent.take() else {
        return Err(OfsError::InvalidCall("raise root with an empty contingent"));
    };

    *max_level += 1;
    let top = *max_level as usize;

    inner[top].reset();
    inner[top].nodes[0] = *root;
    new_addrs[top] = addr;

    *root = InnerNode {
        addr,
        gen,
        hash: NodeHash::ZERO,
    };
    trace!(max_level = *max_level, %addr, "raised tree root");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn degree(value: u32) -> TreeDegree {
        TreeDegree::new(value).expect("valid degree")
    }

    fn fresh_walk() -> ([InnerNodeBlock; LEVEL_SLOTS], LeafNodeBlock, [BlockAddress; LEVEL_SLOTS]) {
        (
            std::array::from_fn(|_| InnerNodeBlock::default()),
            LeafNodeBlock::default(),
            [BlockAddress(0); LEVEL_SLOTS],
        )
    }

    #[test]
    fn contingent_consumes_sequentially() {
        let mut contingent = BlockContingent::new(BlockAddress(10), 2);
        assert_eq!(contingent.remaining(), 2);
        assert_eq!(contingent.take(), Some(BlockAddress(10)));
        assert_eq!(contingent.take(), Some(BlockAddress(11)));
        assert_eq!(contingent.take(), None);
        assert_eq!(contingent.remaining(), 0);
    }

    #[test]
    fn graft_at_leaf_level_fills_from_attach_child() {
        let (mut inner, mut leaves, mut new_addrs) = fresh_walk();
        // Pre-existing records below the attachment child must survive.
        leaves.nodes[0].addr = BlockAddress(77);
        leaves.nodes[1].addr = BlockAddress(78);

        let mut contingent = BlockContingent::new(BlockAddress(100), 10);
        let report = graft_branch(
            1,
            2,
            degree(4),
            Generation(5),
            &mut contingent,
            &mut inner,
            &mut leaves,
            &mut new_addrs,
        );

        // Two free records at and above the attach child; contingent larger.
        assert_eq!(report.leaves_added, 2);
        assert_eq!(report.stopped_level, 1);
        assert_eq!(contingent.remaining(), 8);

        assert_eq!(leaves.nodes[0].addr, BlockAddress(77));
        assert_eq!(leaves.nodes[1].addr, BlockAddress(78));
        assert_eq!(leaves.nodes[2].addr, BlockAddress(100));
        assert_eq!(leaves.nodes[3].addr, BlockAddress(101));
        assert_eq!(leaves.nodes[2].last_vba, INVALID_VIRTUAL_ADDRESS);
        assert!(!leaves.nodes[2].reserved);
    }

    #[test]
    fn graft_from_inner_level_builds_downward_and_resets_below() {
        let (mut inner, mut leaves, mut new_addrs) = fresh_walk();
        // Stale state from a previous walk on the intermediate levels.
        inner[2].nodes[9] = InnerNode {
            addr: BlockAddress(999),
            gen: Generation(1),
            hash: NodeHash::ZERO,
        };
        leaves.nodes[63].addr = BlockAddress(999);

        let mut contingent = BlockContingent::new(BlockAddress(200), 5);
        let report = graft_branch(
            3,
            7,
            degree(64),
            Generation(9),
            &mut contingent,
            &mut inner,
            &mut leaves,
            &mut new_addrs,
        );

        // One address per inner level (2 of them), three leaves.
        assert_eq!(report.leaves_added, 3);
        assert_eq!(report.stopped_level, 1);
        assert_eq!(contingent.remaining(), 0);

        // Attachment level: the grafted child sits at the supplied index.
        let attach = inner[3].nodes[7];
        assert_eq!(attach.addr, BlockAddress(200));
        assert_eq!(attach.gen, Generation(9));
        assert!(attach.hash.is_zero());
        assert_eq!(new_addrs[2], BlockAddress(200));

        // Intermediate level was reset, then grafted at record 0.
        assert!(!inner[2].nodes[9].is_allocated());
        assert_eq!(inner[2].nodes[0].addr, BlockAddress(201));
        assert_eq!(new_addrs[1], BlockAddress(201));

        // Leaf block was reset, then filled from record 0.
        assert_eq!(leaves.nodes[0].addr, BlockAddress(202));
        assert_eq!(leaves.nodes[2].addr, BlockAddress(204));
        assert!(!leaves.nodes[3].is_allocated());
        assert!(!leaves.nodes[63].is_allocated());
    }

    #[test]
    fn graft_stops_at_the_level_where_the_contingent_ran_dry() {
        let (mut inner, mut leaves, mut new_addrs) = fresh_walk();
        let mut contingent = BlockContingent::new(BlockAddress(300), 1);
        let report = graft_branch(
            3,
            0,
            degree(4),
            Generation(2),
            &mut contingent,
            &mut inner,
            &mut leaves,
            &mut new_addrs,
        );

        // The single address built level 3's child; level 2 found the
        // contingent dry and the graft stopped there with no leaves.
        assert_eq!(report.leaves_added, 0);
        assert_eq!(report.stopped_level, 2);
        assert_eq!(inner[3].nodes[0].addr, BlockAddress(300));
        assert!(!inner[2].nodes[0].is_allocated());
    }

    #[test]
    fn graft_with_empty_contingent_reports_attachment_level() {
        let (mut inner, mut leaves, mut new_addrs) = fresh_walk();
        let mut contingent = BlockContingent::new(BlockAddress(0), 0);
        let report = graft_branch(
            2,
            3,
            degree(4),
            Generation(1),
            &mut contingent,
            &mut inner,
            &mut leaves,
            &mut new_addrs,
        );
        assert_eq!(report.leaves_added, 0);
        assert_eq!(report.stopped_level, 2);
        assert!(!inner[2].nodes[3].is_allocated());
    }

    #[test]
    fn raise_root_demotes_old_root_to_child_zero() {
        let (mut inner, _, mut new_addrs) = fresh_walk();
        let old_root = InnerNode {
            addr: BlockAddress(42),
            gen: Generation(3),
            hash: ofs_ondisk::hash_block(&[7_u8; ofs_types::BLOCK_SIZE]),
        };
        let mut root = old_root;
        let mut max_level = 1;
        let mut contingent = BlockContingent::new(BlockAddress(500), 3);

        raise_root(
            &mut root,
            &mut max_level,
            Generation(8),
            &mut contingent,
            &mut inner,
            &mut new_addrs,
        )
        .expect("raise");

        assert_eq!(max_level, 2);
        assert_eq!(inner[2].nodes[0], old_root);
        assert_eq!(root.addr, BlockAddress(500));
        assert_eq!(root.gen, Generation(8));
        assert!(root.hash.is_zero());
        assert_eq!(new_addrs[2], BlockAddress(500));
        assert_eq!(contingent.remaining(), 2);
    }

    #[test]
    fn raise_root_rejects_maximum_level_and_empty_contingent() {
        let (mut inner, _, mut new_addrs) = fresh_walk();
        let mut root = InnerNode::ZERO;
        let mut max_level = TREE_MAX_LEVEL;
        let mut contingent = BlockContingent::new(BlockAddress(1), 5);
        assert!(matches!(
            raise_root(
                &mut root,
                &mut max_level,
                Generation(1),
                &mut contingent,
                &mut inner,
                &mut new_addrs,
            ),
            Err(OfsError::InvalidCall(_))
        ));
        // Nothing consumed, nothing changed.
        assert_eq!(contingent.remaining(), 5);
        assert_eq!(max_level, TREE_MAX_LEVEL);

        let mut max_level = 1;
        let mut empty = BlockContingent::new(BlockAddress(1), 0);
        assert!(matches!(
            raise_root(
                &mut root,
                &mut max_level,
                Generation(1),
                &mut empty,
                &mut inner,
                &mut new_addrs,
            ),
            Err(OfsError::InvalidCall(_))
        ));
        assert_eq!(max_level, 1);
    }

    proptest! {
        #[test]
        fn graft_consumes_exactly_min_of_contingent_and_capacity(
            degree_log2 in 1_u32..=6,
            attach_level in 1_u32..=4,
            count in 0_u64..200,
        ) {
            let d = degree(1 << degree_log2);
            let attach_child = 0;
            let (mut inner, mut leaves, mut new_addrs) = fresh_walk();
            let mut contingent = BlockContingent::new(BlockAddress(1000), count);

            let report = graft_branch(
                attach_level,
                attach_child,
                d,
                Generation(1),
                &mut contingent,
                &mut inner,
                &mut leaves,
                &mut new_addrs,
            );

            // Capacity below an empty attachment point at child 0: one
            // address per inner level plus one full leaf block.
            let capacity = u64::from(attach_level - 1) + u64::from(d.get());
            let consumed = count - contingent.remaining();
            prop_assert_eq!(consumed, capacity.min(count));
            prop_assert_eq!(
                report.leaves_added,
                count
                    .saturating_sub(u64::from(attach_level - 1))
                    .min(u64::from(d.get()))
            );
            // Leaf count equals the number of populated leaf records.
            let populated = leaves
                .nodes
                .iter()
                .filter(|node| node.is_allocated())
                .count() as u64;
            prop_assert_eq!(report.leaves_added, populated);
        }

        #[test]
        fn grafted_nodes_carry_the_request_generation(
            gen in 1_u64..u64::MAX,
            count in 1_u64..100,
        ) {
            let d = degree(8);
            let (mut inner, mut leaves, mut new_addrs) = fresh_walk();
            let mut contingent = BlockContingent::new(BlockAddress(1), count);
            graft_branch(
                3,
                0,
                d,
                Generation(gen),
                &mut contingent,
                &mut inner,
                &mut leaves,
                &mut new_addrs,
            );
            for level in 2..=3_usize {
                for node in &inner[level].nodes {
                    if node.is_allocated() {
                        prop_assert_eq!(node.gen, Generation(gen));
                    }
                }
            }
            // Fresh leaves carry the initial generation pair until first use.
            for node in &leaves.nodes {
                if node.is_allocated() {
                    prop_assert_eq!(node.alloc_gen, INITIAL_GENERATION);
                    prop_assert_eq!(node.last_vba, INVALID_VIRTUAL_ADDRESS);
                }
            }
        }
    }

    #[test]
    fn graft_addresses_are_disjoint_and_in_order() {
        let (mut inner, mut leaves, mut new_addrs) = fresh_walk();
        let mut contingent = BlockContingent::new(BlockAddress(50), 6);
        graft_branch(
            2,
            1,
            degree(4),
            Generation(1),
            &mut contingent,
            &mut inner,
            &mut leaves,
            &mut new_addrs,
        );
        // Level 2 child first, then leaves in record order.
        assert_eq!(inner[2].nodes[1].addr, BlockAddress(50));
        let leaf_addrs: Vec<_> = leaves
            .nodes
            .iter()
            .filter(|node| node.is_allocated())
            .map(|node| node.addr)
            .collect();
        assert_eq!(
            leaf_addrs,
            vec![
                BlockAddress(51),
                BlockAddress(52),
                BlockAddress(53),
                BlockAddress(54)
            ]
        );
    }
}
