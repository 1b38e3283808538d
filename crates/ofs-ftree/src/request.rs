//! Request and result types of the extension engine, plus the sub-request
//! descriptors it hands to the block-I/O service and the allocation tracker.

use ofs_ondisk::InnerNode;
use ofs_types::{max_virtual_address, BlockAddress, Generation, TreeDegree, VirtualAddress, BLOCK_SIZE};
use serde::{Deserialize, Serialize};

/// Shape of one tree: fan-out, deepest level, leaves currently tracked.
///
/// Together with the root record this is the atomic unit a higher layer
/// swaps in when it commits a new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeShape {
    pub degree: TreeDegree,
    pub max_level: u32,
    pub leaf_count: u64,
}

impl TreeShape {
    /// Largest virtual address this shape can hold (`degree^max_level − 1`).
    #[must_use]
    pub fn max_virtual_address(&self) -> Option<VirtualAddress> {
        max_virtual_address(self.degree, self.max_level)
    }
}

/// Identity and shape of the allocation tracker's own tree, carried by value
/// in allocator sub-requests. The host owns the canonical copy and applies
/// any updates the tracker makes while servicing the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaTreeRef {
    pub root: InnerNode,
    pub shape: TreeShape,
}

/// Immutable inputs of one tree-extension step.
///
/// `first_block`/`block_count` describe the contingent: a run of physical
/// addresses the host has already reserved for this step to consume. The
/// step may legitimately finish having used only part of it; the host then
/// issues a follow-up request with the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendRequest {
    pub curr_gen: Generation,
    pub root: InnerNode,
    pub shape: TreeShape,
    pub meta: MetaTreeRef,
    pub first_block: BlockAddress,
    pub block_count: u64,
}

/// Result of a completed tree-extension step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendOutcome {
    /// New authenticated tree identity.
    pub root: InnerNode,
    pub max_level: u32,
    /// New total leaf count (previous count plus `leaves_added`).
    pub leaf_count: u64,
    pub leaves_added: u64,
    pub success: bool,
}

/// Direction of a block-I/O sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockIoOp {
    Read,
    Write,
}

/// One sub-request the engine needs serviced before the owning slot can make
/// further progress. A slot has at most one of these outstanding at a time.
#[derive(Debug, Clone)]
pub enum SubRequest {
    /// Read or write one node block. `payload` carries the encoded block for
    /// writes and is `None` for reads (read data comes back through
    /// delivery).
    BlockIo {
        op: BlockIoOp,
        addr: BlockAddress,
        slot: usize,
        payload: Option<Box<[u8; BLOCK_SIZE]>>,
    },
    /// Ask the allocation tracker to reallocate a replacement address for
    /// `old_addr` under the current generation.
    Alloc {
        meta: MetaTreeRef,
        curr_gen: Generation,
        old_addr: BlockAddress,
        slot: usize,
    },
}

impl SubRequest {
    /// Index of the slot this sub-request belongs to.
    #[must_use]
    pub fn slot(&self) -> usize {
        match self {
            Self::BlockIo { slot, .. } | Self::Alloc { slot, .. } => *slot,
        }
    }
}
