#![forbid(unsafe_code)]
//! On-disk node records and node blocks.
//!
//! The free-space tree stores two record kinds, both 64 bytes on disk and
//! packed 64 to a 4096-byte block:
//!
//! | Record | Layout |
//! |--------|--------|
//! | inner  | addr:8 LE, gen:8 LE, hash:32, zero padding:16 |
//! | leaf   | addr:8, last_vba:8, alloc_gen:8, free_gen:8, last_key:4, reserved:1, zero padding:27 |
//!
//! Encoding always produces exactly [`BLOCK_SIZE`] bytes with zero-filled
//! reserved regions; parsing accepts exactly [`BLOCK_SIZE`] bytes and
//! nothing else. A record that is bit-identical to its all-zero default is
//! *unallocated* — that sentinel, not a separate flag, is how the extension
//! engine recognizes an empty child slot to graft into.

use ofs_types::{
    read_fixed, read_le_u32, read_le_u64, BlockAddress, Generation, KeyId, ParseError,
    VirtualAddress, BLOCK_SIZE, HASH_SIZE, NODES_PER_BLOCK, NODE_SIZE,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Content hash of one node block, stored verbatim in the parent record.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct NodeHash(pub [u8; HASH_SIZE]);

impl NodeHash {
    pub const ZERO: Self = Self([0; HASH_SIZE]);

    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..")
    }
}

/// Hash the exact bytes of one node block.
///
/// This is the only hashing entry point: the hash a parent stores for a
/// child is always the hash of the full 4096 bytes written for it.
#[must_use]
pub fn hash_block(block: &[u8; BLOCK_SIZE]) -> NodeHash {
    NodeHash(*blake3::hash(block).as_bytes())
}

// ── Inner node ──────────────────────────────────────────────────────────────

/// One inner-tree record: where a child node block lives, the generation it
/// was written under, and the hash of its content.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct InnerNode {
    pub addr: BlockAddress,
    pub gen: Generation,
    pub hash: NodeHash,
}

const INNER_ADDR_OFFSET: usize = 0;
const INNER_GEN_OFFSET: usize = 8;
const INNER_HASH_OFFSET: usize = 16;
const INNER_PAD_OFFSET: usize = 48;

impl InnerNode {
    pub const ZERO: Self = Self {
        addr: BlockAddress(0),
        gen: Generation(0),
        hash: NodeHash::ZERO,
    };

    /// A record distinct from the all-zero default points at a real child.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        *self != Self::ZERO
    }

    fn parse(record: &[u8]) -> Result<Self, ParseError> {
        debug_assert_eq!(record.len(), NODE_SIZE);
        Ok(Self {
            addr: BlockAddress(read_le_u64(record, INNER_ADDR_OFFSET)?),
            gen: Generation(read_le_u64(record, INNER_GEN_OFFSET)?),
            hash: NodeHash(read_fixed::<HASH_SIZE>(record, INNER_HASH_OFFSET)?),
        })
    }

    fn encode_into(&self, record: &mut [u8]) {
        debug_assert_eq!(record.len(), NODE_SIZE);
        record[INNER_ADDR_OFFSET..INNER_GEN_OFFSET].copy_from_slice(&self.addr.0.to_le_bytes());
        record[INNER_GEN_OFFSET..INNER_HASH_OFFSET].copy_from_slice(&self.gen.0.to_le_bytes());
        record[INNER_HASH_OFFSET..INNER_PAD_OFFSET].copy_from_slice(&self.hash.0);
        record[INNER_PAD_OFFSET..NODE_SIZE].fill(0);
    }
}

impl fmt::Display for InnerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addr {} gen {} hash {}", self.addr, self.gen, self.hash)
    }
}

// ── Leaf node ───────────────────────────────────────────────────────────────

/// One allocatable-block record: the physical address it tracks plus the
/// usage history the allocation policy consults.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct LeafNode {
    pub addr: BlockAddress,
    pub last_vba: VirtualAddress,
    pub alloc_gen: Generation,
    pub free_gen: Generation,
    pub last_key: KeyId,
    pub reserved: bool,
}

const LEAF_ADDR_OFFSET: usize = 0;
const LEAF_LAST_VBA_OFFSET: usize = 8;
const LEAF_ALLOC_GEN_OFFSET: usize = 16;
const LEAF_FREE_GEN_OFFSET: usize = 24;
const LEAF_LAST_KEY_OFFSET: usize = 32;
const LEAF_RESERVED_OFFSET: usize = 36;
const LEAF_PAD_OFFSET: usize = 37;

impl LeafNode {
    pub const ZERO: Self = Self {
        addr: BlockAddress(0),
        last_vba: VirtualAddress(0),
        alloc_gen: Generation(0),
        free_gen: Generation(0),
        last_key: KeyId(0),
        reserved: false,
    };

    /// A record distinct from the all-zero default tracks a real block.
    #[must_use]
    pub fn is_allocated(&self) -> bool {
        *self != Self::ZERO
    }

    fn parse(record: &[u8]) -> Result<Self, ParseError> {
        debug_assert_eq!(record.len(), NODE_SIZE);
        let reserved = match record[LEAF_RESERVED_OFFSET] {
            0 => false,
            1 => true,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "reserved",
                    reason: "on-disk bool must be 0 or 1",
                })
            }
        };
        Ok(Self {
            addr: BlockAddress(read_le_u64(record, LEAF_ADDR_OFFSET)?),
            last_vba: VirtualAddress(read_le_u64(record, LEAF_LAST_VBA_OFFSET)?),
            alloc_gen: Generation(read_le_u64(record, LEAF_ALLOC_GEN_OFFSET)?),
            free_gen: Generation(read_le_u64(record, LEAF_FREE_GEN_OFFSET)?),
            last_key: KeyId(read_le_u32(record, LEAF_LAST_KEY_OFFSET)?),
            reserved,
        })
    }

    fn encode_into(&self, record: &mut [u8]) {
        debug_assert_eq!(record.len(), NODE_SIZE);
        record[LEAF_ADDR_OFFSET..LEAF_LAST_VBA_OFFSET]
            .copy_from_slice(&self.addr.0.to_le_bytes());
        record[LEAF_LAST_VBA_OFFSET..LEAF_ALLOC_GEN_OFFSET]
            .copy_from_slice(&self.last_vba.0.to_le_bytes());
        record[LEAF_ALLOC_GEN_OFFSET..LEAF_FREE_GEN_OFFSET]
            .copy_from_slice(&self.alloc_gen.0.to_le_bytes());
        record[LEAF_FREE_GEN_OFFSET..LEAF_LAST_KEY_OFFSET]
            .copy_from_slice(&self.free_gen.0.to_le_bytes());
        record[LEAF_LAST_KEY_OFFSET..LEAF_RESERVED_OFFSET]
            .copy_from_slice(&self.last_key.0.to_le_bytes());
        record[LEAF_RESERVED_OFFSET] = u8::from(self.reserved);
        record[LEAF_PAD_OFFSET..NODE_SIZE].fill(0);
    }
}

impl fmt::Display for LeafNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "addr {} last_vba {} alloc_gen {} free_gen {} last_key {}",
            self.addr, self.last_vba, self.alloc_gen, self.free_gen, self.last_key
        )
    }
}

// ── Node blocks ─────────────────────────────────────────────────────────────

/// Require exactly one block's worth of bytes.
fn ensure_block_len(data: &[u8]) -> Result<(), ParseError> {
    if data.len() < BLOCK_SIZE {
        return Err(ParseError::InsufficientData {
            needed: BLOCK_SIZE,
            offset: 0,
            actual: data.len(),
        });
    }
    if data.len() > BLOCK_SIZE {
        return Err(ParseError::InvalidField {
            field: "node_block",
            reason: "length exceeds one block",
        });
    }
    Ok(())
}

/// One block of 64 inner records (levels 2 and above).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerNodeBlock {
    pub nodes: [InnerNode; NODES_PER_BLOCK],
}

impl Default for InnerNodeBlock {
    fn default() -> Self {
        Self {
            nodes: [InnerNode::ZERO; NODES_PER_BLOCK],
        }
    }
}

impl InnerNodeBlock {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_block_len(data)?;
        let mut block = Self::default();
        for (idx, record) in data.chunks_exact(NODE_SIZE).enumerate() {
            block.nodes[idx] = InnerNode::parse(record)?;
        }
        Ok(block)
    }

    #[must_use]
    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut data = [0_u8; BLOCK_SIZE];
        for (node, record) in self.nodes.iter().zip(data.chunks_exact_mut(NODE_SIZE)) {
            node.encode_into(record);
        }
        data
    }

    /// Reset every record to the unallocated sentinel.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One block of 64 leaf records (level 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNodeBlock {
    pub nodes: [LeafNode; NODES_PER_BLOCK],
}

impl Default for LeafNodeBlock {
    fn default() -> Self {
        Self {
            nodes: [LeafNode::ZERO; NODES_PER_BLOCK],
        }
    }
}

impl LeafNodeBlock {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_block_len(data)?;
        let mut block = Self::default();
        for (idx, record) in data.chunks_exact(NODE_SIZE).enumerate() {
            block.nodes[idx] = LeafNode::parse(record)?;
        }
        Ok(block)
    }

    #[must_use]
    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut data = [0_u8; BLOCK_SIZE];
        for (node, record) in self.nodes.iter().zip(data.chunks_exact_mut(NODE_SIZE)) {
            node.encode_into(record);
        }
        data
    }

    /// Reset every record to the unallocated sentinel.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_inner(seed: u64) -> InnerNode {
        InnerNode {
            addr: BlockAddress(seed),
            gen: Generation(seed.wrapping_mul(3) + 1),
            hash: NodeHash([u8::try_from(seed % 251).expect("fits"); HASH_SIZE]),
        }
    }

    fn sample_leaf(seed: u64) -> LeafNode {
        LeafNode {
            addr: BlockAddress(seed),
            last_vba: VirtualAddress(seed + 7),
            alloc_gen: Generation(seed / 2),
            free_gen: Generation(seed / 3),
            last_key: KeyId(u32::try_from(seed % 1000).expect("fits")),
            reserved: seed % 2 == 1,
        }
    }

    #[test]
    fn inner_block_round_trip_including_padding() {
        let mut block = InnerNodeBlock::default();
        for (idx, node) in block.nodes.iter_mut().enumerate() {
            *node = sample_inner(idx as u64 * 17 + 1);
        }
        let bytes = block.encode();
        assert_eq!(bytes.len(), BLOCK_SIZE);
        // Reserved region of every record is zero-filled.
        for record in bytes.chunks_exact(NODE_SIZE) {
            assert!(record[48..].iter().all(|b| *b == 0));
        }
        assert_eq!(InnerNodeBlock::parse(&bytes).expect("parse"), block);
    }

    #[test]
    fn leaf_block_round_trip_including_padding() {
        let mut block = LeafNodeBlock::default();
        for (idx, node) in block.nodes.iter_mut().enumerate() {
            *node = sample_leaf(idx as u64 * 13 + 1);
        }
        let bytes = block.encode();
        for record in bytes.chunks_exact(NODE_SIZE) {
            assert!(record[37..].iter().all(|b| *b == 0));
        }
        assert_eq!(LeafNodeBlock::parse(&bytes).expect("parse"), block);
    }

    #[test]
    fn unallocated_sentinel_is_all_zero() {
        assert!(!InnerNode::ZERO.is_allocated());
        assert!(!LeafNode::ZERO.is_allocated());

        // Any single nonzero field makes the record allocated.
        let mut inner = InnerNode::ZERO;
        inner.gen = Generation(1);
        assert!(inner.is_allocated());

        let mut leaf = LeafNode::ZERO;
        leaf.reserved = true;
        assert!(leaf.is_allocated());

        // And the zero block encodes to all-zero bytes.
        assert_eq!(InnerNodeBlock::default().encode(), [0_u8; BLOCK_SIZE]);
        assert_eq!(LeafNodeBlock::default().encode(), [0_u8; BLOCK_SIZE]);
    }

    #[test]
    fn parse_rejects_wrong_sizes() {
        let short = vec![0_u8; BLOCK_SIZE - 1];
        let long = vec![0_u8; BLOCK_SIZE + 1];
        assert!(matches!(
            InnerNodeBlock::parse(&short),
            Err(ParseError::InsufficientData { .. })
        ));
        assert!(matches!(
            InnerNodeBlock::parse(&long),
            Err(ParseError::InvalidField { .. })
        ));
        assert!(LeafNodeBlock::parse(&short).is_err());
        assert!(LeafNodeBlock::parse(&long).is_err());
    }

    #[test]
    fn leaf_parse_rejects_malformed_reserved_flag() {
        let mut bytes = [0_u8; BLOCK_SIZE];
        bytes[LEAF_RESERVED_OFFSET] = 2;
        assert_eq!(
            LeafNodeBlock::parse(&bytes),
            Err(ParseError::InvalidField {
                field: "reserved",
                reason: "on-disk bool must be 0 or 1",
            })
        );
    }

    #[test]
    fn hash_block_is_stable_and_content_sensitive() {
        let mut block = [0_u8; BLOCK_SIZE];
        let zero_hash = hash_block(&block);
        assert_eq!(zero_hash, hash_block(&[0_u8; BLOCK_SIZE]));
        assert!(!zero_hash.is_zero());

        block[100] = 1;
        assert_ne!(zero_hash, hash_block(&block));
    }

    #[test]
    fn display_summaries() {
        let inner = InnerNode {
            addr: BlockAddress(5),
            gen: Generation(2),
            hash: NodeHash::ZERO,
        };
        assert_eq!(inner.to_string(), "addr 5 gen 2 hash 00000000..");
    }

    proptest! {
        #[test]
        fn inner_record_round_trip(seed in any::<u64>()) {
            let node = sample_inner(seed);
            let mut record = [0_u8; NODE_SIZE];
            node.encode_into(&mut record);
            prop_assert_eq!(InnerNode::parse(&record).expect("parse"), node);
        }

        #[test]
        fn leaf_record_round_trip(seed in any::<u64>()) {
            let node = sample_leaf(seed);
            let mut record = [0_u8; NODE_SIZE];
            node.encode_into(&mut record);
            prop_assert_eq!(LeafNode::parse(&record).expect("parse"), node);
        }
    }
}
