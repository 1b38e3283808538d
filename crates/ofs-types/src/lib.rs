#![forbid(unsafe_code)]
//! Core identifier types and tree geometry for Opal.
//!
//! Everything that touches a block on disk or a position in the free-space
//! tree goes through the unit-carrying newtypes defined here, so physical
//! addresses, virtual leaf indices, and generation counters cannot be mixed
//! by accident. The address arithmetic at the bottom of this crate is the
//! single source of truth for how a virtual leaf index maps onto per-level
//! node indices.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size of one storage block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// On-disk size of one tree node record (inner or leaf) in bytes.
pub const NODE_SIZE: usize = 64;

/// Number of node records packed into one block.
pub const NODES_PER_BLOCK: usize = BLOCK_SIZE / NODE_SIZE;

/// Size of the node hash stored in inner records.
pub const HASH_SIZE: usize = 32;

/// Highest tree level supported by the on-disk format.
pub const TREE_MAX_LEVEL: u32 = 6;

/// Length of per-level working arrays, indexed directly by level.
///
/// Level 0 is never a node-block level; keeping it in the array lets all
/// walk state use the tree level itself as the index.
pub const LEVEL_SLOTS: usize = (TREE_MAX_LEVEL + 1) as usize;

/// Largest supported tree fan-out.
pub const TREE_MAX_DEGREE: u32 = 64;

/// Physical address of one fixed-size block on the underlying device.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockAddress(pub u64);

/// Virtual leaf index: a position in the tree's addressable leaf space.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct VirtualAddress(pub u64);

/// Copy-on-write epoch counter.
///
/// A node stamped with the current generation is volatile (overwritable in
/// place); any older stamp makes the node immutable and forces reallocation
/// before it can change.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Generation(pub u64);

/// Encryption-key epoch recorded in leaf records.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct KeyId(pub u32);

/// Generation stamped into freshly grafted leaf records.
pub const INITIAL_GENERATION: Generation = Generation(0);

/// Key id recorded before a leaf has ever carried encrypted payload.
pub const INVALID_KEY_ID: KeyId = KeyId(0);

/// Sentinel stored in `last_vba` of leaf records that no virtual address
/// has used yet (`degree_max^(level_max − 1)`, fixed by the on-disk format).
pub const INVALID_VIRTUAL_ADDRESS: VirtualAddress =
    VirtualAddress((TREE_MAX_DEGREE as u64).pow(TREE_MAX_LEVEL - 1));

impl BlockAddress {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated tree fan-out (power of two in `2..=64`).
///
/// The address arithmetic below shifts and masks by `log2(degree)`, so the
/// constructor rejects anything that is not a power of two up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TreeDegree(u32);

impl TreeDegree {
    /// Create a `TreeDegree` if `value` is a power of two in [2, 64].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(2..=TREE_MAX_DEGREE).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "tree_degree",
                reason: "must be power of two in 2..=64",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Number of bits one tree level contributes to a virtual address.
    #[must_use]
    pub fn log2(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Mask selecting one level's node index out of a virtual address.
    #[must_use]
    pub fn mask(self) -> u64 {
        u64::from(self.0) - 1
    }
}

impl fmt::Display for TreeDegree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Address arithmetic ──────────────────────────────────────────────────────

/// Node index addressed by `vba` within the node block at `level`.
///
/// Level 1 selects a leaf record directly; every level above shifts the
/// virtual address right by one more `log2(degree)` stride.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // masked to degree - 1 <= 63
pub fn node_index_at_level(vba: VirtualAddress, level: u32, degree: TreeDegree) -> u32 {
    debug_assert!(level >= 1);
    let shift = u64::from(degree.log2()) * u64::from(level - 1);
    ((vba.0 >> shift) & degree.mask()) as u32
}

/// Leaf record index addressed by `vba` (the level-1 case).
#[must_use]
pub fn leaf_record_index(vba: VirtualAddress, degree: TreeDegree) -> u32 {
    node_index_at_level(vba, 1, degree)
}

/// Largest virtual address a tree of the given shape can hold:
/// `degree^level − 1`. `None` if the shape overflows the address space.
#[must_use]
pub fn max_virtual_address(degree: TreeDegree, max_level: u32) -> Option<VirtualAddress> {
    u64::from(degree.get())
        .checked_pow(max_level)
        .map(|capacity| VirtualAddress(capacity - 1))
}

// ── Little-endian codec helpers ─────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}
