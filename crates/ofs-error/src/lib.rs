#![forbid(unsafe_code)]
//! Error types for Opal.
//!
//! # Error Taxonomy
//!
//! The block-management core distinguishes exactly four failure classes:
//!
//! | Class | Variant | Fatal to the operation? | Retried? |
//! |-------|---------|-------------------------|----------|
//! | Integrity failure | `HashMismatch` | yes — treated as on-disk corruption | never |
//! | Service failure | `SubRequestFailed` | yes | never (retry lives below this layer) |
//! | Programmer error | `InvalidCall` | n/a — must not occur in a correctly wired host | never |
//! | Byte-format violation | `Parse` | depends on the boundary | never |
//!
//! Running out of contingent addresses during a tree extension is *not* an
//! error and has no variant here: grafting legitimately stops early and
//! reports where, and the host issues a follow-up request.
//!
//! A fatal error inside an in-flight tree extension does not propagate as a
//! return value from the engine's polling entry points; it parks the owning
//! slot permanently (the slot never reports completed) and is recorded on
//! the slot for host diagnostics. Recovery is the job of the enclosing
//! generation-commit protocol, which never adopts an uncompleted result.
//!
//! ## Design Constraints
//!
//! - `ofs-error` MUST NOT depend on `ofs-types` or `ofs-ondisk` (no cyclic
//!   deps). Addresses and levels appear here as raw integers; the crates
//!   that see both sides convert at their boundary.
//! - All string payloads are owned (`String`) or `'static` so errors can be
//!   stored on long-lived slot state without lifetime entanglement.

use thiserror::Error;

/// Unified error type for all Opal block-management operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OfsError {
    /// A verified read produced bytes whose hash disagrees with the hash the
    /// parent node (or the tree identity, for the root) recorded for it.
    ///
    /// Treated as on-disk corruption or an upstream logic error; the owning
    /// operation is abandoned, never retried.
    #[error("hash mismatch reading block {addr} at tree level {level}")]
    HashMismatch { addr: u64, level: u32 },

    /// An external service (block I/O or the allocation tracker) reported
    /// failure for a sub-request. Transient-I/O retry is handled below this
    /// layer, so by the time a failure arrives here it is final.
    #[error("{service} sub-request failed for block {addr}")]
    SubRequestFailed { service: &'static str, addr: u64 },

    /// An API contract was violated by the caller: submitting with no free
    /// slot, a malformed slot index, a result delivered to a slot that is
    /// not awaiting it, or growing a tree past its maximum level.
    #[error("invalid call: {0}")]
    InvalidCall(&'static str),

    /// Byte-level format violation surfaced across a crate boundary.
    #[error("parse error: {0}")]
    Parse(String),
}

/// Result alias using `OfsError`.
pub type Result<T> = std::result::Result<T, OfsError>;
