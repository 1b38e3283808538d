#![forbid(unsafe_code)]
//! Free-space tree extension engine.
//!
//! Grows the capacity of a sparse, copy-on-write, hash-verified tree of
//! allocatable physical blocks. The engine owns a fixed array of slots, one
//! per concurrently in-flight extension request, and is driven entirely from
//! the outside:
//!
//! 1. the host claims a free slot with [`FreeTreeExtender::submit`];
//! 2. a scheduler loop calls [`FreeTreeExtender::advance`] to move every
//!    slot forward by at most one transition per call;
//! 3. sub-requests the engine needs serviced — node-block reads/writes for
//!    the block-I/O service, replacement-address queries for the allocation
//!    tracker — are exposed via [`FreeTreeExtender::peek_sub_request`],
//!    consumed via [`FreeTreeExtender::drop_sub_request`], and answered via
//!    the `deliver_*` calls;
//! 4. finished extensions surface through
//!    [`FreeTreeExtender::peek_completed`] /
//!    [`FreeTreeExtender::drop_completed`].
//!
//! Everything is single-threaded and non-blocking: no call ever waits on
//! I/O, and a slot whose sub-request is outstanding simply stays parked
//! until the result is delivered. Slots are fully independent of one
//! another and the engine imposes no ordering between them.
//!
//! An extension may legitimately add fewer leaves than its address
//! contingent suggests: grafting stops when the contingent runs dry and the
//! completed outcome reports what was added, leaving the host to issue a
//! follow-up request for the remainder. Fatal conditions (hash mismatch on
//! a verified read, a failed sub-request) park the slot permanently instead
//! of completing it; the enclosing commit protocol never adopts the result
//! of an uncompleted extension.

pub mod graft;
pub mod request;
mod step;

pub use graft::{BlockContingent, GraftReport};
pub use request::{
    BlockIoOp, ExtendOutcome, ExtendRequest, MetaTreeRef, SubRequest, TreeShape,
};

use ofs_error::{OfsError, Result};
use ofs_types::{BlockAddress, BLOCK_SIZE};
use step::Slot;

/// Slot count used by [`FreeTreeExtender::default`].
pub const DEFAULT_SLOT_COUNT: usize = 4;

/// The extension engine: a fixed table of independent operation slots.
///
/// Explicitly constructed and owned by the host (no process-wide state);
/// the host's scheduler loop drives it alongside the block-I/O and
/// allocation-tracker services.
#[derive(Debug)]
pub struct FreeTreeExtender {
    slots: Vec<Slot>,
}

impl Default for FreeTreeExtender {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_COUNT)
    }
}

impl FreeTreeExtender {
    /// Create an engine with `slot_count` concurrent operation slots.
    #[must_use]
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: (0..slot_count).map(|_| Slot::empty()).collect(),
        }
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Whether a new request can be submitted right now.
    #[must_use]
    pub fn has_free_slot(&self) -> bool {
        self.slots.iter().any(Slot::is_free)
    }

    /// Claim a free slot for `request` and return its index.
    ///
    /// Callers must check [`Self::has_free_slot`] first; submitting with
    /// every slot occupied is a wiring error, not a runtime condition.
    pub fn submit(&mut self, request: ExtendRequest) -> Result<usize> {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_free() {
                slot.submit(request, idx);
                return Ok(idx);
            }
        }
        Err(OfsError::InvalidCall("submit without a free slot"))
    }

    /// Drive every slot forward by at most one state transition each.
    ///
    /// Returns whether any slot made progress, so the scheduler can detect
    /// quiescence.
    pub fn advance(&mut self) -> bool {
        let mut progress = false;
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            progress |= slot.execute(idx);
        }
        progress
    }

    /// The next sub-request needing service, if any slot has one pending.
    #[must_use]
    pub fn peek_sub_request(&self) -> Option<SubRequest> {
        self.slots
            .iter()
            .enumerate()
            .find_map(|(idx, slot)| slot.sub_request(idx))
    }

    /// Consume the pending sub-request of `slot`; its result must later be
    /// handed back through the matching `deliver_*` call.
    pub fn drop_sub_request(&mut self, slot: usize) -> Result<()> {
        self.slot_mut(slot)?.take_sub_request()
    }

    /// Deliver a block-I/O result to `slot`. `data` carries the block for
    /// successful reads and is ignored for writes.
    pub fn deliver_block_io(
        &mut self,
        slot: usize,
        success: bool,
        data: Option<&[u8; BLOCK_SIZE]>,
    ) -> Result<()> {
        self.slot_mut(slot)?.deliver_block_io(slot, success, data)
    }

    /// Deliver an allocation-tracker result to `slot`.
    pub fn deliver_alloc(
        &mut self,
        slot: usize,
        success: bool,
        new_addr: BlockAddress,
    ) -> Result<()> {
        self.slot_mut(slot)?.deliver_alloc(success, new_addr)
    }

    /// The next finished extension, if any.
    #[must_use]
    pub fn peek_completed(&self) -> Option<(usize, &ExtendOutcome)> {
        self.slots
            .iter()
            .enumerate()
            .find_map(|(idx, slot)| slot.peek_completed().map(|outcome| (idx, outcome)))
    }

    /// Drain the finished extension in `slot`, freeing the slot.
    pub fn drop_completed(&mut self, slot: usize) -> Result<ExtendOutcome> {
        self.slot_mut(slot)?
            .drain_completed()
            .ok_or(OfsError::InvalidCall("slot has no completed request"))
    }

    /// The fatal error that parked `slot`, if it failed.
    ///
    /// A parked slot never completes; this accessor exists for host-side
    /// diagnostics of an otherwise silent hang.
    #[must_use]
    pub fn slot_error(&self, slot: usize) -> Option<&OfsError> {
        self.slots.get(slot).and_then(Slot::error)
    }

    fn slot_mut(&mut self, slot: usize) -> Result<&mut Slot> {
        self.slots
            .get_mut(slot)
            .ok_or(OfsError::InvalidCall("slot index out of range"))
    }
}
