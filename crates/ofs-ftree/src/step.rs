//! Per-slot state machine of the extension engine.
//!
//! One slot carries one in-flight extension request from submission to
//! completion. Every state that needs an external answer parks as a
//! pending/in-progress pair and control returns to the caller; resumption
//! happens only through explicit delivery of the sub-request's result, so a
//! scheduling turn never spans an I/O round-trip.

use crate::graft::{graft_branch, raise_root, BlockContingent};
use crate::request::{BlockIoOp, ExtendOutcome, ExtendRequest, SubRequest};
use ofs_error::OfsError;
use ofs_ondisk::{hash_block, InnerNode, InnerNodeBlock, LeafNodeBlock};
use ofs_types::{
    leaf_record_index, max_virtual_address, node_index_at_level, BlockAddress, Generation,
    VirtualAddress, BLOCK_SIZE, LEVEL_SLOTS,
};
use tracing::{debug, error, trace};

/// Where one slot stands in its read / graft / allocate / write-back cycle.
///
/// `Pending` states have composed a sub-request that the host has not yet
/// picked up; `InProgress` states await that sub-request's result;
/// `Completed` states process the delivered result on the next `advance`
/// turn. `Failed` is terminal: the slot stays parked and never reports
/// completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Submitted,
    ReadRootPending,
    ReadRootInProgress,
    ReadRootCompleted,
    ReadInnerPending,
    ReadInnerInProgress,
    ReadInnerCompleted,
    AllocPending,
    AllocInProgress,
    AllocCompleted,
    WriteInnerPending,
    WriteInnerInProgress,
    WriteInnerCompleted,
    WriteRootPending,
    WriteRootInProgress,
    WriteRootCompleted,
    Completed,
    Failed,
}

/// Working state of one in-flight extension request.
///
/// All parent-to-child references discovered during the walk live in plain
/// per-level arrays indexed by tree level; nothing here points into another
/// slot and no slot data outlives its drain.
#[derive(Debug)]
pub(crate) struct Slot {
    request: Option<ExtendRequest>,
    state: SlotState,

    /// First virtual address past the existing leaves; the walk target.
    vba: VirtualAddress,
    /// Level currently being read or written back.
    level: u32,
    /// Level the reuse-vs-reallocate pass is deciding.
    alloc_level: u32,

    old_addrs: [BlockAddress; LEVEL_SLOTS],
    old_gens: [Generation; LEVEL_SLOTS],
    new_addrs: [BlockAddress; LEVEL_SLOTS],
    inner: [InnerNodeBlock; LEVEL_SLOTS],
    leaves: LeafNodeBlock,
    /// Encoded bytes of the block last read or about to be written.
    scratch: [u8; BLOCK_SIZE],

    /// Target of the outstanding block-I/O sub-request.
    io_addr: BlockAddress,
    /// Success flag of the last finished sub-request (true for the
    /// reuse-without-query path, which needs no service round-trip).
    sub_ok: bool,

    contingent: BlockContingent,
    /// Working copies of the tree identity, updated in place and stamped
    /// into the outcome at completion.
    root: InnerNode,
    max_level: u32,
    leaf_count: u64,
    leaves_added: u64,

    outcome: Option<ExtendOutcome>,
    error: Option<OfsError>,
}

impl Slot {
    pub(crate) fn empty() -> Self {
        Self {
            request: None,
            state: SlotState::Submitted,
            vba: VirtualAddress(0),
            level: 0,
            alloc_level: 0,
            old_addrs: [BlockAddress(0); LEVEL_SLOTS],
            old_gens: [Generation(0); LEVEL_SLOTS],
            new_addrs: [BlockAddress(0); LEVEL_SLOTS],
            inner: std::array::from_fn(|_| InnerNodeBlock::default()),
            leaves: LeafNodeBlock::default(),
            scratch: [0; BLOCK_SIZE],
            io_addr: BlockAddress(0),
            sub_ok: false,
            contingent: BlockContingent::new(BlockAddress(0), 0),
            root: InnerNode::ZERO,
            max_level: 0,
            leaf_count: 0,
            leaves_added: 0,
            outcome: None,
            error: None,
        }
    }

    pub(crate) fn is_free(&self) -> bool {
        self.request.is_none()
    }

    pub(crate) fn error(&self) -> Option<&OfsError> {
        self.error.as_ref()
    }

    pub(crate) fn submit(&mut self, request: ExtendRequest, slot_idx: usize) {
        debug!(
            slot = slot_idx,
            gen = %request.curr_gen,
            leaves = request.shape.leaf_count,
            contingent = request.block_count,
            "extension request submitted"
        );
        self.root = request.root;
        self.max_level = request.shape.max_level;
        self.leaf_count = request.shape.leaf_count;
        self.contingent = BlockContingent::new(request.first_block, request.block_count);
        self.request = Some(request);
        self.state = SlotState::Submitted;
        self.outcome = None;
        self.error = None;
        self.leaves_added = 0;
    }

    pub(crate) fn drain_completed(&mut self) -> Option<ExtendOutcome> {
        if self.state != SlotState::Completed {
            return None;
        }
        let outcome = self.outcome.take();
        *self = Self::empty();
        outcome
    }

    pub(crate) fn peek_completed(&self) -> Option<&ExtendOutcome> {
        if self.state == SlotState::Completed {
            self.outcome.as_ref()
        } else {
            None
        }
    }

    /// Park the slot permanently; it never reports completed.
    fn fail(&mut self, slot_idx: usize, err: OfsError) {
        error!(slot = slot_idx, %err, "extension request failed; slot parked");
        self.error = Some(err);
        self.state = SlotState::Failed;
    }

    // ── Scheduling turn ─────────────────────────────────────────────────────

    /// Drive this slot by at most one state transition. Returns whether the
    /// slot made progress.
    pub(crate) fn execute(&mut self, slot_idx: usize) -> bool {
        if self.request.is_none() {
            return false;
        }
        match self.state {
            SlotState::Submitted => {
                self.start(slot_idx);
                true
            }
            SlotState::ReadRootCompleted | SlotState::ReadInnerCompleted => {
                self.read_completed(slot_idx);
                true
            }
            SlotState::AllocCompleted => {
                self.alloc_completed(slot_idx);
                true
            }
            SlotState::WriteInnerCompleted => {
                self.write_inner_completed(slot_idx);
                true
            }
            SlotState::WriteRootCompleted => {
                self.write_root_completed(slot_idx);
                true
            }
            SlotState::ReadRootPending
            | SlotState::ReadRootInProgress
            | SlotState::ReadInnerPending
            | SlotState::ReadInnerInProgress
            | SlotState::AllocPending
            | SlotState::AllocInProgress
            | SlotState::WriteInnerPending
            | SlotState::WriteInnerInProgress
            | SlotState::WriteRootPending
            | SlotState::WriteRootInProgress
            | SlotState::Completed
            | SlotState::Failed => false,
        }
    }

    fn start(&mut self, slot_idx: usize) {
        let Some(request) = self.request.as_ref() else {
            return;
        };
        let degree = request.shape.degree;
        let curr_gen = request.curr_gen;

        self.leaves_added = 0;
        self.vba = VirtualAddress(self.leaf_count);
        self.old_addrs = [BlockAddress(0); LEVEL_SLOTS];
        self.old_gens = [Generation(0); LEVEL_SLOTS];
        self.new_addrs = [BlockAddress(0); LEVEL_SLOTS];

        self.level = self.max_level;
        self.old_addrs[self.level as usize] = self.root.addr;
        self.old_gens[self.level as usize] = self.root.gen;

        let Some(max_vba) = max_virtual_address(degree, self.max_level) else {
            self.fail(
                slot_idx,
                OfsError::InvalidCall("tree shape exceeds the virtual address space"),
            );
            return;
        };

        if self.vba <= max_vba {
            // Room left under the current root: walk down from it.
            trace!(
                slot = slot_idx,
                root = %self.root,
                leaves = self.leaf_count,
                max_level = self.max_level,
                "reading tree root"
            );
            self.io_addr = self.root.addr;
            self.state = SlotState::ReadRootPending;
        } else {
            // The shape is at capacity: grow one level, then graft the new
            // branch right of the demoted root and go straight to write-back.
            if let Err(err) = raise_root(
                &mut self.root,
                &mut self.max_level,
                curr_gen,
                &mut self.contingent,
                &mut self.inner,
                &mut self.new_addrs,
            ) {
                self.fail(slot_idx, err);
                return;
            }
            let attach_child = node_index_at_level(self.vba, self.max_level, degree);
            let report = graft_branch(
                self.max_level,
                attach_child,
                degree,
                curr_gen,
                &mut self.contingent,
                &mut self.inner,
                &mut self.leaves,
                &mut self.new_addrs,
            );
            self.level = report.stopped_level;
            self.leaves_added = report.leaves_added;
            trace!(
                slot = slot_idx,
                stopped_level = report.stopped_level,
                leaves_added = report.leaves_added,
                "grafted under raised root"
            );
            self.begin_write(slot_idx, self.level);
        }
    }

    /// A verified read arrived: hash-check it, then either descend further
    /// or graft at the first unallocated child and switch to the bottom-up
    /// passes.
    fn read_completed(&mut self, slot_idx: usize) {
        let Some(request) = self.request.as_ref() else {
            return;
        };
        let degree = request.shape.degree;
        let curr_gen = request.curr_gen;

        if !self.sub_ok {
            let addr = self.io_addr.0;
            self.fail(
                slot_idx,
                OfsError::SubRequestFailed {
                    service: "block-io",
                    addr,
                },
            );
            return;
        }

        // The root verifies against the tree identity; everything below
        // verifies against the hash its parent recorded for it.
        let expected = if self.level == self.max_level {
            self.root.hash
        } else {
            let parent = self.level + 1;
            let child_idx = node_index_at_level(self.vba, parent, degree) as usize;
            self.inner[parent as usize].nodes[child_idx].hash
        };
        if hash_block(&self.scratch) != expected {
            let addr = self.old_addrs[self.level as usize].0;
            let level = self.level;
            self.fail(slot_idx, OfsError::HashMismatch { addr, level });
            return;
        }

        if self.level > 1 {
            let child_idx = node_index_at_level(self.vba, self.level, degree) as usize;
            let child = self.inner[self.level as usize].nodes[child_idx];

            if child.is_allocated() {
                // Existing structure continues below; keep walking down.
                let child_level = self.level - 1;
                self.old_addrs[child_level as usize] = child.addr;
                self.old_gens[child_level as usize] = child.gen;
                trace!(
                    slot = slot_idx,
                    level = self.level,
                    child = child_idx,
                    node = %child,
                    "descending into allocated child"
                );
                self.level = child_level;
                self.io_addr = child.addr;
                self.state = SlotState::ReadInnerPending;
            } else {
                // First unallocated child: this is the attachment point.
                let attach_level = self.level;
                let report = graft_branch(
                    attach_level,
                    child_idx as u32,
                    degree,
                    curr_gen,
                    &mut self.contingent,
                    &mut self.inner,
                    &mut self.leaves,
                    &mut self.new_addrs,
                );
                self.level = report.stopped_level;
                self.leaves_added = report.leaves_added;
                trace!(
                    slot = slot_idx,
                    attach_level,
                    attach_child = child_idx,
                    stopped_level = report.stopped_level,
                    leaves_added = report.leaves_added,
                    "grafted branch at attachment point"
                );
                self.begin_alloc(slot_idx, attach_level);
            }
        } else {
            // Leaf block reached: the record the walk targets must be free,
            // and the graft continues from it.
            let leaf_idx = leaf_record_index(self.vba, degree) as usize;
            if self.leaves.nodes[leaf_idx].is_allocated() {
                self.fail(
                    slot_idx,
                    OfsError::InvalidCall("attachment leaf record is already allocated"),
                );
                return;
            }
            let report = graft_branch(
                1,
                leaf_idx as u32,
                degree,
                curr_gen,
                &mut self.contingent,
                &mut self.inner,
                &mut self.leaves,
                &mut self.new_addrs,
            );
            self.level = report.stopped_level;
            self.leaves_added = report.leaves_added;
            trace!(
                slot = slot_idx,
                attach_child = leaf_idx,
                leaves_added = report.leaves_added,
                "grafted leaves at attachment point"
            );
            self.begin_alloc(slot_idx, 1);
        }
    }

    /// Start the reuse-vs-reallocate decision at `level`.
    ///
    /// A node written under the current generation is volatile and keeps its
    /// address; anything older needs a replacement address from the
    /// allocation tracker before it may change.
    fn begin_alloc(&mut self, slot_idx: usize, level: u32) {
        let Some(request) = self.request.as_ref() else {
            return;
        };
        let curr_gen = request.curr_gen;
        self.alloc_level = level;
        if self.old_gens[level as usize] == curr_gen {
            self.new_addrs[level as usize] = self.old_addrs[level as usize];
            self.sub_ok = true;
            trace!(
                slot = slot_idx,
                level,
                addr = %self.new_addrs[level as usize],
                "node is volatile; reusing its address"
            );
            self.state = SlotState::AllocCompleted;
        } else {
            trace!(
                slot = slot_idx,
                level,
                old_addr = %self.old_addrs[level as usize],
                "requesting replacement address"
            );
            self.state = SlotState::AllocPending;
        }
    }

    /// One allocation decision is in hand; move one level up, or switch to
    /// write-back once every touched level up to the top block is final.
    fn alloc_completed(&mut self, slot_idx: usize) {
        if !self.sub_ok {
            let addr = self.old_addrs[self.alloc_level as usize].0;
            self.fail(
                slot_idx,
                OfsError::SubRequestFailed {
                    service: "alloc",
                    addr,
                },
            );
            return;
        }
        if self.alloc_level < self.max_level {
            let next = self.alloc_level + 1;
            self.begin_alloc(slot_idx, next);
        } else {
            self.begin_write(slot_idx, self.level);
        }
    }

    /// Encode `level`'s block into the scratch buffer and park for the write.
    fn begin_write(&mut self, slot_idx: usize, level: u32) {
        if level == 0 || level > self.max_level {
            self.fail(
                slot_idx,
                OfsError::InvalidCall("write-back level outside the tree"),
            );
            return;
        }
        self.scratch = if level > 1 {
            self.inner[level as usize].encode()
        } else {
            self.leaves.encode()
        };
        self.io_addr = self.new_addrs[level as usize];
        trace!(
            slot = slot_idx,
            level,
            addr = %self.io_addr,
            "writing node block"
        );
        self.state = if level < self.max_level {
            SlotState::WriteInnerPending
        } else {
            SlotState::WriteRootPending
        };
    }

    /// A non-top write finished: record the child's new address, generation,
    /// and content hash in its parent, then write the parent.
    fn write_inner_completed(&mut self, slot_idx: usize) {
        let Some(request) = self.request.as_ref() else {
            return;
        };
        let degree = request.shape.degree;
        let curr_gen = request.curr_gen;

        if !self.sub_ok {
            let addr = self.io_addr.0;
            self.fail(
                slot_idx,
                OfsError::SubRequestFailed {
                    service: "block-io",
                    addr,
                },
            );
            return;
        }

        let child_level = self.level;
        let parent_level = child_level + 1;
        let child_idx = node_index_at_level(self.vba, parent_level, degree) as usize;
        let child = InnerNode {
            addr: self.new_addrs[child_level as usize],
            gen: curr_gen,
            hash: hash_block(&self.scratch),
        };
        self.inner[parent_level as usize].nodes[child_idx] = child;
        trace!(
            slot = slot_idx,
            level = parent_level,
            child = child_idx,
            node = %child,
            "recorded child in parent"
        );

        self.level = parent_level;
        self.begin_write(slot_idx, parent_level);
    }

    /// The top node block is durable: stamp the new tree identity and the
    /// leaf tally, and surface the outcome.
    fn write_root_completed(&mut self, slot_idx: usize) {
        let Some(request) = self.request.as_ref() else {
            return;
        };
        let curr_gen = request.curr_gen;

        if !self.sub_ok {
            let addr = self.io_addr.0;
            self.fail(
                slot_idx,
                OfsError::SubRequestFailed {
                    service: "block-io",
                    addr,
                },
            );
            return;
        }

        self.root = InnerNode {
            addr: self.new_addrs[self.level as usize],
            gen: curr_gen,
            hash: hash_block(&self.scratch),
        };
        self.leaf_count += self.leaves_added;
        self.outcome = Some(ExtendOutcome {
            root: self.root,
            max_level: self.max_level,
            leaf_count: self.leaf_count,
            leaves_added: self.leaves_added,
            success: true,
        });
        debug!(
            slot = slot_idx,
            root = %self.root,
            leaves_added = self.leaves_added,
            leaf_count = self.leaf_count,
            "extension request completed"
        );
        self.state = SlotState::Completed;
    }

    // ── Sub-request protocol ────────────────────────────────────────────────

    /// The sub-request this slot needs serviced, if it is parked pending one.
    pub(crate) fn sub_request(&self, slot_idx: usize) -> Option<SubRequest> {
        let request = self.request.as_ref()?;
        match self.state {
            SlotState::ReadRootPending | SlotState::ReadInnerPending => {
                Some(SubRequest::BlockIo {
                    op: BlockIoOp::Read,
                    addr: self.io_addr,
                    slot: slot_idx,
                    payload: None,
                })
            }
            SlotState::WriteInnerPending | SlotState::WriteRootPending => {
                Some(SubRequest::BlockIo {
                    op: BlockIoOp::Write,
                    addr: self.io_addr,
                    slot: slot_idx,
                    payload: Some(Box::new(self.scratch)),
                })
            }
            SlotState::AllocPending => Some(SubRequest::Alloc {
                meta: request.meta,
                curr_gen: request.curr_gen,
                old_addr: self.old_addrs[self.alloc_level as usize],
                slot: slot_idx,
            }),
            SlotState::Submitted
            | SlotState::ReadRootInProgress
            | SlotState::ReadRootCompleted
            | SlotState::ReadInnerInProgress
            | SlotState::ReadInnerCompleted
            | SlotState::AllocInProgress
            | SlotState::AllocCompleted
            | SlotState::WriteInnerInProgress
            | SlotState::WriteInnerCompleted
            | SlotState::WriteRootInProgress
            | SlotState::WriteRootCompleted
            | SlotState::Completed
            | SlotState::Failed => None,
        }
    }

    /// The host took the pending sub-request; park until its result arrives.
    pub(crate) fn take_sub_request(&mut self) -> Result<(), OfsError> {
        self.state = match self.state {
            SlotState::ReadRootPending => SlotState::ReadRootInProgress,
            SlotState::ReadInnerPending => SlotState::ReadInnerInProgress,
            SlotState::AllocPending => SlotState::AllocInProgress,
            SlotState::WriteInnerPending => SlotState::WriteInnerInProgress,
            SlotState::WriteRootPending => SlotState::WriteRootInProgress,
            _ => return Err(OfsError::InvalidCall("slot has no pending sub-request")),
        };
        Ok(())
    }

    /// Feed a block-I/O result back. Read data is retained raw for hash
    /// verification and decoded into the per-level block for the current
    /// walk level (the leaf block iff level 1).
    pub(crate) fn deliver_block_io(
        &mut self,
        slot_idx: usize,
        success: bool,
        data: Option<&[u8; BLOCK_SIZE]>,
    ) -> Result<(), OfsError> {
        match self.state {
            SlotState::ReadRootInProgress | SlotState::ReadInnerInProgress => {
                self.sub_ok = success;
                if success {
                    let Some(data) = data else {
                        return Err(OfsError::InvalidCall(
                            "successful read delivered without block data",
                        ));
                    };
                    self.scratch = *data;
                    let decoded = if self.level > 1 {
                        InnerNodeBlock::parse(data)
                            .map(|block| self.inner[self.level as usize] = block)
                    } else {
                        LeafNodeBlock::parse(data).map(|block| self.leaves = block)
                    };
                    if let Err(parse) = decoded {
                        self.fail(slot_idx, OfsError::Parse(parse.to_string()));
                        return Ok(());
                    }
                }
                self.state = if self.state == SlotState::ReadRootInProgress {
                    SlotState::ReadRootCompleted
                } else {
                    SlotState::ReadInnerCompleted
                };
                Ok(())
            }
            SlotState::WriteInnerInProgress => {
                self.sub_ok = success;
                self.state = SlotState::WriteInnerCompleted;
                Ok(())
            }
            SlotState::WriteRootInProgress => {
                self.sub_ok = success;
                self.state = SlotState::WriteRootCompleted;
                Ok(())
            }
            _ => Err(OfsError::InvalidCall(
                "block-io result delivered to a slot not awaiting one",
            )),
        }
    }

    /// Feed an allocation-tracker result back.
    pub(crate) fn deliver_alloc(
        &mut self,
        success: bool,
        new_addr: BlockAddress,
    ) -> Result<(), OfsError> {
        if self.state != SlotState::AllocInProgress {
            return Err(OfsError::InvalidCall(
                "allocator result delivered to a slot not awaiting one",
            ));
        }
        self.sub_ok = success;
        if success {
            self.new_addrs[self.alloc_level as usize] = new_addr;
        }
        self.state = SlotState::AllocCompleted;
        Ok(())
    }
}
