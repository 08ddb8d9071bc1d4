#![forbid(unsafe_code)]

//! Mini-transactions: the latch-and-fix capability the access layer hands
//! to page operations. Latches and buffer-fixes accumulate in the memo and
//! are released together, in reverse order of acquisition, at commit;
//! commit also records the newest-modification LSN of every dirtied page
//! and chains it on its instance's flush list.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::pool::block::{Block, Frame};
use crate::pool::BufferPool;
use crate::primitives::sync::{ArcRwReadGuard, ArcRwWriteGuard};
use crate::types::Lsn;

pub(crate) enum HeldLatch {
    None,
    S(ArcRwReadGuard<Frame>),
    X(ArcRwWriteGuard<Frame>),
}

/// Index of a page in a mini-transaction's memo.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageHandle(pub(crate) usize);

struct MtrSlot {
    pool: Arc<BufferPool>,
    block: Arc<Block>,
    latch: HeldLatch,
    modified: bool,
    released: bool,
}

pub struct MiniTxn {
    slots: SmallVec<[MtrSlot; 8]>,
}

impl MiniTxn {
    pub fn new() -> Self {
        Self {
            slots: SmallVec::new(),
        }
    }

    pub(crate) fn memo_push(
        &mut self,
        pool: Arc<BufferPool>,
        block: Arc<Block>,
        latch: HeldLatch,
    ) -> PageHandle {
        self.slots.push(MtrSlot {
            pool,
            block,
            latch,
            modified: false,
            released: false,
        });
        PageHandle(self.slots.len() - 1)
    }

    pub fn n_pages(&self) -> usize {
        self.slots.iter().filter(|s| !s.released).count()
    }

    pub fn block(&self, handle: PageHandle) -> &Arc<Block> {
        &self.slots[handle.0].block
    }

    /// Page bytes under the latch taken at `get` time.
    pub fn frame(&self, handle: PageHandle) -> &[u8] {
        match &self.slots[handle.0].latch {
            HeldLatch::S(guard) => guard,
            HeldLatch::X(guard) => guard,
            HeldLatch::None => panic!("page was fixed with no latch"),
        }
    }

    /// Mutable page bytes; requires the exclusive latch. The first mutation
    /// through a slot advances the block's modify clock, failing any
    /// outstanding optimistic handles.
    pub fn frame_mut(&mut self, handle: PageHandle) -> &mut [u8] {
        let slot = &mut self.slots[handle.0];
        match &mut slot.latch {
            HeldLatch::X(guard) => {
                if !slot.modified {
                    slot.modified = true;
                    slot.block.modify_clock_inc();
                }
                &mut guard[..]
            }
            _ => panic!("page modification requires the exclusive latch"),
        }
    }

    /// Marks a page dirty without going through `frame_mut`.
    pub fn set_modified(&mut self, handle: PageHandle) {
        let slot = &mut self.slots[handle.0];
        debug_assert!(matches!(slot.latch, HeldLatch::X(_)));
        if !slot.modified {
            slot.modified = true;
            slot.block.modify_clock_inc();
        }
    }

    /// Early release of a single page: latch dropped, then the fix.
    pub fn release(&mut self, handle: PageHandle) {
        let slot = &mut self.slots[handle.0];
        if slot.released {
            return;
        }
        debug_assert!(!slot.modified, "modified pages are released at commit");
        slot.latch = HeldLatch::None;
        slot.block.unfix();
        slot.released = true;
    }

    /// Commits the mini-transaction: dirtied pages get `lsn` as their
    /// newest modification and enter the flush list, then every latch and
    /// fix is dropped in reverse order.
    pub fn commit(mut self, lsn: Lsn) {
        for i in (0..self.slots.len()).rev() {
            let slot = &mut self.slots[i];
            if slot.released {
                continue;
            }
            if slot.modified {
                slot.pool.flush_note_modification(&slot.block, lsn);
            }
            slot.latch = HeldLatch::None;
            slot.block.unfix();
            slot.released = true;
        }
    }
}

impl Default for MiniTxn {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MiniTxn {
    fn drop(&mut self) {
        for i in (0..self.slots.len()).rev() {
            let slot = &mut self.slots[i];
            if slot.released {
                continue;
            }
            debug_assert!(
                !slot.modified,
                "mini-transaction dropped with uncommitted modifications"
            );
            slot.latch = HeldLatch::None;
            slot.block.unfix();
            slot.released = true;
        }
    }
}
