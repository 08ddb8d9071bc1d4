//! Block descriptors. The lifecycle state, I/O fix, flush type, old flag
//! and buffer-fix count share one atomic word so transitions that span
//! sub-fields (evict gating against concurrent fixes, above all) are a
//! single compare-and-swap.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::primitives::sync::{WaitMutex, WaitRwLock};
use crate::types::{Lsn, PageId};

/// In-memory image of a file page.
pub type Frame = Box<[u8]>;

/// Lifecycle states of a block descriptor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageState {
    /// Watch sentinel; lives in the page hash only.
    PoolWatch,
    /// Clean compressed-only page.
    ZipPage,
    /// Dirty compressed-only page; on the flush list.
    ZipDirty,
    /// On the free list.
    NotUsed,
    /// Claimed from the free list, not yet assigned.
    ReadyForUse,
    /// Holds a file page.
    FilePage,
    /// Holds a plain memory buffer.
    Memory,
    /// Transient while a recycled block leaves the page hash.
    RemoveHash,
}

impl PageState {
    fn from_bits(bits: u32) -> PageState {
        match bits {
            0 => PageState::PoolWatch,
            1 => PageState::ZipPage,
            2 => PageState::ZipDirty,
            3 => PageState::NotUsed,
            4 => PageState::ReadyForUse,
            5 => PageState::FilePage,
            6 => PageState::Memory,
            _ => PageState::RemoveHash,
        }
    }

    fn to_bits(self) -> u32 {
        match self {
            PageState::PoolWatch => 0,
            PageState::ZipPage => 1,
            PageState::ZipDirty => 2,
            PageState::NotUsed => 3,
            PageState::ReadyForUse => 4,
            PageState::FilePage => 5,
            PageState::Memory => 6,
            PageState::RemoveHash => 7,
        }
    }

    /// Whether the descriptor maps a file page and belongs in the page hash.
    pub fn is_in_file(self) -> bool {
        matches!(
            self,
            PageState::FilePage | PageState::ZipPage | PageState::ZipDirty
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoFix {
    None,
    Read,
    Write,
    /// Pinned against relocation without an I/O in flight.
    Pin,
}

impl IoFix {
    fn from_bits(bits: u32) -> IoFix {
        match bits {
            0 => IoFix::None,
            1 => IoFix::Read,
            2 => IoFix::Write,
            _ => IoFix::Pin,
        }
    }

    fn to_bits(self) -> u32 {
        match self {
            IoFix::None => 0,
            IoFix::Read => 1,
            IoFix::Write => 2,
            IoFix::Pin => 3,
        }
    }
}

/// Which flusher a write belongs to; selects the pending counter and the
/// no-flush event that signals completion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushType {
    Lru,
    List,
    SinglePage,
}

pub const FLUSH_TYPES: usize = 3;

impl FlushType {
    pub fn index(self) -> usize {
        match self {
            FlushType::Lru => 0,
            FlushType::List => 1,
            FlushType::SinglePage => 2,
        }
    }

    fn from_bits(bits: u32) -> FlushType {
        match bits {
            0 => FlushType::Lru,
            1 => FlushType::List,
            _ => FlushType::SinglePage,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlushType::Lru => "lru",
            FlushType::List => "list",
            FlushType::SinglePage => "single_page",
        }
    }
}

// Word layout: state 0..3 | io_fix 3..5 | flush_type 5..7 | old 7 | fix 8..32
const STATE_MASK: u32 = 0b111;
const IO_SHIFT: u32 = 3;
const IO_MASK: u32 = 0b11 << IO_SHIFT;
const FLUSH_SHIFT: u32 = 5;
const FLUSH_MASK: u32 = 0b11 << FLUSH_SHIFT;
const OLD_BIT: u32 = 1 << 7;
const FIX_SHIFT: u32 = 8;
const FIX_ONE: u32 = 1 << FIX_SHIFT;

/// Maximum simultaneous buffer-fixes of one block.
pub const MAX_BUF_FIX: u32 = (1 << 24) - 1;

const FREED_PAGE_CLOCK_MASK: u32 = 0x7FFF_FFFF;

/// Sentinel in the packed page-id word: no identity assigned.
const NO_ID: u64 = u64::MAX;

#[derive(Clone, Copy, Debug)]
pub(crate) struct StateSnapshot {
    pub state: PageState,
    pub io_fix: IoFix,
    pub flush_type: FlushType,
    pub old: bool,
    pub fix_count: u32,
}

impl StateSnapshot {
    fn from_word(word: u32) -> Self {
        Self {
            state: PageState::from_bits(word & STATE_MASK),
            io_fix: IoFix::from_bits((word & IO_MASK) >> IO_SHIFT),
            flush_type: FlushType::from_bits((word & FLUSH_MASK) >> FLUSH_SHIFT),
            old: word & OLD_BIT != 0,
            fix_count: word >> FIX_SHIFT,
        }
    }
}

/// Extra descriptor state behind the block mutex: rarely touched, never on
/// hot read paths.
#[derive(Debug, Default)]
pub struct BlockMeta {
    /// Compressed copy in the instance's buddy arena, if any.
    pub zip: Option<ZipHandle>,
    /// On-disk image did not decrypt cleanly yet.
    pub encrypted: bool,
}

/// A compressed frame in the buddy arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZipHandle {
    pub offset: u32,
    pub size: u32,
}

/// A page descriptor. Frames are fixed at pool init; descriptors are
/// recycled through the state machine, never reallocated.
pub struct Block {
    pub(crate) index: u32,
    pub(crate) instance_no: u32,
    id: AtomicU64,
    word: AtomicU32,
    oldest_modification: AtomicU64,
    newest_modification: AtomicU64,
    modify_clock: AtomicU64,
    freed_page_clock: AtomicU32,
    /// Milliseconds since pool start of the first access; 0 = never.
    access_time: AtomicU64,
    pub(crate) meta: WaitMutex<BlockMeta>,
    /// Latch over the frame contents.
    pub(crate) latch: Arc<WaitRwLock<Frame>>,
}

impl Block {
    pub(crate) fn new(index: u32, instance_no: u32, state: PageState, frame_len: usize) -> Self {
        let frame: Frame = vec![0u8; frame_len].into_boxed_slice();
        Self {
            index,
            instance_no,
            id: AtomicU64::new(NO_ID),
            word: AtomicU32::new(state.to_bits()),
            oldest_modification: AtomicU64::new(0),
            newest_modification: AtomicU64::new(0),
            modify_clock: AtomicU64::new(0),
            freed_page_clock: AtomicU32::new(0),
            access_time: AtomicU64::new(0),
            meta: WaitMutex::new("block_mutex", BlockMeta::default()),
            latch: Arc::new(WaitRwLock::new("block_latch", frame)),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn instance_no(&self) -> u32 {
        self.instance_no
    }

    pub fn page_id(&self) -> Option<PageId> {
        let packed = self.id.load(Ordering::Acquire);
        if packed == NO_ID {
            None
        } else {
            Some(PageId::new((packed >> 32) as u32, packed as u32))
        }
    }

    pub(crate) fn set_page_id(&self, id: Option<PageId>) {
        let packed = match id {
            Some(id) => ((id.space as u64) << 32) | id.page_no as u64,
            None => NO_ID,
        };
        self.id.store(packed, Ordering::Release);
    }

    pub(crate) fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::from_word(self.word.load(Ordering::Acquire))
    }

    pub fn state(&self) -> PageState {
        self.snapshot().state
    }

    pub fn io_fix(&self) -> IoFix {
        self.snapshot().io_fix
    }

    pub fn flush_type(&self) -> FlushType {
        self.snapshot().flush_type
    }

    pub fn is_old(&self) -> bool {
        self.snapshot().old
    }

    pub fn fix_count(&self) -> u32 {
        self.snapshot().fix_count
    }

    fn update_word(&self, f: impl Fn(u32) -> u32) -> u32 {
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            let next = f(word);
            match self
                .word
                .compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => word = actual,
            }
        }
    }

    pub(crate) fn set_state(&self, state: PageState) {
        self.update_word(|w| (w & !STATE_MASK) | state.to_bits());
    }

    pub(crate) fn set_io_fix(&self, io: IoFix) {
        self.update_word(|w| (w & !IO_MASK) | (io.to_bits() << IO_SHIFT));
    }

    /// Claims the write I/O fix if no I/O is in flight. Flushers from
    /// different batches race through here without sharing a latch.
    pub(crate) fn try_set_io_write(&self) -> bool {
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            if (word & IO_MASK) >> IO_SHIFT != IoFix::None.to_bits() {
                return false;
            }
            let next = word | (IoFix::Write.to_bits() << IO_SHIFT);
            match self
                .word
                .compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => word = actual,
            }
        }
    }

    pub(crate) fn set_flush_type(&self, flush: FlushType) {
        self.update_word(|w| (w & !FLUSH_MASK) | ((flush.index() as u32) << FLUSH_SHIFT));
    }

    pub(crate) fn set_old(&self, old: bool) {
        self.update_word(|w| if old { w | OLD_BIT } else { w & !OLD_BIT });
    }

    /// Unconditional buffer-fix; the caller must know the block cannot be
    /// recycled (it holds the page-hash stripe and just found the block).
    pub(crate) fn fix(&self) -> u32 {
        let word = self.update_word(|w| w + FIX_ONE);
        word >> FIX_SHIFT
    }

    /// Buffer-fix only while the block still maps a file page; fails if the
    /// descriptor is being recycled.
    pub(crate) fn fix_if_in_file(&self) -> bool {
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            if !PageState::from_bits(word & STATE_MASK).is_in_file() {
                return false;
            }
            debug_assert!(word >> FIX_SHIFT < MAX_BUF_FIX);
            match self.word.compare_exchange_weak(
                word,
                word + FIX_ONE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => word = actual,
            }
        }
    }

    pub(crate) fn unfix(&self) -> u32 {
        let word = self.update_word(|w| {
            debug_assert!(w >> FIX_SHIFT > 0);
            w - FIX_ONE
        });
        word >> FIX_SHIFT
    }

    /// Gate for eviction and relocation: atomically moves an unfixed,
    /// un-I/O-fixed file page to `RemoveHash`. Once there, `fix_if_in_file`
    /// fails, so the caller owns the descriptor. Plain eviction re-checks
    /// dirtiness after winning and reverts with `set_state` if it lost that
    /// race.
    pub(crate) fn try_begin_remove(&self, from: PageState) -> bool {
        debug_assert!(from.is_in_file());
        let mut word = self.word.load(Ordering::Acquire);
        loop {
            let snap = StateSnapshot::from_word(word);
            if snap.state != from || snap.io_fix != IoFix::None || snap.fix_count != 0 {
                return false;
            }
            let next = (word & !STATE_MASK) | PageState::RemoveHash.to_bits();
            match self
                .word
                .compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => word = actual,
            }
        }
    }

    pub fn oldest_modification(&self) -> Lsn {
        Lsn(self.oldest_modification.load(Ordering::Acquire))
    }

    pub(crate) fn set_oldest_modification(&self, lsn: Lsn) {
        self.oldest_modification.store(lsn.0, Ordering::Release);
    }

    pub fn newest_modification(&self) -> Lsn {
        Lsn(self.newest_modification.load(Ordering::Acquire))
    }

    pub(crate) fn set_newest_modification(&self, lsn: Lsn) {
        self.newest_modification.store(lsn.0, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        !self.oldest_modification().is_zero()
    }

    /// Optimistic readers snapshot this and re-check it under the latch.
    pub fn modify_clock(&self) -> u64 {
        self.modify_clock.load(Ordering::Acquire)
    }

    /// Caller holds the exclusive latch.
    pub(crate) fn modify_clock_inc(&self) {
        self.modify_clock.fetch_add(1, Ordering::AcqRel);
    }

    pub fn freed_page_clock(&self) -> u32 {
        self.freed_page_clock.load(Ordering::Relaxed) & FREED_PAGE_CLOCK_MASK
    }

    pub(crate) fn set_freed_page_clock(&self, clock: u32) {
        self.freed_page_clock
            .store(clock & FREED_PAGE_CLOCK_MASK, Ordering::Relaxed);
    }

    pub fn access_time(&self) -> u64 {
        self.access_time.load(Ordering::Relaxed)
    }

    pub(crate) fn set_access_time(&self, at_ms: u64) {
        self.access_time.store(at_ms, Ordering::Relaxed);
    }

    /// Clears identity and modification state when the descriptor returns
    /// to the free list. The modify clock survives recycling so stale
    /// optimistic handles keep failing.
    pub(crate) fn reset_for_free(&self) {
        self.set_page_id(None);
        self.oldest_modification.store(0, Ordering::Release);
        self.newest_modification.store(0, Ordering::Release);
        self.access_time.store(0, Ordering::Relaxed);
        self.modify_clock.fetch_add(1, Ordering::AcqRel);
        self.update_word(|w| {
            let keep = w & FLUSH_MASK;
            (w & !(STATE_MASK | IO_MASK | OLD_BIT | FLUSH_MASK))
                | keep
                | PageState::NotUsed.to_bits()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Block {
        Block::new(0, 0, PageState::NotUsed, 512)
    }

    #[test]
    fn packed_word_fields_are_independent() {
        let b = block();
        assert_eq!(b.state(), PageState::NotUsed);
        b.set_state(PageState::ReadyForUse);
        b.set_io_fix(IoFix::Read);
        b.set_flush_type(FlushType::SinglePage);
        b.set_old(true);
        assert_eq!(b.state(), PageState::ReadyForUse);
        assert_eq!(b.io_fix(), IoFix::Read);
        assert_eq!(b.flush_type(), FlushType::SinglePage);
        assert!(b.is_old());

        b.set_io_fix(IoFix::None);
        assert_eq!(b.state(), PageState::ReadyForUse);
        assert!(b.is_old());
    }

    #[test]
    fn fix_count_rides_in_the_same_word() {
        let b = block();
        b.set_state(PageState::FilePage);
        assert_eq!(b.fix(), 1);
        assert!(b.fix_if_in_file());
        assert_eq!(b.fix_count(), 2);
        assert_eq!(b.unfix(), 1);
        assert_eq!(b.unfix(), 0);
    }

    #[test]
    fn fix_if_in_file_rejects_recycled_states() {
        let b = block();
        for state in [
            PageState::NotUsed,
            PageState::ReadyForUse,
            PageState::Memory,
            PageState::RemoveHash,
            PageState::PoolWatch,
        ] {
            b.set_state(state);
            assert!(!b.fix_if_in_file(), "{state:?}");
        }
        for state in [PageState::FilePage, PageState::ZipPage, PageState::ZipDirty] {
            b.set_state(state);
            assert!(b.fix_if_in_file(), "{state:?}");
            b.unfix();
        }
    }

    #[test]
    fn remove_gate_requires_quiescence() {
        let b = block();
        b.set_state(PageState::FilePage);

        b.fix();
        assert!(!b.try_begin_remove(PageState::FilePage));
        b.unfix();

        b.set_io_fix(IoFix::Write);
        assert!(!b.try_begin_remove(PageState::FilePage));
        b.set_io_fix(IoFix::None);

        assert!(b.try_begin_remove(PageState::FilePage));
        assert_eq!(b.state(), PageState::RemoveHash);
        // Recycled: fixes must fail now.
        assert!(!b.fix_if_in_file());
    }

    #[test]
    fn reset_for_free_clears_identity_and_bumps_modify_clock() {
        let b = block();
        b.set_state(PageState::FilePage);
        b.set_page_id(Some(PageId::new(2, 9)));
        b.set_oldest_modification(Lsn(10));
        b.set_newest_modification(Lsn(11));
        b.set_access_time(123);
        b.set_old(true);
        let clock = b.modify_clock();

        b.reset_for_free();
        assert_eq!(b.state(), PageState::NotUsed);
        assert_eq!(b.page_id(), None);
        assert!(!b.is_dirty());
        assert_eq!(b.access_time(), 0);
        assert!(!b.is_old());
        assert!(b.modify_clock() > clock);
    }

    #[test]
    fn freed_page_clock_is_masked_to_31_bits() {
        let b = block();
        b.set_freed_page_clock(u32::MAX);
        assert_eq!(b.freed_page_clock(), 0x7FFF_FFFF);
    }
}
