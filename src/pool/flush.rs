//! Flush subsystem: the LSN-ordered flush list, the three flush types with
//! their pending counters and no-flush events, batches driven through the
//! flush hazard pointer, and write I/O completion.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{BrasaError, Result};
use crate::pool::block::{Block, FlushType, IoFix, PageState};
use crate::pool::instance::{BufferPool, FlushInner};
use crate::pool::PoolStat;
use crate::types::{checksum, page, Lsn};

impl BufferPool {
    // -----------------------------------------------------------------
    // Flush-list maintenance
    // -----------------------------------------------------------------

    /// Records a modification at mini-transaction commit: the newest LSN
    /// advances, and a first modification chains the block on the flush
    /// list. Normal-running inserts go at the head (largest oldest LSN);
    /// recovery inserts out of order through the ordered mirror.
    pub(crate) fn flush_note_modification(&self, block: &Arc<Block>, lsn: Lsn) {
        debug_assert!(!lsn.is_zero());
        let mut flush = self.flush_state.lock(&self.sync);
        if block.newest_modification() < lsn {
            block.set_newest_modification(lsn);
        }
        if !block.oldest_modification().is_zero() {
            return;
        }
        block.set_oldest_modification(lsn);
        if block.state() == PageState::ZipPage {
            block.set_state(PageState::ZipDirty);
        }
        let idx = block.index;
        match &mut flush.rbt {
            Some(rbt) => {
                rbt.insert((lsn.0, idx), ());
                let below = rbt
                    .range(..(lsn.0, idx))
                    .next_back()
                    .map(|(&(_, i), _)| i);
                let FlushInner { list, links, .. } = &mut *flush;
                match below {
                    Some(anchor) => list.insert_before(links, anchor, idx),
                    None => list.push_back(links, idx),
                }
            }
            None => {
                // Commits are not serialized by a log mutex here, so
                // near-simultaneous inserts can arrive slightly out of
                // order; walk from the head (largest LSN) to the ordered
                // position. The common case inserts at the head.
                let mut anchor = flush.list.head();
                while let Some(h) = anchor {
                    if self.block(h).oldest_modification() <= lsn {
                        break;
                    }
                    anchor = flush.list.next(&flush.links, h);
                }
                let FlushInner { list, links, .. } = &mut *flush;
                match anchor {
                    Some(a) => list.insert_before(links, a, idx),
                    None => list.push_back(links, idx),
                }
            }
        }
    }

    /// Detaches a block from the flush list; the caller clears
    /// `oldest_modification` afterwards. The hazard pointer advances past
    /// the removed block.
    pub(crate) fn flush_list_remove(&self, flush: &mut FlushInner, idx: u32) {
        let scan_next = flush.list.prev(&flush.links, idx);
        flush.hp.adjust(idx, scan_next);
        if let Some(rbt) = &mut flush.rbt {
            let lsn = self.block(idx).oldest_modification().0;
            rbt.remove(&(lsn, idx));
        }
        let FlushInner { list, links, .. } = &mut *flush;
        list.remove(links, idx);
    }

    /// Swaps a relocated descriptor into its predecessor's flush-list
    /// position, keeping LSN order and the ordered mirror intact.
    pub(crate) fn flush_relocate(&self, old_idx: u32, new_idx: u32) {
        let mut flush = self.flush_state.lock(&self.sync);
        debug_assert!(flush.list.contains(&flush.links, old_idx));
        {
            let FlushInner { list, links, .. } = &mut *flush;
            list.insert_before(links, old_idx, new_idx);
        }
        flush.hp.adjust(old_idx, Some(new_idx));
        if let Some(rbt) = &mut flush.rbt {
            let lsn = self.block(new_idx).oldest_modification().0;
            rbt.remove(&(lsn, old_idx));
            rbt.insert((lsn, new_idx), ());
        }
        let FlushInner { list, links, .. } = &mut *flush;
        list.remove(links, old_idx);
    }

    /// Keeps the ordered mirror of the flush list only while recovery may
    /// insert with out-of-order LSNs; dropped afterwards.
    pub fn set_recovery_mode(&self, on: bool) {
        let mut flush = self.flush_state.lock(&self.sync);
        if on {
            let mut rbt = BTreeMap::new();
            for idx in flush.list.iter(&flush.links) {
                rbt.insert((self.block(idx).oldest_modification().0, idx), ());
            }
            flush.rbt = Some(rbt);
        } else {
            flush.rbt = None;
        }
    }

    // -----------------------------------------------------------------
    // Pending-write bookkeeping
    // -----------------------------------------------------------------

    pub(crate) fn inc_n_flush(&self, flush_type: FlushType) {
        if self.n_flush[flush_type.index()].fetch_add(1, Ordering::AcqRel) == 0 {
            self.no_flush[flush_type.index()].reset();
        }
    }

    pub(crate) fn dec_n_flush(&self, flush_type: FlushType) {
        if self.n_flush[flush_type.index()].fetch_sub(1, Ordering::AcqRel) == 1 {
            self.no_flush[flush_type.index()].set();
        }
    }

    pub fn n_flush_pending(&self, flush_type: FlushType) -> usize {
        self.n_flush[flush_type.index()].load(Ordering::Acquire)
    }

    /// Blocks until no write of the given type is pending.
    pub fn wait_for_no_flush(&self, flush_type: FlushType) {
        let event = &self.no_flush[flush_type.index()];
        loop {
            let signal_count = event.reset();
            if self.n_flush[flush_type.index()].load(Ordering::Acquire) == 0 {
                event.set();
                return;
            }
            event.wait_low(signal_count);
        }
    }

    // -----------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------

    fn ready_for_flush(&self, block: &Arc<Block>, flush_type: FlushType) -> bool {
        if block.io_fix() != IoFix::None || !block.is_dirty() {
            return false;
        }
        flush_type != FlushType::Lru || block.fix_count() == 0
    }

    /// Walks the flush list from its tail (smallest oldest-modification)
    /// and writes out candidates below `limit_lsn`, at most `max_pages`.
    /// The flush-list latch is dropped around each I/O; the hazard pointer
    /// keeps the scan position valid across the gap. Returns the number of
    /// pages written; zero when a batch of this type is already running.
    pub fn flush_batch(
        self: &Arc<Self>,
        flush_type: FlushType,
        limit_lsn: Option<Lsn>,
        max_pages: usize,
    ) -> Result<usize> {
        debug_assert!(flush_type != FlushType::SinglePage);
        let slot = flush_type.index();
        if self.init_flush[slot]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(0);
        }
        let result = self.flush_batch_inner(flush_type, limit_lsn, max_pages);
        {
            let mut flush = self.flush_state.lock(&self.sync);
            flush.hp.set(None);
        }
        self.init_flush[slot].store(false, Ordering::Release);
        if self.n_flush[slot].load(Ordering::Acquire) == 0 {
            self.no_flush[slot].set();
        }
        if let Ok(n) = &result {
            if *n > 0 {
                self.try_lru_scan.store(true, Ordering::Relaxed);
                debug!(
                    instance = self.instance_no,
                    flush_type = flush_type.as_str(),
                    pages = n,
                    "flush batch done"
                );
            }
        }
        result
    }

    fn flush_batch_inner(
        self: &Arc<Self>,
        flush_type: FlushType,
        limit_lsn: Option<Lsn>,
        max_pages: usize,
    ) -> Result<usize> {
        let mut flushed = 0usize;
        while flushed < max_pages {
            let candidate = {
                let mut flush = self.flush_state.lock(&self.sync);
                let mut cursor = match flush.hp.get() {
                    Some(idx) if flush.list.contains(&flush.links, idx) => Some(idx),
                    _ => flush.list.tail(),
                };
                loop {
                    let Some(idx) = cursor else { break None };
                    let block = self.block(idx);
                    if let Some(limit) = limit_lsn {
                        if block.oldest_modification() >= limit {
                            break None;
                        }
                    }
                    let next = flush.list.prev(&flush.links, idx);
                    flush.hp.set(next);
                    if self.ready_for_flush(block, flush_type) && block.try_set_io_write() {
                        block.set_flush_type(flush_type);
                        self.inc_n_flush(flush_type);
                        break Some(idx);
                    }
                    cursor = next;
                }
            };
            let Some(idx) = candidate else { break };
            self.write_flush_page(idx, flush_type, flush_type == FlushType::Lru)?;
            flushed += 1;
        }
        Ok(flushed)
    }

    // -----------------------------------------------------------------
    // The write itself
    // -----------------------------------------------------------------

    /// Writes one page whose write I/O fix the caller has claimed. Holds
    /// the shared frame latch across the I/O, stages the image through a
    /// scratch slot (stamping LSN and checksum, applying the space's
    /// transform), completes the flush-list bookkeeping, and optionally
    /// evicts the then-clean block.
    pub(crate) fn write_flush_page(
        self: &Arc<Self>,
        idx: u32,
        flush_type: FlushType,
        evict: bool,
    ) -> Result<()> {
        let block = Arc::clone(self.block(idx));
        debug_assert_eq!(block.io_fix(), IoFix::Write);
        let id = match block.page_id() {
            Some(id) => id,
            None => {
                block.set_io_fix(IoFix::None);
                self.dec_n_flush(flush_type);
                return Err(BrasaError::Corruption("flush candidate lost its identity"));
            }
        };
        let space = match self.spaces.get(id.space) {
            Ok(space) => space,
            Err(_) => {
                // The tablespace is gone; the modification is moot.
                self.discard_flush_page(&block, idx, flush_type);
                return Ok(());
            }
        };

        let guard = block.latch.read_arc(&self.sync);
        let newest = block.newest_modification();
        let physical = space.physical_page_size();
        let io_result = (|| -> Result<()> {
            let slot = self.tmp.acquire();
            if block.state() == PageState::ZipDirty {
                let mut page_buf = slot.page_buf();
                self.zip_copy_into(&block, &mut page_buf[..physical])?;
                space.write_page(id.page_no, &page_buf[..physical])?;
                return Ok(());
            }
            let mut page_buf = slot.page_buf();
            page_buf.copy_from_slice(&guard[..]);
            page::set_page_lsn(&mut page_buf, newest);
            if space.zip_size() != 0 {
                let codec = space
                    .transform()
                    .ok_or(BrasaError::Corruption("compression codec missing"))?;
                let mut out = slot.out_buf();
                codec.compress(id, &page_buf[..], &mut out[..physical])?;
                page::set_page_lsn(&mut out[..physical], newest);
                checksum::stamp(&mut out[..physical], self.options.checksum);
                if let Some(handle) = block.meta.lock(&self.sync).zip {
                    self.zip.lock(&self.sync).write(handle, &out[..physical]);
                }
                space.write_page(id.page_no, &out[..physical])?;
            } else if let Some(codec) = space.transform() {
                let mut out = slot.out_buf();
                codec.before_write(id, &page_buf[..], &mut out[..])?;
                checksum::stamp(&mut out[..], self.options.checksum);
                space.write_page(id.page_no, &out[..])?;
            } else {
                checksum::stamp(&mut page_buf, self.options.checksum);
                space.write_page(id.page_no, &page_buf[..])?;
            }
            Ok(())
        })();

        match io_result {
            Ok(()) => {
                self.complete_write(&block, idx, flush_type);
                drop(guard);
                if evict {
                    let mut inner = self.state.lock(&self.sync);
                    self.evict_block(&mut inner, idx);
                }
                Ok(())
            }
            Err(err) => {
                // The page stays dirty and listed; a later batch retries.
                warn!(page = %id, error = %err, "page write failed");
                block.set_io_fix(IoFix::None);
                self.dec_n_flush(flush_type);
                drop(guard);
                Err(err)
            }
        }
    }

    /// Completion path of a successful write: off the flush list, clean,
    /// and the no-flush event set when the last pending write finishes.
    fn complete_write(&self, block: &Arc<Block>, idx: u32, flush_type: FlushType) {
        {
            let mut flush = self.flush_state.lock(&self.sync);
            self.flush_list_remove(&mut flush, idx);
        }
        block.set_oldest_modification(Lsn::ZERO);
        if block.state() == PageState::ZipDirty {
            block.set_state(PageState::ZipPage);
        }
        block.set_io_fix(IoFix::None);
        PoolStat::bump(&self.stat.n_pages_written);
        self.dec_n_flush(flush_type);
    }

    /// A dirty page of a dropped tablespace: forget the modification and
    /// evict.
    fn discard_flush_page(&self, block: &Arc<Block>, idx: u32, flush_type: FlushType) {
        debug!(page = ?block.page_id(), "discarding dirty page of dropped tablespace");
        {
            let mut flush = self.flush_state.lock(&self.sync);
            self.flush_list_remove(&mut flush, idx);
        }
        block.set_oldest_modification(Lsn::ZERO);
        if block.state() == PageState::ZipDirty {
            block.set_state(PageState::ZipPage);
        }
        block.set_io_fix(IoFix::None);
        self.dec_n_flush(flush_type);
        let mut inner = self.state.lock(&self.sync);
        self.evict_block(&mut inner, idx);
    }
}
