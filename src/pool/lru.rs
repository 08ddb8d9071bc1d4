//! LRU engine: midpoint insertion, young/old boundary maintenance, the
//! unzip-LRU, and eviction. Every list motion here happens under the
//! instance latch.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{BrasaError, Result};
use crate::pool::block::{Block, FlushType, PageState};
use crate::pool::instance::{BufferPool, PoolInner};
use crate::pool::{PoolStat, LRU_OLD_RATIO_DIV, LRU_OLD_TOLERANCE};
use crate::types::{checksum, page};

/// Attempts to find a free frame before the caller falls back to flushing.
const FREE_SEARCH_ITERATIONS: usize = 20;

impl BufferPool {
    // -----------------------------------------------------------------
    // Insertion and the old-region boundary
    // -----------------------------------------------------------------

    /// Adds a block to the LRU. `old` selects midpoint insertion: the block
    /// enters at the old-region boundary rather than the head.
    pub(crate) fn lru_add_block(&self, inner: &mut PoolInner, idx: u32, old: bool) {
        let block = self.block(idx);
        match (old, inner.lru_old) {
            (true, Some(boundary)) => {
                {
                    let PoolInner { lru, lru_links, .. } = &mut *inner;
                    lru.insert_before(lru_links, boundary, idx);
                }
                inner.lru_old = Some(idx);
                inner.lru_old_len += 1;
                block.set_old(true);
            }
            _ => {
                {
                    let PoolInner { lru, lru_links, .. } = &mut *inner;
                    lru.push_front(lru_links, idx);
                }
                block.set_old(false);
                block.set_freed_page_clock(self.freed_page_clock_value());
            }
        }
        self.lru_old_maintain(inner);
    }

    /// Removes a block from the LRU, fixing up the boundary and advancing
    /// any hazard pointer parked on it.
    pub(crate) fn lru_remove_block(&self, inner: &mut PoolInner, idx: u32) {
        let block = self.block(idx);
        let scan_next = inner.lru.prev(&inner.lru_links, idx);
        if inner.lru_old == Some(idx) {
            match inner.lru.prev(&inner.lru_links, idx) {
                Some(prev) => {
                    inner.lru_old = Some(prev);
                    if !self.block(prev).is_old() {
                        self.block(prev).set_old(true);
                        inner.lru_old_len += 1;
                    }
                }
                None => {
                    inner.lru_old = inner.lru.next(&inner.lru_links, idx);
                }
            }
        }
        if block.is_old() {
            inner.lru_old_len = inner.lru_old_len.saturating_sub(1);
        }
        {
            let PoolInner { lru, lru_links, .. } = &mut *inner;
            lru.remove(lru_links, idx);
        }
        inner.lru_hp.adjust(idx, scan_next);
        inner.lru_scan_itr.adjust(idx, scan_next);
        inner.single_scan_itr.adjust(idx, scan_next);
        self.lru_old_maintain(inner);
    }

    /// Swaps `new_idx` into `old_idx`'s LRU position; used when a
    /// descriptor is relocated between its framed and compressed-only
    /// forms.
    pub(crate) fn lru_replace_block(&self, inner: &mut PoolInner, old_idx: u32, new_idx: u32) {
        let old_flag = self.block(old_idx).is_old();
        {
            let PoolInner { lru, lru_links, .. } = &mut *inner;
            lru.insert_before(lru_links, old_idx, new_idx);
        }
        self.block(new_idx).set_old(old_flag);
        if old_flag {
            inner.lru_old_len += 1;
        }
        if inner.lru_old == Some(old_idx) {
            inner.lru_old = Some(new_idx);
        }
        if self.block(old_idx).is_old() {
            inner.lru_old_len = inner.lru_old_len.saturating_sub(1);
        }
        {
            let PoolInner { lru, lru_links, .. } = &mut *inner;
            lru.remove(lru_links, old_idx);
        }
        inner.lru_hp.adjust(old_idx, Some(new_idx));
        inner.lru_scan_itr.adjust(old_idx, Some(new_idx));
        inner.single_scan_itr.adjust(old_idx, Some(new_idx));
    }

    fn lru_old_maintain(&self, inner: &mut PoolInner) {
        if inner.lru.len() < self.options.lru_old_min_len {
            if inner.lru_old.is_some() {
                self.lru_old_uninit(inner);
            }
            return;
        }
        if inner.lru_old.is_none() {
            self.lru_old_init(inner);
        }
        self.lru_old_adjust(inner);
    }

    /// The list just crossed the activation threshold: everything becomes
    /// old, then the boundary slides to the target ratio.
    fn lru_old_init(&self, inner: &mut PoolInner) {
        for idx in inner.lru.iter(&inner.lru_links) {
            self.block(idx).set_old(true);
        }
        inner.lru_old = inner.lru.head();
        inner.lru_old_len = inner.lru.len();
    }

    fn lru_old_uninit(&self, inner: &mut PoolInner) {
        for idx in inner.lru.iter(&inner.lru_links) {
            self.block(idx).set_old(false);
        }
        inner.lru_old = None;
        inner.lru_old_len = 0;
    }

    /// Slides the boundary so the old-region length tracks
    /// `old_blocks_pct`, within tolerance. O(movement).
    fn lru_old_adjust(&self, inner: &mut PoolInner) {
        let target = inner.lru.len() * self.options.lru_old_ratio() / LRU_OLD_RATIO_DIV;
        loop {
            let Some(boundary) = inner.lru_old else { return };
            if inner.lru_old_len + LRU_OLD_TOLERANCE < target {
                let Some(prev) = inner.lru.prev(&inner.lru_links, boundary) else {
                    return;
                };
                self.block(prev).set_old(true);
                inner.lru_old = Some(prev);
                inner.lru_old_len += 1;
            } else if inner.lru_old_len > target + LRU_OLD_TOLERANCE {
                self.block(boundary).set_old(false);
                let next = inner.lru.next(&inner.lru_links, boundary);
                inner.lru_old_len -= 1;
                inner.lru_old = next;
                if next.is_none() {
                    return;
                }
            } else {
                return;
            }
        }
    }

    // -----------------------------------------------------------------
    // Promotion
    // -----------------------------------------------------------------

    /// Moves a block to the LRU head. A no-op when the block already sits
    /// in the young region.
    pub fn make_young(&self, block: &Arc<Block>) {
        let mut inner = self.state.lock(&self.sync);
        let idx = block.index;
        if !inner.lru.contains(&inner.lru_links, idx) {
            return;
        }
        let in_young = inner.lru_old.is_some() && !block.is_old();
        if in_young || inner.lru.head() == Some(idx) {
            return;
        }
        self.lru_remove_block(&mut inner, idx);
        self.lru_add_block(&mut inner, idx, false);
        PoolStat::bump(&self.stat.n_pages_made_young);
    }

    pub(crate) fn make_young_if_needed(&self, block: &Arc<Block>) {
        if self.peek_if_too_old(block) {
            self.make_young(block);
        } else {
            PoolStat::bump(&self.stat.n_pages_not_made_young);
        }
    }

    /// Heuristic, latch-free: is the block far enough from the MRU end
    /// that it risks eviction? Before the first eviction the clock is
    /// still zero and position decides instead.
    pub fn peek_if_too_old(&self, block: &Arc<Block>) -> bool {
        let clock = self.freed_page_clock_value();
        if clock == 0 {
            return true;
        }
        let ratio = self.options.lru_old_ratio();
        let span = self.n_frames * (LRU_OLD_RATIO_DIV - ratio) / (LRU_OLD_RATIO_DIV * 4);
        (clock.wrapping_sub(block.freed_page_clock()) & 0x7FFF_FFFF) > span as u32
    }

    /// Close enough to the MRU end not to be in eviction danger.
    pub fn peek_if_young(&self, block: &Arc<Block>) -> bool {
        !self.peek_if_too_old(block)
    }

    // -----------------------------------------------------------------
    // Eviction and free-block acquisition
    // -----------------------------------------------------------------

    /// Takes a free frame, evicting from the LRU tail and driving
    /// single-page flushes when the free list runs dry.
    pub(crate) fn get_free_block(self: &Arc<Self>) -> Result<u32> {
        let mut iterations = 0usize;
        loop {
            {
                let mut inner = self.state.lock(&self.sync);
                let popped = {
                    let PoolInner {
                        free, free_links, ..
                    } = &mut *inner;
                    free.pop_front(free_links)
                };
                if let Some(idx) = popped {
                    self.block(idx).set_state(PageState::ReadyForUse);
                    return Ok(idx);
                }
                if self.try_lru_scan.load(Ordering::Relaxed) || iterations > 0 {
                    if let Some(idx) = self.scan_lru_for_free(&mut inner) {
                        return Ok(idx);
                    }
                    self.try_lru_scan.store(false, Ordering::Relaxed);
                }
            }
            if iterations >= FREE_SEARCH_ITERATIONS {
                warn!(
                    instance = self.instance_no,
                    "no free frame after repeated scans and flushes"
                );
                return Err(BrasaError::PoolExhausted);
            }
            if !self.flush_single_page()? {
                std::thread::sleep(Duration::from_millis(2));
            }
            iterations += 1;
        }
    }

    /// Scans from the LRU tail for an evictable clean block, preferring to
    /// shed decompressed copies when the unzip list has grown large.
    fn scan_lru_for_free(&self, inner: &mut PoolInner) -> Option<u32> {
        if inner.unzip.len() > inner.lru.len() / 10 {
            if let Some(idx) = self.scan_unzip_for_free(inner) {
                return Some(idx);
            }
        }
        let depth = self.options.lru_scan_depth.max(1);
        let mut cursor = {
            let PoolInner {
                lru,
                lru_links,
                lru_scan_itr,
                ..
            } = &mut *inner;
            lru_scan_itr.start(lru, lru_links)
        };
        for _ in 0..depth {
            let idx = cursor?;
            let next = inner.lru.prev(&inner.lru_links, idx);
            inner.lru_scan_itr.set(next);
            if !self.is_zip_desc_index(idx) && self.evict_block(inner, idx) {
                let popped = {
                    let PoolInner {
                        free, free_links, ..
                    } = &mut *inner;
                    free.pop_front(free_links)
                };
                let freed = popped.expect("eviction put a frame on the free list");
                self.block(freed).set_state(PageState::ReadyForUse);
                return Some(freed);
            }
            cursor = next;
        }
        None
    }

    /// Frees a frame by relocating a both-copies-resident page onto a
    /// frameless descriptor, keeping only the compressed side.
    fn scan_unzip_for_free(&self, inner: &mut PoolInner) -> Option<u32> {
        let depth = self.options.lru_scan_depth.max(1);
        let mut cursor = inner.unzip.tail();
        for _ in 0..depth {
            let idx = cursor?;
            let next = inner.unzip.prev(&inner.unzip_links, idx);
            if self.unzip_evict(inner, idx) {
                let popped = {
                    let PoolInner {
                        free, free_links, ..
                    } = &mut *inner;
                    free.pop_front(free_links)
                };
                let freed = popped.expect("unzip eviction freed a frame");
                self.block(freed).set_state(PageState::ReadyForUse);
                return Some(freed);
            }
            cursor = next;
        }
        None
    }

    /// Evicts a clean, unfixed, un-I/O-fixed page: out of the page hash
    /// and every list, compressed copy released, descriptor recycled onto
    /// its free list. Never touches dirty, fixed or I/O-fixed blocks.
    pub(crate) fn evict_block(&self, inner: &mut PoolInner, idx: u32) -> bool {
        let block = self.block(idx);
        if block.is_dirty() {
            return false;
        }
        let from = block.state();
        if !matches!(from, PageState::FilePage | PageState::ZipPage) {
            return false;
        }
        if !block.try_begin_remove(from) {
            return false;
        }
        if block.is_dirty() {
            // A fix-modify-unfix slipped in between the check and the gate.
            block.set_state(from);
            return false;
        }
        let Some(id) = block.page_id() else {
            block.set_state(from);
            return false;
        };
        {
            let stripe = &self.page_hash[self.hash_stripe(id)];
            let mut hash = stripe.write(&self.sync);
            if hash.get(&id) == Some(&idx) {
                hash.remove(&id);
            }
        }
        self.lru_remove_block(inner, idx);
        if inner.unzip.contains(&inner.unzip_links, idx) {
            let PoolInner {
                unzip, unzip_links, ..
            } = &mut *inner;
            unzip.remove(unzip_links, idx);
        }
        if let Some(handle) = block.meta.lock(&self.sync).zip.take() {
            self.zip.lock(&self.sync).dealloc(handle);
        }
        self.freed_page_clock.fetch_add(1, Ordering::Relaxed);
        block.reset_for_free();
        if self.is_zip_desc_index(idx) {
            inner.zip_desc_free.push(idx);
        } else {
            let PoolInner {
                free, free_links, ..
            } = &mut *inner;
            free.push_front(free_links, idx);
        }
        debug!(page = %id, instance = self.instance_no, "block evicted");
        true
    }

    /// Decompressed-side eviction: the page stays resident as its
    /// compressed copy on a frameless descriptor; the frame is freed. A
    /// dirty page has its compressed copy refreshed first so no
    /// modification is lost.
    fn unzip_evict(&self, inner: &mut PoolInner, idx: u32) -> bool {
        let block = self.block(idx);
        if block.state() != PageState::FilePage {
            return false;
        }
        let Some(handle) = ({
            let meta = block.meta.lock(&self.sync);
            meta.zip
        }) else {
            return false;
        };
        let Some(d_idx) = inner.zip_desc_free.pop() else {
            return false;
        };
        if !block.try_begin_remove(PageState::FilePage) {
            inner.zip_desc_free.push(d_idx);
            return false;
        }
        let Some(id) = block.page_id() else {
            block.set_state(PageState::FilePage);
            inner.zip_desc_free.push(d_idx);
            return false;
        };
        let dirty = block.is_dirty();
        if dirty && !self.refresh_zip_copy(block, id, handle) {
            block.set_state(PageState::FilePage);
            inner.zip_desc_free.push(d_idx);
            return false;
        }

        let dest = Arc::clone(self.block(d_idx));
        dest.set_page_id(Some(id));
        dest.set_newest_modification(block.newest_modification());
        dest.set_oldest_modification(block.oldest_modification());
        dest.set_access_time(block.access_time());
        dest.set_freed_page_clock(block.freed_page_clock());
        {
            let mut src_meta = block.meta.lock(&self.sync);
            let mut dst_meta = dest.meta.lock(&self.sync);
            dst_meta.zip = src_meta.zip.take();
        }
        dest.set_state(if dirty {
            PageState::ZipDirty
        } else {
            PageState::ZipPage
        });
        {
            let stripe = &self.page_hash[self.hash_stripe(id)];
            let mut hash = stripe.write(&self.sync);
            hash.insert(id, d_idx);
        }
        self.lru_replace_block(inner, idx, d_idx);
        {
            let PoolInner {
                unzip, unzip_links, ..
            } = &mut *inner;
            unzip.remove(unzip_links, idx);
        }
        if dirty {
            self.flush_relocate(idx, d_idx);
        }
        self.freed_page_clock.fetch_add(1, Ordering::Relaxed);
        block.reset_for_free();
        {
            let PoolInner {
                free, free_links, ..
            } = &mut *inner;
            free.push_front(free_links, idx);
        }
        debug!(page = %id, instance = self.instance_no, "decompressed copy shed");
        true
    }

    /// Recompresses the frame into the page's zip copy, stamping the LSN
    /// and checksum so the stored image is directly flushable.
    fn refresh_zip_copy(
        &self,
        block: &Arc<Block>,
        id: crate::types::PageId,
        handle: crate::pool::block::ZipHandle,
    ) -> bool {
        let Some(space) = self.spaces.lookup(id.space) else {
            return false;
        };
        let Some(codec) = space.transform().cloned() else {
            return false;
        };
        // The block is gated in RemoveHash with no fixes, so the latch is
        // free; the read still guards against stray holders.
        let Some(guard) = block.latch.try_read_arc() else {
            return false;
        };
        let physical = space.physical_page_size();
        let mut image = vec![0u8; physical];
        if codec.compress(id, &guard[..], &mut image).is_err() {
            return false;
        }
        page::set_page_lsn(&mut image, block.newest_modification());
        checksum::stamp(&mut image, self.options.checksum);
        self.zip.lock(&self.sync).write(handle, &image);
        true
    }

    /// Flushes one page from the LRU tail to make a frame evictable, then
    /// re-arms the LRU scan.
    pub(crate) fn flush_single_page(self: &Arc<Self>) -> Result<bool> {
        let candidate = {
            let mut inner = self.state.lock(&self.sync);
            let mut cursor = {
                let PoolInner {
                    lru,
                    lru_links,
                    single_scan_itr,
                    ..
                } = &mut *inner;
                single_scan_itr.start(lru, lru_links)
            };
            let depth = self.options.lru_scan_depth.max(1);
            let mut found = None;
            for _ in 0..depth {
                let Some(idx) = cursor else { break };
                let next = inner.lru.prev(&inner.lru_links, idx);
                inner.single_scan_itr.set(next);
                let block = self.block(idx);
                if block.is_dirty() && block.fix_count() == 0 && block.try_set_io_write() {
                    block.set_flush_type(FlushType::SinglePage);
                    self.inc_n_flush(FlushType::SinglePage);
                    found = Some(idx);
                    break;
                }
                cursor = next;
            }
            found
        };
        match candidate {
            Some(idx) => {
                self.write_flush_page(idx, FlushType::SinglePage, true)?;
                self.try_lru_scan.store(true, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
