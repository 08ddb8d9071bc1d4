//! One buffer pool instance: frames, striped page hash, free list, watch
//! sentinels, and the page acquisition paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{BrasaError, Result};
use crate::mtr::{HeldLatch, MiniTxn, PageHandle};
use crate::pool::block::{Block, FlushType, IoFix, PageState, FLUSH_TYPES};
use crate::pool::buddy::BuddySystem;
use crate::pool::hazard::{HazardKind, HazardPointer, LruIter};
use crate::pool::list::{IndexList, Links};
use crate::pool::tmp::TempSlots;
use crate::pool::{GetMode, LatchMode, NowaitMode, PoolInfo, PoolOptions, PoolStat, PoolStatSnapshot};
use crate::primitives::event::Event;
use crate::primitives::sync::wait_array::WaitArrays;
use crate::primitives::sync::{WaitMutex, WaitRwLock};
use crate::tablespace::TablespaceManager;
use crate::types::checksum;
use crate::types::{page, Lsn, PageId};

/// A contiguous run of frames, fixed at init.
#[derive(Clone, Copy, Debug)]
pub struct Chunk {
    pub start: u32,
    pub len: u32,
}

const CHUNK_FRAMES: usize = 256;

/// State behind the instance latch: the LRU, free and unzip lists, the
/// old-region boundary, and the scan cursors.
pub(crate) struct PoolInner {
    pub(crate) lru: IndexList,
    pub(crate) lru_links: Vec<Links>,
    pub(crate) free: IndexList,
    pub(crate) free_links: Vec<Links>,
    pub(crate) unzip: IndexList,
    pub(crate) unzip_links: Vec<Links>,
    pub(crate) lru_old: Option<u32>,
    pub(crate) lru_old_len: usize,
    pub(crate) zip_desc_free: Vec<u32>,
    pub(crate) lru_hp: HazardPointer,
    pub(crate) lru_scan_itr: LruIter,
    pub(crate) single_scan_itr: LruIter,
}

/// State behind the flush-list latch.
pub(crate) struct FlushInner {
    pub(crate) list: IndexList,
    pub(crate) links: Vec<Links>,
    pub(crate) hp: HazardPointer,
    /// Ordered mirror of the flush list, kept only while recovery inserts
    /// out-of-LSN-order pages.
    pub(crate) rbt: Option<BTreeMap<(u64, u32), ()>>,
}

pub struct BufferPool {
    pub(crate) instance_no: u32,
    pub(crate) options: PoolOptions,
    pub(crate) n_frames: usize,
    /// Descriptors: `[0, n_frames)` framed blocks, then `n_frames`
    /// frameless descriptors for compressed-only pages, then the watch
    /// sentinels.
    pub(crate) blocks: Vec<Arc<Block>>,
    pub(crate) chunks: Vec<Chunk>,
    pub(crate) page_hash: Vec<WaitRwLock<HashMap<PageId, u32>>>,
    pub(crate) state: WaitMutex<PoolInner>,
    pub(crate) flush_state: WaitMutex<FlushInner>,
    pub(crate) zip: WaitMutex<BuddySystem>,
    pub(crate) tmp: TempSlots,
    pub(crate) stat: PoolStat,
    old_stat: Mutex<(Instant, PoolStatSnapshot)>,
    pub(crate) freed_page_clock: AtomicU32,
    pub(crate) try_lru_scan: AtomicBool,
    pub(crate) n_pend_reads: AtomicUsize,
    pub(crate) n_pend_unzip: AtomicUsize,
    pub(crate) init_flush: [AtomicBool; FLUSH_TYPES],
    pub(crate) n_flush: [AtomicUsize; FLUSH_TYPES],
    pub(crate) no_flush: [Event; FLUSH_TYPES],
    pub(crate) epoch: Instant,
    pub(crate) sync: Arc<WaitArrays>,
    pub(crate) spaces: Arc<TablespaceManager>,
}

impl BufferPool {
    pub(crate) fn new(
        instance_no: u32,
        options: PoolOptions,
        sync: Arc<WaitArrays>,
        spaces: Arc<TablespaceManager>,
        epoch: Instant,
    ) -> Result<Arc<Self>> {
        let n_frames = options.frames_per_instance();
        let n_descriptors = n_frames * 2;
        let page_size = options.page_size;

        let mut blocks = Vec::with_capacity(n_descriptors + options.watch_size);
        let mut chunks = Vec::new();
        let mut start = 0usize;
        while start < n_frames {
            let len = CHUNK_FRAMES.min(n_frames - start);
            chunks.push(Chunk {
                start: start as u32,
                len: len as u32,
            });
            for i in start..start + len {
                blocks.push(Arc::new(Block::new(
                    i as u32,
                    instance_no,
                    PageState::NotUsed,
                    page_size,
                )));
            }
            start += len;
        }
        for i in n_frames..n_descriptors {
            blocks.push(Arc::new(Block::new(
                i as u32,
                instance_no,
                PageState::NotUsed,
                0,
            )));
        }
        for i in 0..options.watch_size {
            blocks.push(Arc::new(Block::new(
                (n_descriptors + i) as u32,
                instance_no,
                PageState::PoolWatch,
                0,
            )));
        }

        let mut inner = PoolInner {
            lru: IndexList::new(),
            lru_links: vec![Links::default(); n_descriptors],
            free: IndexList::new(),
            free_links: vec![Links::default(); n_descriptors],
            unzip: IndexList::new(),
            unzip_links: vec![Links::default(); n_descriptors],
            lru_old: None,
            lru_old_len: 0,
            zip_desc_free: (n_frames as u32..n_descriptors as u32).collect(),
            lru_hp: HazardPointer::new(HazardKind::Lru),
            lru_scan_itr: LruIter::new(),
            single_scan_itr: LruIter::new(),
        };
        for i in 0..n_frames as u32 {
            inner.free.push_back(&mut inner.free_links, i);
        }

        let flush_inner = FlushInner {
            list: IndexList::new(),
            links: vec![Links::default(); n_descriptors],
            hp: HazardPointer::new(HazardKind::FlushList),
            rbt: None,
        };

        let pool = Arc::new(Self {
            instance_no,
            n_frames,
            blocks,
            chunks,
            page_hash: (0..options.page_hash_stripes)
                .map(|_| WaitRwLock::new("page_hash", HashMap::new()))
                .collect(),
            state: WaitMutex::new("buf_pool", inner),
            flush_state: WaitMutex::new("flush_list", flush_inner),
            zip: WaitMutex::new("zip_mutex", BuddySystem::new(page_size, options.zip_arena_pages)),
            tmp: TempSlots::new(options.tmp_slots, page_size),
            stat: PoolStat::default(),
            old_stat: Mutex::new((epoch, PoolStatSnapshot::default())),
            freed_page_clock: AtomicU32::new(0),
            try_lru_scan: AtomicBool::new(true),
            n_pend_reads: AtomicUsize::new(0),
            n_pend_unzip: AtomicUsize::new(0),
            init_flush: std::array::from_fn(|_| AtomicBool::new(false)),
            n_flush: std::array::from_fn(|_| AtomicUsize::new(0)),
            no_flush: std::array::from_fn(|_| Event::new()),
            epoch,
            sync,
            spaces,
            options,
        });
        for event in &pool.no_flush {
            event.set();
        }
        info!(
            instance = instance_no,
            frames = n_frames,
            chunks = pool.chunks.len(),
            "buffer pool instance up"
        );
        Ok(pool)
    }

    pub fn instance_no(&self) -> u32 {
        self.instance_no
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn stats(&self) -> &PoolStat {
        &self.stat
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Per-size-class counters of the compressed-frame buddy system.
    pub fn buddy_stats(&self) -> Vec<crate::pool::buddy::BuddyStat> {
        self.zip.lock(&self.sync).stats().to_vec()
    }

    pub(crate) fn block(&self, idx: u32) -> &Arc<Block> {
        &self.blocks[idx as usize]
    }

    pub(crate) fn is_watch_index(&self, idx: u32) -> bool {
        idx as usize >= self.n_frames * 2
    }

    pub(crate) fn is_zip_desc_index(&self, idx: u32) -> bool {
        let i = idx as usize;
        i >= self.n_frames && i < self.n_frames * 2
    }

    pub(crate) fn hash_stripe(&self, id: PageId) -> usize {
        id.fold() as usize & (self.page_hash.len() - 1)
    }

    /// Milliseconds since pool start, never zero.
    pub(crate) fn now_ms(&self) -> u64 {
        (self.epoch.elapsed().as_millis() as u64).max(1)
    }

    pub fn freed_page_clock_value(&self) -> u32 {
        self.freed_page_clock.load(Ordering::Relaxed) & 0x7FFF_FFFF
    }

    // -----------------------------------------------------------------
    // Page acquisition
    // -----------------------------------------------------------------

    /// The general page access path. Returns `None` for the in-pool-only
    /// modes on miss, and for the watch and evict modes always.
    pub fn get(
        self: &Arc<Self>,
        id: PageId,
        zip_size: usize,
        latch: LatchMode,
        guess: Option<&Arc<Block>>,
        mode: GetMode,
        mtr: &mut MiniTxn,
    ) -> Result<Option<PageHandle>> {
        debug_assert!(
            (mode == GetMode::GetNoLatch) == (latch == LatchMode::NoLatch),
            "no-latch mode and latch mode must agree"
        );
        PoolStat::bump(&self.stat.n_page_gets);
        loop {
            // Lookup, and fix while the stripe latch pins the mapping.
            enum Found {
                Miss,
                Watch,
                Fixed(u32),
            }
            let found = {
                let stripe = &self.page_hash[self.hash_stripe(id)];
                let hash = stripe.read(&self.sync);
                let candidate = match guess {
                    Some(g)
                        if g.instance_no == self.instance_no && g.page_id() == Some(id) =>
                    {
                        Some(g.index)
                    }
                    _ => hash.get(&id).copied(),
                };
                match candidate {
                    None => Found::Miss,
                    Some(idx) if self.is_watch_index(idx) => Found::Watch,
                    Some(idx) => {
                        if mode == GetMode::EvictIfInPool {
                            drop(hash);
                            self.evict_page_if_clean(id);
                            return Ok(None);
                        }
                        let block = self.block(idx);
                        if block.fix_if_in_file() {
                            if block.page_id() == Some(id) {
                                Found::Fixed(idx)
                            } else {
                                block.unfix();
                                continue;
                            }
                        } else {
                            // Descriptor is being recycled; look again.
                            continue;
                        }
                    }
                }
            };

            let watch_hit = matches!(found, Found::Watch);
            let idx = match found {
                Found::Fixed(idx) => idx,
                Found::Watch | Found::Miss => {
                    match mode {
                        GetMode::GetIfInPool | GetMode::PeekIfInPool | GetMode::EvictIfInPool => {
                            return Ok(None)
                        }
                        GetMode::GetIfInPoolOrWatch => {
                            if !watch_hit {
                                self.watch_set(id)?;
                            }
                            return Ok(None);
                        }
                        GetMode::Get | GetMode::GetPossiblyFreed | GetMode::GetNoLatch => {
                            if self.spaces.is_deleted(id.space) {
                                return Err(BrasaError::TablespaceDeleted(id.space));
                            }
                            self.read_page_into_pool(id, zip_size, true)?;
                            continue;
                        }
                    }
                }
            };

            let block = Arc::clone(self.block(idx));
            self.wait_for_read(&block);
            match block.state() {
                PageState::FilePage => {}
                PageState::ZipPage | PageState::ZipDirty => {
                    // Compressed only: bring in the uncompressed frame.
                    block.unfix();
                    self.unzip_page(id)?;
                    continue;
                }
                _ => {
                    // The read failed or the page was recycled under us.
                    block.unfix();
                    continue;
                }
            }

            if mode != GetMode::PeekIfInPool {
                self.block_accessed(&block);
            }
            let held = match latch {
                LatchMode::NoLatch => HeldLatch::None,
                LatchMode::Shared => HeldLatch::S(block.latch.read_arc(&self.sync)),
                LatchMode::Exclusive => HeldLatch::X(block.latch.write_arc(&self.sync)),
            };
            return Ok(Some(mtr.memo_push(Arc::clone(self), block, held)));
        }
    }

    /// Optimistic re-access through a previously returned block: succeeds
    /// iff the block still maps the same page and its modify clock matches.
    pub fn optimistic(
        self: &Arc<Self>,
        block: &Arc<Block>,
        modify_clock: u64,
        latch: LatchMode,
        mtr: &mut MiniTxn,
    ) -> Result<Option<PageHandle>> {
        debug_assert!(latch != LatchMode::NoLatch);
        if !block.fix_if_in_file() {
            return Ok(None);
        }
        let held = match latch {
            LatchMode::Shared => HeldLatch::S(block.latch.read_arc(&self.sync)),
            LatchMode::Exclusive => HeldLatch::X(block.latch.write_arc(&self.sync)),
            LatchMode::NoLatch => unreachable!(),
        };
        if block.state() != PageState::FilePage || block.modify_clock() != modify_clock {
            drop(held);
            block.unfix();
            return Ok(None);
        }
        PoolStat::bump(&self.stat.n_page_gets);
        self.block_accessed(block);
        Ok(Some(mtr.memo_push(
            Arc::clone(self),
            Arc::clone(block),
            held,
        )))
    }

    /// Access to a known resident block without waiting: the fix is taken
    /// only if the latch is immediately available.
    pub fn get_known_nowait(
        self: &Arc<Self>,
        block: &Arc<Block>,
        latch: LatchMode,
        nowait_mode: NowaitMode,
        mtr: &mut MiniTxn,
    ) -> Result<Option<PageHandle>> {
        debug_assert!(latch != LatchMode::NoLatch);
        if !block.fix_if_in_file() {
            return Ok(None);
        }
        let held = match latch {
            LatchMode::Shared => match block.latch.try_read_arc() {
                Some(guard) => HeldLatch::S(guard),
                None => {
                    block.unfix();
                    return Ok(None);
                }
            },
            LatchMode::Exclusive => match block.latch.try_write_arc() {
                Some(guard) => HeldLatch::X(guard),
                None => {
                    block.unfix();
                    return Ok(None);
                }
            },
            LatchMode::NoLatch => unreachable!(),
        };
        PoolStat::bump(&self.stat.n_page_gets);
        if nowait_mode == NowaitMode::MakeYoung {
            self.make_young_if_needed(block);
        }
        Ok(Some(mtr.memo_push(
            Arc::clone(self),
            Arc::clone(block),
            held,
        )))
    }

    /// Initializes a page in the pool without reading it from disk. The
    /// other path that takes a descriptor from `NotUsed` to `FilePage`.
    pub fn create(
        self: &Arc<Self>,
        id: PageId,
        zip_size: usize,
        mtr: &mut MiniTxn,
    ) -> Result<PageHandle> {
        loop {
            if self.peek(id) {
                if let Some(handle) =
                    self.get(id, zip_size, LatchMode::Exclusive, None, GetMode::Get, mtr)?
                {
                    return Ok(handle);
                }
                continue;
            }
            let free_idx = self.get_free_block()?;
            let block = Arc::clone(self.block(free_idx));
            let mut guard = block.latch.write_arc(&self.sync);

            let won = {
                let mut inner = self.state.lock(&self.sync);
                let stripe = &self.page_hash[self.hash_stripe(id)];
                let mut hash = stripe.write(&self.sync);
                match hash.get(&id).copied() {
                    Some(existing) if !self.is_watch_index(existing) => false,
                    _ => {
                        block.set_page_id(Some(id));
                        block.set_state(PageState::FilePage);
                        block.fix();
                        page::init(&mut guard[..], id);
                        hash.insert(id, free_idx);
                        self.lru_add_block(&mut inner, free_idx, false);
                        true
                    }
                }
            };
            if !won {
                drop(guard);
                self.block_free(free_idx);
                continue;
            }
            if zip_size != 0 {
                // Reserve the compressed copy up front; it is filled by the
                // first flush.
                let handle = self.zip.lock(&self.sync).alloc(zip_size);
                if let Some(handle) = handle {
                    block.meta.lock(&self.sync).zip = Some(handle);
                    let mut inner = self.state.lock(&self.sync);
                    let PoolInner {
                        unzip, unzip_links, ..
                    } = &mut *inner;
                    unzip.push_front(unzip_links, free_idx);
                }
            }
            block.modify_clock_inc();
            PoolStat::bump(&self.stat.n_pages_created);
            debug!(page = %id, instance = self.instance_no, "page created in pool");
            return Ok(mtr.memo_push(Arc::clone(self), block, HeldLatch::X(guard)));
        }
    }

    /// Compressed-page access: returns a buffer-fixed descriptor carrying
    /// the compressed image. No latch is taken; callers serialize at a
    /// higher level and release with `release_zip`.
    pub fn get_zip(self: &Arc<Self>, id: PageId, zip_size: usize) -> Result<Option<Arc<Block>>> {
        PoolStat::bump(&self.stat.n_page_gets);
        loop {
            let found = {
                let stripe = &self.page_hash[self.hash_stripe(id)];
                let hash = stripe.read(&self.sync);
                match hash.get(&id).copied() {
                    None => None,
                    Some(idx) if self.is_watch_index(idx) => None,
                    Some(idx) => {
                        let block = self.block(idx);
                        if block.fix_if_in_file() {
                            if block.page_id() == Some(id) {
                                Some(idx)
                            } else {
                                block.unfix();
                                continue;
                            }
                        } else {
                            continue;
                        }
                    }
                }
            };
            match found {
                Some(idx) => {
                    let block = Arc::clone(self.block(idx));
                    self.wait_for_read(&block);
                    if !block.state().is_in_file() {
                        block.unfix();
                        continue;
                    }
                    self.block_accessed(&block);
                    return Ok(Some(block));
                }
                None => {
                    if self.spaces.is_deleted(id.space) {
                        return Err(BrasaError::TablespaceDeleted(id.space));
                    }
                    self.read_page_into_pool(id, zip_size, false)?;
                }
            }
        }
    }

    pub fn release_zip(&self, block: &Arc<Block>) {
        block.unfix();
    }

    /// Copy of a block's compressed image, for callers that only hold a
    /// zip fix. `len` is the space's compressed page size.
    pub fn zip_copy(&self, block: &Arc<Block>, len: usize) -> Option<Vec<u8>> {
        let handle = { block.meta.lock(&self.sync).zip? };
        debug_assert!(len <= handle.size as usize);
        let mut out = vec![0u8; len];
        self.zip.lock(&self.sync).read(handle, &mut out);
        Some(out)
    }

    /// Reads a block's compressed image into `dst`.
    pub(crate) fn zip_copy_into(&self, block: &Arc<Block>, dst: &mut [u8]) -> Result<()> {
        let handle = block
            .meta
            .lock(&self.sync)
            .zip
            .ok_or(BrasaError::Corruption("dirty compressed page lost its image"))?;
        self.zip.lock(&self.sync).read(handle, dst);
        Ok(())
    }

    /// Page-hash membership test; the page may still be under read I/O.
    pub fn peek(&self, id: PageId) -> bool {
        let stripe = &self.page_hash[self.hash_stripe(id)];
        let hash = stripe.read(&self.sync);
        matches!(hash.get(&id), Some(&idx) if !self.is_watch_index(idx))
    }

    // -----------------------------------------------------------------
    // Read I/O
    // -----------------------------------------------------------------

    /// Claims a free descriptor, publishes it as the placeholder for `id`
    /// (exclusive-latched, `io_fix = Read`), performs the read, validates
    /// and transforms the image, and completes the I/O. Claiming before
    /// publication is what bounds each page to one read at a time.
    fn read_page_into_pool(
        self: &Arc<Self>,
        id: PageId,
        zip_size: usize,
        into_frame: bool,
    ) -> Result<()> {
        let space = self.spaces.get(id.space)?;
        let zip_size = if zip_size != 0 {
            zip_size
        } else {
            space.zip_size()
        };
        if !into_frame && zip_size == 0 {
            return Err(BrasaError::Invalid(
                "compressed access to an uncompressed tablespace",
            ));
        }

        let idx = if into_frame {
            self.get_free_block()?
        } else {
            match self.claim_zip_descriptor() {
                Some(idx) => idx,
                None => return Err(BrasaError::PoolExhausted),
            }
        };
        let block = Arc::clone(self.block(idx));
        let mut guard = block.latch.write_arc_pass(&self.sync, 1);

        let won = {
            let mut inner = self.state.lock(&self.sync);
            let stripe = &self.page_hash[self.hash_stripe(id)];
            let mut hash = stripe.write(&self.sync);
            match hash.get(&id).copied() {
                Some(existing) if !self.is_watch_index(existing) => false,
                _ => {
                    // A replaced watch sentinel keeps its claim; only the
                    // hash entry is re-pointed.
                    block.set_page_id(Some(id));
                    block.set_state(if into_frame {
                        PageState::FilePage
                    } else {
                        PageState::ZipPage
                    });
                    block.set_io_fix(IoFix::Read);
                    hash.insert(id, idx);
                    self.lru_add_block(&mut inner, idx, true);
                    true
                }
            }
        };
        if !won {
            drop(guard);
            self.undo_claim(idx);
            return Ok(());
        }
        self.n_pend_reads.fetch_add(1, Ordering::Relaxed);

        let result = self.perform_read(&space, id, zip_size, into_frame, &block, &mut guard);
        self.n_pend_reads.fetch_sub(1, Ordering::Relaxed);
        match result {
            Ok(()) => {
                block.set_io_fix(IoFix::None);
                PoolStat::bump(&self.stat.n_pages_read);
                debug!(page = %id, instance = self.instance_no, "page read into pool");
                Ok(())
            }
            Err(err) => {
                self.fail_read(&block, idx, id);
                drop(guard);
                // Waiters that fixed the placeholder drain quickly: they
                // see the recycled state and retry from the hash.
                while block.fix_count() > 0 {
                    std::thread::yield_now();
                }
                self.block_free(idx);
                Err(err)
            }
        }
    }

    fn perform_read(
        &self,
        space: &Arc<crate::tablespace::Tablespace>,
        id: PageId,
        zip_size: usize,
        into_frame: bool,
        block: &Arc<Block>,
        guard: &mut crate::primitives::sync::ArcRwWriteGuard<crate::pool::block::Frame>,
    ) -> Result<()> {
        if zip_size == 0 {
            let frame = &mut guard[..];
            space.read_page(id.page_no, frame)?;
            if page::is_zeroed(frame) {
                return Ok(());
            }
            if checksum::page_is_corrupted(true, frame) {
                return Err(BrasaError::PageCorrupted(id));
            }
            space.decrypt(id, frame)?;
            if page::page_id(frame) != id {
                return Err(BrasaError::PageCorrupted(id));
            }
            return Ok(());
        }

        // Compressed tablespace: the on-disk image is zip_size bytes.
        let mut zip_image = vec![0u8; zip_size];
        space.read_page(id.page_no, &mut zip_image)?;
        if !page::is_zeroed(&zip_image) {
            if checksum::page_is_corrupted(true, &zip_image) {
                return Err(BrasaError::PageCorrupted(id));
            }
            if page::page_id(&zip_image) != id {
                return Err(BrasaError::PageCorrupted(id));
            }
        }
        let handle = {
            let mut zip = self.zip.lock(&self.sync);
            match zip.alloc(zip_size) {
                Some(handle) => {
                    zip.write(handle, &zip_image);
                    handle
                }
                None => return Err(BrasaError::PoolExhausted),
            }
        };
        block.meta.lock(&self.sync).zip = Some(handle);

        if into_frame {
            self.n_pend_unzip.fetch_add(1, Ordering::Relaxed);
            let res = if page::is_zeroed(&zip_image) {
                guard.fill(0);
                Ok(())
            } else {
                match space.transform() {
                    Some(codec) => codec.decompress(id, &zip_image, &mut guard[..]),
                    None => Err(BrasaError::Corruption("compression codec missing")),
                }
            };
            self.n_pend_unzip.fetch_sub(1, Ordering::Relaxed);
            res?;
            // Both copies resident now.
            let mut inner = self.state.lock(&self.sync);
            let idx = block.index;
            if !inner.unzip.contains(&inner.unzip_links, idx) {
                let PoolInner {
                    unzip, unzip_links, ..
                } = &mut *inner;
                unzip.push_front(unzip_links, idx);
            }
        }
        Ok(())
    }

    /// Unpublishes a placeholder whose read failed: page-hash entry gone,
    /// off the LRU, descriptor recycled. Subsequent gets reissue the read.
    fn fail_read(&self, block: &Arc<Block>, idx: u32, id: PageId) {
        tracing::warn!(page = %id, instance = self.instance_no, "page read failed; discarding block");
        let mut inner = self.state.lock(&self.sync);
        let stripe = &self.page_hash[self.hash_stripe(id)];
        {
            let mut hash = stripe.write(&self.sync);
            if hash.get(&id) == Some(&idx) {
                hash.remove(&id);
            }
        }
        self.lru_remove_block(&mut inner, idx);
        if inner.unzip.contains(&inner.unzip_links, idx) {
            let PoolInner {
                unzip, unzip_links, ..
            } = &mut *inner;
            unzip.remove(unzip_links, idx);
        }
        drop(inner);
        if let Some(handle) = block.meta.lock(&self.sync).zip.take() {
            self.zip.lock(&self.sync).dealloc(handle);
        }
        block.set_io_fix(IoFix::None);
        block.set_state(PageState::RemoveHash);
    }

    /// Parks until a pending read on the block completes, by queueing on
    /// the exclusive latch the reader holds.
    fn wait_for_read(&self, block: &Arc<Block>) {
        loop {
            match block.io_fix() {
                IoFix::Read => {
                    let guard = block.latch.read_arc(&self.sync);
                    drop(guard);
                }
                _ => return,
            }
        }
    }

    /// Brings the uncompressed frame of a compressed-only page into the
    /// pool by relocating the descriptor onto a framed block.
    fn unzip_page(self: &Arc<Self>, id: PageId) -> Result<()> {
        let space = self.spaces.get(id.space)?;
        let free_idx = self.get_free_block()?;
        let block = Arc::clone(self.block(free_idx));
        let mut guard = block.latch.write_arc_pass(&self.sync, 1);

        // Capture the zip descriptor under the latches, or give up and let
        // the caller retry.
        let moved = {
            let mut inner = self.state.lock(&self.sync);
            let stripe = &self.page_hash[self.hash_stripe(id)];
            let mut hash = stripe.write(&self.sync);
            let Some(&zidx) = hash.get(&id) else {
                drop(hash);
                drop(inner);
                self.block_free(free_idx);
                return Ok(());
            };
            if !self.is_zip_desc_index(zidx) {
                // Someone else already decompressed it.
                drop(hash);
                drop(inner);
                self.block_free(free_idx);
                return Ok(());
            }
            let zblock = Arc::clone(self.block(zidx));
            let from = zblock.state();
            if !matches!(from, PageState::ZipPage | PageState::ZipDirty)
                || !zblock.try_begin_remove(from)
            {
                drop(hash);
                drop(inner);
                self.block_free(free_idx);
                return Ok(());
            }

            // Relocate: identity, modification state, LRU position.
            block.set_page_id(Some(id));
            block.set_state(PageState::FilePage);
            block.set_io_fix(IoFix::Read);
            block.set_newest_modification(zblock.newest_modification());
            block.set_oldest_modification(zblock.oldest_modification());
            block.set_access_time(zblock.access_time());
            block.set_freed_page_clock(zblock.freed_page_clock());
            {
                let mut zmeta = zblock.meta.lock(&self.sync);
                let mut bmeta = block.meta.lock(&self.sync);
                bmeta.zip = zmeta.zip.take();
            }
            hash.insert(id, free_idx);
            self.lru_replace_block(&mut inner, zidx, free_idx);
            {
                let PoolInner {
                    unzip, unzip_links, ..
                } = &mut *inner;
                unzip.push_front(unzip_links, free_idx);
            }
            if zblock.is_dirty() {
                self.flush_relocate(zidx, free_idx);
            }
            zblock.reset_for_free();
            inner.zip_desc_free.push(zidx);
            true
        };
        debug_assert!(moved);

        // Decompress outside the pool latches; io_fix keeps scans away.
        let zip_image = self
            .zip_copy(&block, space.physical_page_size())
            .ok_or(BrasaError::Corruption("relocated page lost its zip image"))?;
        self.n_pend_unzip.fetch_add(1, Ordering::Relaxed);
        let res = if page::is_zeroed(&zip_image) {
            guard.fill(0);
            Ok(())
        } else {
            match space.transform() {
                Some(codec) => codec.decompress(id, &zip_image, &mut guard[..]),
                None => Err(BrasaError::Corruption("compression codec missing")),
            }
        };
        self.n_pend_unzip.fetch_sub(1, Ordering::Relaxed);
        match res {
            Ok(()) => {
                block.set_io_fix(IoFix::None);
                Ok(())
            }
            Err(err) => {
                self.fail_read(&block, free_idx, id);
                drop(guard);
                while block.fix_count() > 0 {
                    std::thread::yield_now();
                }
                self.block_free(free_idx);
                Err(err)
            }
        }
    }

    // -----------------------------------------------------------------
    // Access heuristics
    // -----------------------------------------------------------------

    /// First access stamps the time; a second access past the grace period
    /// may promote the block to the young end.
    pub(crate) fn block_accessed(&self, block: &Arc<Block>) {
        let now = self.now_ms();
        let first = block.access_time();
        if first == 0 {
            block.set_access_time(now);
            return;
        }
        if now.saturating_sub(first) >= self.options.old_blocks_time_ms {
            self.make_young_if_needed(block);
        } else {
            PoolStat::bump(&self.stat.n_pages_not_made_young);
        }
    }

    // -----------------------------------------------------------------
    // Free-list plumbing
    // -----------------------------------------------------------------

    /// Returns a `ReadyForUse` descriptor to the free list.
    pub(crate) fn block_free(&self, idx: u32) {
        let block = self.block(idx);
        block.reset_for_free();
        let mut inner = self.state.lock(&self.sync);
        if self.is_zip_desc_index(idx) {
            inner.zip_desc_free.push(idx);
        } else {
            let PoolInner {
                free, free_links, ..
            } = &mut *inner;
            free.push_front(free_links, idx);
        }
    }

    fn claim_zip_descriptor(&self) -> Option<u32> {
        let mut inner = self.state.lock(&self.sync);
        let idx = inner.zip_desc_free.pop()?;
        self.block(idx).set_state(PageState::ReadyForUse);
        Some(idx)
    }

    fn undo_claim(&self, idx: u32) {
        self.block_free(idx);
    }

    /// Clean-page eviction for `EvictIfInPool`.
    fn evict_page_if_clean(&self, id: PageId) {
        let mut inner = self.state.lock(&self.sync);
        let stripe = &self.page_hash[self.hash_stripe(id)];
        let idx = {
            let hash = stripe.read(&self.sync);
            match hash.get(&id).copied() {
                Some(idx) if !self.is_watch_index(idx) => idx,
                _ => return,
            }
        };
        self.evict_block(&mut inner, idx);
    }

    // -----------------------------------------------------------------
    // Watch sentinels
    // -----------------------------------------------------------------

    fn watch_blocks(&self) -> &[Arc<Block>] {
        &self.blocks[self.n_frames * 2..]
    }

    /// Installs a watch for `id` so a later reader's load can be observed
    /// without holding a fix. Idempotent. Returns false when the page is
    /// already resident, in which case no watch exists.
    pub fn watch_set(&self, id: PageId) -> Result<bool> {
        let _inner = self.state.lock(&self.sync);
        let stripe = &self.page_hash[self.hash_stripe(id)];
        let mut hash = stripe.write(&self.sync);
        if let Some(&idx) = hash.get(&id) {
            if self.is_watch_index(idx) {
                return Ok(true);
            }
            return Ok(false);
        }
        for sentinel in self.watch_blocks() {
            match sentinel.page_id() {
                Some(claimed) if claimed == id => return Ok(true),
                None => {
                    sentinel.set_page_id(Some(id));
                    hash.insert(id, sentinel.index);
                    return Ok(true);
                }
                _ => {}
            }
        }
        Err(BrasaError::Corruption("all watch sentinels in use"))
    }

    /// Whether the watched page has been loaded (or the sentinel otherwise
    /// replaced) since `watch_set`.
    pub fn watch_occurred(&self, id: PageId) -> Result<bool> {
        let stripe = &self.page_hash[self.hash_stripe(id)];
        let hash = stripe.read(&self.sync);
        let sentinel = self
            .watch_blocks()
            .iter()
            .find(|w| w.page_id() == Some(id));
        let Some(sentinel) = sentinel else {
            return Err(BrasaError::Invalid("watch was never set for this page"));
        };
        match hash.get(&id) {
            Some(&idx) if idx == sentinel.index => Ok(false),
            _ => Ok(true),
        }
    }

    /// Removes the watch. The caller must have set it.
    pub fn watch_unset(&self, id: PageId) -> Result<()> {
        let _inner = self.state.lock(&self.sync);
        let stripe = &self.page_hash[self.hash_stripe(id)];
        let mut hash = stripe.write(&self.sync);
        let sentinel = self
            .watch_blocks()
            .iter()
            .find(|w| w.page_id() == Some(id));
        let Some(sentinel) = sentinel else {
            return Err(BrasaError::Invalid("watch was never set for this page"));
        };
        if hash.get(&id) == Some(&sentinel.index) {
            hash.remove(&id);
        }
        sentinel.set_page_id(None);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------

    pub fn info(&self) -> PoolInfo {
        let (lru_len, old_lru_len, unzip_lru_len, free_list_len) = {
            let inner = self.state.lock(&self.sync);
            (
                inner.lru.len(),
                inner.lru_old_len,
                inner.unzip.len(),
                inner.free.len(),
            )
        };
        let flush_list_len = self.flush_state.lock(&self.sync).list.len();
        PoolInfo {
            instance_no: self.instance_no,
            pool_size_pages: self.n_frames,
            lru_len,
            old_lru_len,
            unzip_lru_len,
            free_list_len,
            flush_list_len,
            lru_bytes: lru_len * self.options.page_size,
            flush_list_bytes: flush_list_len * self.options.page_size,
            n_pend_reads: self.n_pend_reads.load(Ordering::Relaxed),
            n_pend_unzip: self.n_pend_unzip.load(Ordering::Relaxed),
            n_pending_flush_lru: self.n_flush[FlushType::Lru.index()].load(Ordering::Relaxed),
            n_pending_flush_list: self.n_flush[FlushType::List.index()].load(Ordering::Relaxed),
            n_pending_flush_single_page: self.n_flush[FlushType::SinglePage.index()]
                .load(Ordering::Relaxed),
            stat: self.stat.snapshot(),
            ..PoolInfo::default()
        }
    }

    /// Snapshot with rates averaged since the previous call.
    pub fn refresh_io_stats(&self) -> PoolInfo {
        let mut info = self.info();
        let now = Instant::now();
        let mut old = self.old_stat.lock();
        let (then, prev) = *old;
        let secs = now.duration_since(then).as_secs_f64().max(1e-3);
        let cur = info.stat;
        info.pages_read_rate = (cur.n_pages_read - prev.n_pages_read) as f64 / secs;
        info.pages_written_rate = (cur.n_pages_written - prev.n_pages_written) as f64 / secs;
        info.pages_created_rate = (cur.n_pages_created - prev.n_pages_created) as f64 / secs;
        info.page_made_young_rate =
            (cur.n_pages_made_young - prev.n_pages_made_young) as f64 / secs;
        info.page_not_made_young_rate =
            (cur.n_pages_not_made_young - prev.n_pages_not_made_young) as f64 / secs;
        info.n_page_get_delta = cur.n_page_gets - prev.n_page_gets;
        *old = (now, cur);
        info
    }

    /// Smallest `oldest_modification` in this instance; zero when clean.
    pub fn oldest_modification(&self) -> Lsn {
        let flush = self.flush_state.lock(&self.sync);
        match flush.list.tail() {
            Some(idx) => self.block(idx).oldest_modification(),
            None => Lsn::ZERO,
        }
    }

    /// Debug walk of the instance's lists against the state invariants.
    pub fn validate(&self) {
        let inner = self.state.lock(&self.sync);
        for idx in inner.free.iter(&inner.free_links) {
            assert_eq!(self.block(idx).state(), PageState::NotUsed);
        }
        let mut old_seen = 0usize;
        let mut past_boundary = false;
        for idx in inner.lru.iter(&inner.lru_links) {
            let block = self.block(idx);
            assert!(block.state().is_in_file());
            if inner.lru_old == Some(idx) {
                past_boundary = true;
            }
            if block.is_old() {
                old_seen += 1;
            }
            if past_boundary {
                assert!(block.is_old(), "old region must be contiguous to the tail");
            }
        }
        if inner.lru_old.is_some() {
            assert_eq!(old_seen, inner.lru_old_len);
            assert!(past_boundary);
        } else {
            assert_eq!(inner.lru_old_len, 0);
        }
        for idx in inner.unzip.iter(&inner.unzip_links) {
            let block = self.block(idx);
            assert_eq!(block.state(), PageState::FilePage);
            assert!(inner.lru.contains(&inner.lru_links, idx));
        }
        drop(inner);

        let flush = self.flush_state.lock(&self.sync);
        let mut prev_lsn: Option<Lsn> = None;
        for idx in flush.list.iter_from_tail(&flush.links) {
            let block = self.block(idx);
            assert!(block.is_dirty());
            assert!(matches!(
                block.state(),
                PageState::FilePage | PageState::ZipDirty
            ));
            let lsn = block.oldest_modification();
            if let Some(prev) = prev_lsn {
                assert!(lsn >= prev, "flush list ordered by oldest modification");
            }
            prev_lsn = Some(lsn);
        }
        if let Some(rbt) = &flush.rbt {
            assert_eq!(rbt.len(), flush.list.len());
        }
    }
}
