//! The buffer pool: content-addressed page cache over the tablespace layer.
//!
//! The pool is split into independent instances selected by page address;
//! each instance owns its frames, page-hash stripes, LRU and flush lists.
//! All heavy lifting lives in the submodules: `block` (descriptors and the
//! packed state word), `lru` (midpoint insertion and eviction), `flush`
//! (dirty-page write-back) and `instance` (the acquisition paths).

mod buddy;
mod flush;
mod hazard;
mod instance;
mod list;
mod lru;
mod tmp;

pub mod block;

pub use block::{Block, BlockMeta, FlushType, IoFix, PageState, ZipHandle, FLUSH_TYPES};
pub use buddy::{BuddyStat, BUDDY_LOW};
pub use instance::BufferPool;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{BrasaError, Result};
use crate::mtr::{MiniTxn, PageHandle};
use crate::primitives::sync::wait_array::WaitArrays;
use crate::tablespace::TablespaceManager;
use crate::types::checksum::ChecksumAlgorithm;
use crate::types::{page, Lsn, PageId};

/// Latch requested on the returned page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LatchMode {
    Shared,
    Exclusive,
    /// Buffer-fix only. The contents must not be read unless the caller
    /// knows it is safe, and never modified.
    NoLatch,
}

/// How a page acquisition behaves on hit and miss.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GetMode {
    /// Read from disk on miss.
    Get,
    /// Return `None` on miss.
    GetIfInPool,
    /// Like `GetIfInPool`, and suppress the LRU young-making side effect.
    PeekIfInPool,
    /// Like `Get` with `LatchMode::NoLatch`.
    GetNoLatch,
    /// On miss, install a watch sentinel and return `None`.
    GetIfInPoolOrWatch,
    /// Like `Get`, but tolerate the page having been freed meanwhile.
    GetPossiblyFreed,
    /// Evict the page if present and clean; always returns `None`.
    EvictIfInPool,
}

/// LRU behavior of `get_known_nowait`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NowaitMode {
    MakeYoung,
    KeepOld,
}

/// Denominator of the old-region ratio.
pub const LRU_OLD_RATIO_DIV: usize = 1024;

/// Slack before the old-region boundary is slid, in blocks.
pub(crate) const LRU_OLD_TOLERANCE: usize = 20;

/// Buffer pool configuration.
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Total size across all instances, in bytes.
    pub pool_size_bytes: usize,
    /// Number of independent instances, 1 to 64.
    pub instances: usize,
    /// Frame size in bytes; power of two.
    pub page_size: usize,
    /// Page-hash stripes per instance; power of two, at most 1024.
    pub page_hash_stripes: usize,
    /// Percentage of the LRU reserved for the old region.
    pub old_blocks_pct: u32,
    /// Grace period before a re-accessed old block is promoted.
    pub old_blocks_time_ms: u64,
    /// LRU length at which the old region is activated.
    pub lru_old_min_len: usize,
    /// Blocks inspected per free-block scan before giving up.
    pub lru_scan_depth: usize,
    /// Watch sentinels per instance.
    pub watch_size: usize,
    /// Scratch slots for the write transform, per instance.
    pub tmp_slots: usize,
    /// Buddy arena size for compressed frames, in pages per instance.
    pub zip_arena_pages: usize,
    /// Checksum stamped on pages at write time.
    pub checksum: ChecksumAlgorithm,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            pool_size_bytes: 4 * 1024 * 1024,
            instances: 1,
            page_size: page::DEFAULT_PAGE_SIZE,
            page_hash_stripes: 16,
            old_blocks_pct: 37,
            old_blocks_time_ms: 1000,
            lru_old_min_len: 512,
            lru_scan_depth: 128,
            watch_size: 4,
            tmp_slots: 8,
            zip_arena_pages: 16,
            checksum: ChecksumAlgorithm::Crc32,
        }
    }
}

impl PoolOptions {
    pub fn validate(&self) -> Result<()> {
        if !(1..=64).contains(&self.instances) {
            return Err(BrasaError::Config(format!(
                "instances must be in 1..=64, got {}",
                self.instances
            )));
        }
        if !self.page_size.is_power_of_two() || self.page_size < page::MIN_PAGE_SIZE {
            return Err(BrasaError::Config(format!(
                "page_size must be a power of two >= {}, got {}",
                page::MIN_PAGE_SIZE,
                self.page_size
            )));
        }
        let unit = self.page_size * self.instances;
        if self.pool_size_bytes == 0 || self.pool_size_bytes % unit != 0 {
            return Err(BrasaError::Config(format!(
                "pool_size_bytes must be a non-zero multiple of page_size * instances ({unit})"
            )));
        }
        if self.frames_per_instance() < 4 {
            return Err(BrasaError::Config(
                "each instance needs at least 4 frames".into(),
            ));
        }
        if !self.page_hash_stripes.is_power_of_two() || self.page_hash_stripes > 1024 {
            return Err(BrasaError::Config(format!(
                "page_hash_stripes must be a power of two <= 1024, got {}",
                self.page_hash_stripes
            )));
        }
        if !(5..=95).contains(&self.old_blocks_pct) {
            return Err(BrasaError::Config(format!(
                "old_blocks_pct must be in 5..=95, got {}",
                self.old_blocks_pct
            )));
        }
        if self.watch_size == 0 {
            return Err(BrasaError::Config("watch_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn frames_per_instance(&self) -> usize {
        self.pool_size_bytes / self.page_size / self.instances
    }

    /// Old-region length target as a ratio over `LRU_OLD_RATIO_DIV`.
    pub(crate) fn lru_old_ratio(&self) -> usize {
        self.old_blocks_pct as usize * LRU_OLD_RATIO_DIV / 100
    }
}

/// Cumulative per-instance counters. All relaxed: heuristics, not barriers.
#[derive(Debug, Default)]
pub struct PoolStat {
    pub n_page_gets: AtomicU64,
    pub n_pages_read: AtomicU64,
    pub n_pages_written: AtomicU64,
    pub n_pages_created: AtomicU64,
    pub n_ra_pages_read_rnd: AtomicU64,
    pub n_ra_pages_read: AtomicU64,
    pub n_ra_pages_evicted: AtomicU64,
    pub n_pages_made_young: AtomicU64,
    pub n_pages_not_made_young: AtomicU64,
}

impl PoolStat {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStatSnapshot {
        PoolStatSnapshot {
            n_page_gets: self.n_page_gets.load(Ordering::Relaxed),
            n_pages_read: self.n_pages_read.load(Ordering::Relaxed),
            n_pages_written: self.n_pages_written.load(Ordering::Relaxed),
            n_pages_created: self.n_pages_created.load(Ordering::Relaxed),
            n_ra_pages_read_rnd: self.n_ra_pages_read_rnd.load(Ordering::Relaxed),
            n_ra_pages_read: self.n_ra_pages_read.load(Ordering::Relaxed),
            n_ra_pages_evicted: self.n_ra_pages_evicted.load(Ordering::Relaxed),
            n_pages_made_young: self.n_pages_made_young.load(Ordering::Relaxed),
            n_pages_not_made_young: self.n_pages_not_made_young.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStatSnapshot {
    pub n_page_gets: u64,
    pub n_pages_read: u64,
    pub n_pages_written: u64,
    pub n_pages_created: u64,
    pub n_ra_pages_read_rnd: u64,
    pub n_ra_pages_read: u64,
    pub n_ra_pages_evicted: u64,
    pub n_pages_made_young: u64,
    pub n_pages_not_made_young: u64,
}

/// Point-in-time view of one instance, with per-second rates derived from
/// the previous `refresh_io_stats` snapshot.
#[derive(Clone, Debug, Default)]
pub struct PoolInfo {
    pub instance_no: u32,
    pub pool_size_pages: usize,
    pub lru_len: usize,
    pub old_lru_len: usize,
    pub unzip_lru_len: usize,
    pub free_list_len: usize,
    pub flush_list_len: usize,
    pub lru_bytes: usize,
    pub flush_list_bytes: usize,
    pub n_pend_reads: usize,
    pub n_pend_unzip: usize,
    pub n_pending_flush_lru: usize,
    pub n_pending_flush_list: usize,
    pub n_pending_flush_single_page: usize,
    pub stat: PoolStatSnapshot,
    pub pages_read_rate: f64,
    pub pages_written_rate: f64,
    pub pages_created_rate: f64,
    pub page_made_young_rate: f64,
    pub page_not_made_young_rate: f64,
    pub n_page_get_delta: u64,
}

/// All buffer pool instances; routes by page address.
pub struct BufferPools {
    instances: Vec<Arc<BufferPool>>,
    options: PoolOptions,
}

impl BufferPools {
    pub fn new(
        options: PoolOptions,
        sync: Arc<WaitArrays>,
        spaces: Arc<TablespaceManager>,
    ) -> Result<Self> {
        options.validate()?;
        let epoch = Instant::now();
        let instances = (0..options.instances)
            .map(|i| BufferPool::new(i as u32, options.clone(), Arc::clone(&sync), Arc::clone(&spaces), epoch))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { instances, options })
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn instances(&self) -> &[Arc<BufferPool>] {
        &self.instances
    }

    pub fn instance(&self, instance_no: usize) -> &Arc<BufferPool> {
        &self.instances[instance_no]
    }

    pub fn instance_for(&self, id: PageId) -> &Arc<BufferPool> {
        let fold = id.fold() as usize;
        &self.instances[fold % self.instances.len()]
    }

    /// General page acquisition; see `BufferPool::get`.
    pub fn get(
        &self,
        id: PageId,
        zip_size: usize,
        latch: LatchMode,
        guess: Option<&Arc<Block>>,
        mode: GetMode,
        mtr: &mut MiniTxn,
    ) -> Result<Option<PageHandle>> {
        self.instance_for(id).get(id, zip_size, latch, guess, mode, mtr)
    }

    /// Buffer-fixes a page with no latch.
    pub fn get_no_latch(
        &self,
        id: PageId,
        mtr: &mut MiniTxn,
    ) -> Result<Option<PageHandle>> {
        self.instance_for(id)
            .get(id, 0, LatchMode::NoLatch, None, GetMode::GetNoLatch, mtr)
    }

    /// Tries to get a page without I/O; `None` when not resident.
    pub fn try_get(
        &self,
        id: PageId,
        latch: LatchMode,
        mtr: &mut MiniTxn,
    ) -> Result<Option<PageHandle>> {
        self.instance_for(id)
            .get(id, 0, latch, None, GetMode::GetIfInPool, mtr)
    }

    /// Initializes a page in the pool without reading it; see
    /// `BufferPool::create`.
    pub fn create(
        &self,
        id: PageId,
        zip_size: usize,
        mtr: &mut MiniTxn,
    ) -> Result<PageHandle> {
        self.instance_for(id).create(id, zip_size, mtr)
    }

    pub fn get_zip(&self, id: PageId, zip_size: usize) -> Result<Option<Arc<Block>>> {
        self.instance_for(id).get_zip(id, zip_size)
    }

    pub fn release_zip(&self, block: &Arc<Block>) {
        self.instances[block.instance_no() as usize].release_zip(block);
    }

    /// Installs a watch; returns false when the page is already resident.
    pub fn watch_set(&self, id: PageId) -> Result<bool> {
        self.instance_for(id).watch_set(id)
    }

    /// Optimistic re-access through a prior block pointer; see
    /// `BufferPool::optimistic`.
    pub fn optimistic(
        &self,
        block: &Arc<Block>,
        modify_clock: u64,
        latch: LatchMode,
        mtr: &mut MiniTxn,
    ) -> Result<Option<PageHandle>> {
        self.instances[block.instance_no() as usize].optimistic(block, modify_clock, latch, mtr)
    }

    /// Non-blocking access to a known resident block.
    pub fn get_known_nowait(
        &self,
        block: &Arc<Block>,
        latch: LatchMode,
        nowait_mode: NowaitMode,
        mtr: &mut MiniTxn,
    ) -> Result<Option<PageHandle>> {
        self.instances[block.instance_no() as usize]
            .get_known_nowait(block, latch, nowait_mode, mtr)
    }

    pub fn watch_unset(&self, id: PageId) -> Result<()> {
        self.instance_for(id).watch_unset(id)
    }

    pub fn watch_occurred(&self, id: PageId) -> Result<bool> {
        self.instance_for(id).watch_occurred(id)
    }

    /// Page-hash membership; the page may still be under read I/O.
    pub fn peek(&self, id: PageId) -> bool {
        self.instance_for(id).peek(id)
    }

    pub fn make_young(&self, block: &Arc<Block>) {
        self.instances[block.instance_no() as usize].make_young(block);
    }

    /// Smallest `oldest_modification` over every instance; zero when all
    /// pages are clean.
    pub fn oldest_modification(&self) -> Lsn {
        let mut oldest = Lsn::ZERO;
        for pool in &self.instances {
            let candidate = pool.oldest_modification();
            if !candidate.is_zero() && (oldest.is_zero() || candidate < oldest) {
                oldest = candidate;
            }
        }
        oldest
    }

    /// Runs a list-type flush batch on every instance.
    pub fn flush_lists(&self, limit_lsn: Option<Lsn>, max_per_instance: usize) -> Result<usize> {
        let mut flushed = 0;
        for pool in &self.instances {
            flushed += pool.flush_batch(FlushType::List, limit_lsn, max_per_instance)?;
        }
        Ok(flushed)
    }

    /// Waits until no flush of the given type is running anywhere.
    pub fn wait_for_no_flush(&self, flush_type: FlushType) {
        for pool in &self.instances {
            pool.wait_for_no_flush(flush_type);
        }
    }

    pub fn infos(&self) -> Vec<PoolInfo> {
        self.instances.iter().map(|p| p.info()).collect()
    }

    /// Snapshot with per-second rates since the previous refresh.
    pub fn refresh_io_stats(&self) -> Vec<PoolInfo> {
        self.instances.iter().map(|p| p.refresh_io_stats()).collect()
    }

    /// Debug walk of every instance's lists against the state invariants.
    pub fn validate(&self) {
        for pool in &self.instances {
            pool.validate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        PoolOptions::default().validate().unwrap();
    }

    #[test]
    fn option_bounds_are_enforced() {
        let mut o = PoolOptions::default();
        o.instances = 0;
        assert!(o.validate().is_err());
        o.instances = 65;
        assert!(o.validate().is_err());

        let mut o = PoolOptions::default();
        o.page_size = 1000;
        assert!(o.validate().is_err());

        let mut o = PoolOptions::default();
        o.pool_size_bytes += 1;
        assert!(o.validate().is_err());

        let mut o = PoolOptions::default();
        o.old_blocks_pct = 4;
        assert!(o.validate().is_err());

        let mut o = PoolOptions::default();
        o.page_hash_stripes = 12;
        assert!(o.validate().is_err());
    }

    #[test]
    fn old_ratio_tracks_percentage() {
        let mut o = PoolOptions::default();
        o.old_blocks_pct = 37;
        assert_eq!(o.lru_old_ratio(), 378);
        o.old_blocks_pct = 50;
        assert_eq!(o.lru_old_ratio(), 512);
    }
}
