#![forbid(unsafe_code)]

//! The storage engine context: one object owning the buffer pool
//! instances, the wait arrays and the tablespace registry, plus the
//! background monitor (missed-signal sweep and long-wait reporting) and
//! list flusher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::{BrasaError, Result};
use crate::pool::{BufferPools, FlushType, PoolOptions};
use crate::primitives::sync::wait_array::{WaitArrayOptions, WaitArrays};
use crate::tablespace::TablespaceManager;
use crate::types::Lsn;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub pool: PoolOptions,
    /// Number of independent wait sub-arrays.
    pub sync_array_size: usize,
    /// Upper bound on threads that may wait simultaneously; sizes the wait
    /// arrays.
    pub max_threads: usize,
    /// Age at which a semaphore wait is reported.
    pub long_wait_warn: Duration,
    /// Age at which the monitor flags the engine as fatally stuck.
    pub fatal_semaphore_wait_threshold: Duration,
    /// Cadence of the monitor thread.
    pub monitor_interval: Duration,
    /// Cadence of the background list flusher.
    pub flusher_interval: Duration,
    /// Pages per instance and flusher pass.
    pub flusher_batch_pages: usize,
    /// Spawn the monitor and flusher threads.
    pub background_threads: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolOptions::default(),
            sync_array_size: 1,
            max_threads: 64,
            long_wait_warn: Duration::from_secs(240),
            fatal_semaphore_wait_threshold: Duration::from_secs(600),
            monitor_interval: Duration::from_secs(1),
            flusher_interval: Duration::from_millis(200),
            flusher_batch_pages: 64,
            background_threads: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        if self.sync_array_size == 0 {
            return Err(BrasaError::Config("sync_array_size must be non-zero".into()));
        }
        if self.max_threads == 0 {
            return Err(BrasaError::Config("max_threads must be non-zero".into()));
        }
        Ok(())
    }
}

pub struct StorageEngine {
    config: EngineConfig,
    sync: Arc<WaitArrays>,
    spaces: Arc<TablespaceManager>,
    pools: Arc<BufferPools>,
    fatal: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
    flusher: Option<JoinHandle<()>>,
}

impl StorageEngine {
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let sync = Arc::new(WaitArrays::new(
            config.sync_array_size,
            config.max_threads,
            WaitArrayOptions {
                long_wait_warn: config.long_wait_warn,
                fatal_threshold: config.fatal_semaphore_wait_threshold,
            },
        ));
        let spaces = Arc::new(TablespaceManager::new(config.pool.page_size));
        let pools = Arc::new(BufferPools::new(
            config.pool.clone(),
            Arc::clone(&sync),
            Arc::clone(&spaces),
        )?);
        let fatal = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut engine = Self {
            config,
            sync,
            spaces,
            pools,
            fatal,
            shutdown,
            monitor: None,
            flusher: None,
        };
        if engine.config.background_threads {
            engine.monitor = Some(engine.spawn_monitor());
            engine.flusher = Some(engine.spawn_flusher());
        }
        info!(
            instances = engine.config.pool.instances,
            pool_bytes = engine.config.pool.pool_size_bytes,
            "storage engine open"
        );
        Ok(engine)
    }

    pub fn sync_arrays(&self) -> &Arc<WaitArrays> {
        &self.sync
    }

    pub fn tablespaces(&self) -> &Arc<TablespaceManager> {
        &self.spaces
    }

    pub fn buffer_pools(&self) -> &Arc<BufferPools> {
        &self.pools
    }

    /// Set when a semaphore wait exceeded the fatal threshold; the embedder
    /// decides whether to abort.
    pub fn fatal_semaphore_wait(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    /// Flushes every instance's dirty pages below `limit_lsn`, then waits
    /// for the writes to settle.
    pub fn checkpoint(&self, limit_lsn: Option<Lsn>) -> Result<usize> {
        let flushed = self.pools.flush_lists(limit_lsn, usize::MAX)?;
        self.pools.wait_for_no_flush(FlushType::List);
        Ok(flushed)
    }

    fn spawn_monitor(&self) -> JoinHandle<()> {
        let sync = Arc::clone(&self.sync);
        let fatal = Arc::clone(&self.fatal);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.monitor_interval;
        std::thread::Builder::new()
            .name("brasa-monitor".into())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    sync.wake_threads_if_sema_free();
                    let report = sync.print_long_waits();
                    if report.fatal && !fatal.swap(true, Ordering::AcqRel) {
                        error!(
                            longest_wait_secs = report.longest_wait.as_secs(),
                            waiter = report.waiter,
                            "semaphore wait exceeded the fatal threshold"
                        );
                    }
                    sleep_interruptibly(&shutdown, interval);
                }
            })
            .expect("spawn monitor thread")
    }

    fn spawn_flusher(&self) -> JoinHandle<()> {
        let pools = Arc::clone(&self.pools);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.flusher_interval;
        let batch = self.config.flusher_batch_pages;
        std::thread::Builder::new()
            .name("brasa-flusher".into())
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    if let Err(err) = pools.flush_lists(None, batch) {
                        warn!(error = %err, "background flush pass failed");
                    }
                    sleep_interruptibly(&shutdown, interval);
                }
            })
            .expect("spawn flusher thread")
    }

    /// Stops the background threads and flushes everything dirty.
    pub fn shutdown(mut self) -> Result<usize> {
        self.stop_threads();
        let flushed = self.checkpoint(None)?;
        info!(flushed, "storage engine shut down");
        Ok(flushed)
    }

    fn stop_threads(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

fn sleep_interruptibly(shutdown: &AtomicBool, total: Duration) {
    let step = Duration::from_millis(20);
    let mut slept = Duration::ZERO;
    while slept < total {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let next = step.min(total - slept);
        std::thread::sleep(next);
        slept += next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation_covers_subsections() {
        EngineConfig::default().validate().unwrap();

        let mut config = EngineConfig::default();
        config.sync_array_size = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.pool.instances = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn engine_opens_and_shuts_down_clean() {
        let mut config = EngineConfig::default();
        config.pool.pool_size_bytes = 64 * crate::types::page::MIN_PAGE_SIZE;
        config.pool.page_size = crate::types::page::MIN_PAGE_SIZE;
        config.pool.lru_old_min_len = 8;
        config.background_threads = true;
        config.flusher_interval = Duration::from_millis(20);

        let engine = StorageEngine::open(config).unwrap();
        assert!(!engine.fatal_semaphore_wait());
        assert_eq!(engine.buffer_pools().instances().len(), 1);
        let flushed = engine.shutdown().unwrap();
        assert_eq!(flushed, 0);
    }
}
