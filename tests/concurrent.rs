use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use brasa::pool::{FlushType, NowaitMode};
use brasa::types::page;
use brasa::{BrasaError, EngineConfig, GetMode, LatchMode, Lsn, MiniTxn, PageId, StorageEngine};

const SPACE: u32 = 3;
const PAGE_SIZE: usize = page::MIN_PAGE_SIZE;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn engine(frames: usize, background: bool) -> (tempfile::TempDir, StorageEngine) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.pool.page_size = PAGE_SIZE;
    config.pool.pool_size_bytes = frames * PAGE_SIZE;
    config.pool.lru_old_min_len = 8;
    config.pool.lru_scan_depth = 64;
    config.pool.old_blocks_time_ms = 0;
    config.background_threads = background;
    config.flusher_interval = Duration::from_millis(20);
    let engine = StorageEngine::open(config).unwrap();
    engine
        .tablespaces()
        .create(SPACE, dir.path().join("space.ibd"), 0, None)
        .unwrap();
    (dir, engine)
}

#[test]
fn concurrent_readers_share_one_page() {
    const THREADS: usize = 8;
    let (_dir, engine) = engine(16, false);
    let pools = Arc::clone(engine.buffer_pools());
    let barrier = Arc::new(Barrier::new(THREADS));

    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let pools = Arc::clone(&pools);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for _ in 0..50 {
                let mut mtr = MiniTxn::new();
                let page = pools
                    .get(
                        PageId::new(SPACE, 1),
                        0,
                        LatchMode::Shared,
                        None,
                        GetMode::Get,
                        &mut mtr,
                    )
                    .unwrap()
                    .unwrap();
                assert_eq!(mtr.block(page).page_id(), Some(PageId::new(SPACE, 1)));
                mtr.commit(Lsn::ZERO);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let pool = pools.instance_for(PageId::new(SPACE, 1));
    let stat = pool.stats().snapshot();
    assert_eq!(stat.n_pages_read, 1, "one disk read feeds every thread");
    assert_eq!(stat.n_page_gets, (THREADS * 50) as u64);
    pools.validate();
    assert_eq!(engine.sync_arrays().n_reserved(), 0);
}

#[test]
fn writers_serialize_on_the_page_latch() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 25;
    let (_dir, engine) = engine(16, false);
    let pools = Arc::clone(engine.buffer_pools());
    let barrier = Arc::new(Barrier::new(THREADS));

    // Seed the counter page.
    {
        let mut mtr = MiniTxn::new();
        let page_handle = pools.create(PageId::new(SPACE, 9), 0, &mut mtr).unwrap();
        mtr.frame_mut(page_handle)[page::PAGE_DATA..page::PAGE_DATA + 8]
            .copy_from_slice(&0u64.to_be_bytes());
        mtr.commit(Lsn(1));
    }

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let pools = Arc::clone(&pools);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for round in 0..ROUNDS {
                let mut mtr = MiniTxn::new();
                let page_handle = pools
                    .get(
                        PageId::new(SPACE, 9),
                        0,
                        LatchMode::Exclusive,
                        None,
                        GetMode::Get,
                        &mut mtr,
                    )
                    .unwrap()
                    .unwrap();
                let frame = mtr.frame_mut(page_handle);
                let mut counter = [0u8; 8];
                counter.copy_from_slice(&frame[page::PAGE_DATA..page::PAGE_DATA + 8]);
                let next = u64::from_be_bytes(counter) + 1;
                frame[page::PAGE_DATA..page::PAGE_DATA + 8].copy_from_slice(&next.to_be_bytes());
                mtr.commit(Lsn((t * ROUNDS + round + 2) as u64));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let mut mtr = MiniTxn::new();
    let page_handle = pools
        .get(
            PageId::new(SPACE, 9),
            0,
            LatchMode::Shared,
            None,
            GetMode::Get,
            &mut mtr,
        )
        .unwrap()
        .unwrap();
    let frame = mtr.frame(page_handle);
    let mut counter = [0u8; 8];
    counter.copy_from_slice(&frame[page::PAGE_DATA..page::PAGE_DATA + 8]);
    assert_eq!(u64::from_be_bytes(counter), (THREADS * ROUNDS) as u64);
    mtr.commit(Lsn::ZERO);

    engine.checkpoint(None).unwrap();
    pools.validate();
}

#[test]
fn cache_churn_across_threads_stays_consistent() {
    const THREADS: usize = 4;
    let (_dir, engine) = engine(8, true);
    let pools = Arc::clone(engine.buffer_pools());
    let barrier = Arc::new(Barrier::new(THREADS));

    let mut handles = Vec::new();
    for t in 0..THREADS as u32 {
        let pools = Arc::clone(&pools);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for page_no in 0..40u32 {
                let id = PageId::new(SPACE, (page_no * (t + 1)) % 24);
                let mut mtr = MiniTxn::new();
                let got = pools
                    .get(id, 0, LatchMode::Exclusive, None, GetMode::Get, &mut mtr)
                    .unwrap()
                    .unwrap();
                let frame = mtr.frame_mut(got);
                frame[page::PAGE_DATA] = frame[page::PAGE_DATA].wrapping_add(1);
                mtr.commit(Lsn((t as u64) * 100 + page_no as u64 + 1));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    engine.checkpoint(None).unwrap();
    pools.wait_for_no_flush(FlushType::List);
    pools.validate();
    assert_eq!(pools.oldest_modification(), Lsn::ZERO);
    assert_eq!(engine.sync_arrays().n_reserved(), 0);
}

#[test]
fn watch_notices_a_concurrent_load() {
    let (_dir, engine) = engine(16, false);
    let pools = Arc::clone(engine.buffer_pools());
    let id = PageId::new(SPACE, 42);

    assert!(pools.watch_set(id).unwrap());
    assert!(!pools.watch_occurred(id).unwrap());

    let loader = {
        let pools = Arc::clone(&pools);
        thread::spawn(move || {
            let mut mtr = MiniTxn::new();
            pools
                .get(id, 0, LatchMode::Shared, None, GetMode::Get, &mut mtr)
                .unwrap()
                .unwrap();
            mtr.commit(Lsn::ZERO);
        })
    };
    loader.join().unwrap();

    assert!(pools.watch_occurred(id).unwrap());
    pools.watch_unset(id).unwrap();
    pools.validate();
}

#[test]
fn nowait_access_under_eviction_pressure() {
    let (_dir, engine) = engine(8, false);
    let pools = Arc::clone(engine.buffer_pools());
    let id = PageId::new(SPACE, 5);

    let mut mtr = MiniTxn::new();
    let page_handle = pools
        .get(id, 0, LatchMode::Shared, None, GetMode::Get, &mut mtr)
        .unwrap()
        .unwrap();
    let block = Arc::clone(mtr.block(page_handle));
    mtr.commit(Lsn::ZERO);

    let mut mtr = MiniTxn::new();
    let again = pools
        .get_known_nowait(&block, LatchMode::Shared, NowaitMode::KeepOld, &mut mtr)
        .unwrap();
    assert!(again.is_some());
    mtr.commit(Lsn::ZERO);

    // Push enough pages through to evict page 5; the stale pointer must
    // then be refused.
    for page_no in 100..140 {
        let mut mtr = MiniTxn::new();
        pools
            .get(
                PageId::new(SPACE, page_no),
                0,
                LatchMode::Shared,
                None,
                GetMode::Get,
                &mut mtr,
            )
            .unwrap()
            .unwrap();
        mtr.commit(Lsn::ZERO);
    }
    if !pools.peek(id) {
        let mut mtr = MiniTxn::new();
        assert!(pools
            .get_known_nowait(&block, LatchMode::Shared, NowaitMode::KeepOld, &mut mtr)
            .unwrap()
            .is_none());
    }
    pools.validate();
}

#[test]
fn get_if_in_pool_does_no_io() {
    let (_dir, engine) = engine(8, false);
    let pools = Arc::clone(engine.buffer_pools());
    let id = PageId::new(SPACE, 77);

    let mut mtr = MiniTxn::new();
    assert!(pools
        .try_get(id, LatchMode::Shared, &mut mtr)
        .unwrap()
        .is_none());
    let pool = pools.instance_for(id);
    assert_eq!(pool.stats().snapshot().n_pages_read, 0);

    let mut mtr = MiniTxn::new();
    pools
        .get(id, 0, LatchMode::Shared, None, GetMode::Get, &mut mtr)
        .unwrap()
        .unwrap();
    mtr.commit(Lsn::ZERO);

    let mut mtr = MiniTxn::new();
    assert!(pools
        .try_get(id, LatchMode::Shared, &mut mtr)
        .unwrap()
        .is_some());
    mtr.commit(Lsn::ZERO);
    assert_eq!(pool.stats().snapshot().n_pages_read, 1);
}

#[test]
fn deleted_tablespace_surfaces_cleanly() {
    let (_dir, engine) = engine(8, false);
    let pools = Arc::clone(engine.buffer_pools());
    engine.tablespaces().drop_space(SPACE);

    let mut mtr = MiniTxn::new();
    let err = pools
        .get(
            PageId::new(SPACE, 1),
            0,
            LatchMode::Shared,
            None,
            GetMode::Get,
            &mut mtr,
        )
        .unwrap_err();
    assert!(matches!(err, BrasaError::TablespaceDeleted(SPACE)));
}
