//! The wait array: every contended latch reserves a cell here before
//! suspending, giving the engine one place to observe blocked threads, wake
//! missed signals, report long waits and (in debug builds) detect deadlocks.

use std::panic::Location;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{BrasaError, Result};
use crate::primitives::event::Event;
use crate::primitives::sync::{MutexCore, RequestType, RwLockCore, NO_THREAD};

/// Count of signal deliveries across all latches in the process.
static SIGNAL_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn object_signalled() {
    SIGNAL_COUNT.fetch_add(1, Ordering::Relaxed);
}

pub fn signalled_count() -> u64 {
    SIGNAL_COUNT.load(Ordering::Relaxed)
}

/// The primitive a waiting thread is suspended on.
#[derive(Clone)]
pub enum WaitObject {
    Mutex(Arc<MutexCore>),
    RwLock(Arc<RwLockCore>),
}

impl WaitObject {
    pub(crate) fn event_for(&self, request: RequestType) -> &Event {
        match self {
            WaitObject::Mutex(core) => core.event(),
            WaitObject::RwLock(core) => match request {
                RequestType::RwWaitExclusive => core.wait_ex_event(),
                _ => core.event(),
            },
        }
    }

    pub fn addr(&self) -> usize {
        match self {
            WaitObject::Mutex(core) => Arc::as_ptr(core) as usize,
            WaitObject::RwLock(core) => Arc::as_ptr(core) as usize,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WaitObject::Mutex(core) => core.name(),
            WaitObject::RwLock(core) => core.name(),
        }
    }

    fn can_wake(&self, request: RequestType) -> bool {
        match self {
            WaitObject::Mutex(core) => core.is_free(),
            WaitObject::RwLock(core) => core.can_satisfy(request),
        }
    }
}

struct Cell {
    target: Option<WaitObject>,
    request: RequestType,
    file: &'static str,
    line: u32,
    thread: u64,
    waiting: bool,
    signal_count: u64,
    reserved_at: Option<Instant>,
}

impl Cell {
    fn empty() -> Self {
        Self {
            target: None,
            request: RequestType::Mutex,
            file: "",
            line: 0,
            thread: NO_THREAD,
            waiting: false,
            signal_count: 0,
            reserved_at: None,
        }
    }
}

struct SyncArrayInner {
    cells: Vec<Cell>,
    n_reserved: usize,
    res_count: u64,
}

impl SyncArrayInner {
    fn find_thread(&self, thread: u64) -> Option<usize> {
        self.cells
            .iter()
            .position(|c| c.target.is_some() && c.thread == thread)
    }
}

/// One sub-array with its own OS mutex. The mutex is deliberately a plain
/// `parking_lot::Mutex`: the wait array underpins `WaitMutex`, so it cannot
/// block through itself.
struct SyncArray {
    inner: Mutex<SyncArrayInner>,
}

impl SyncArray {
    fn new(n_cells: usize) -> Self {
        Self {
            inner: Mutex::new(SyncArrayInner {
                cells: (0..n_cells).map(|_| Cell::empty()).collect(),
                n_reserved: 0,
                res_count: 0,
            }),
        }
    }
}

/// Thresholds for the long-wait reporter.
#[derive(Clone, Copy, Debug)]
pub struct WaitArrayOptions {
    /// Age after which a wait is reported as suspicious.
    pub long_wait_warn: Duration,
    /// Age after which the report flags a fatal condition.
    pub fatal_threshold: Duration,
}

impl Default for WaitArrayOptions {
    fn default() -> Self {
        Self {
            long_wait_warn: Duration::from_secs(240),
            fatal_threshold: Duration::from_secs(600),
        }
    }
}

/// Result of one `print_long_waits` pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct LongWaitReport {
    pub noticed: bool,
    pub fatal: bool,
    pub longest_wait: Duration,
    /// Thread id of the longest waiter.
    pub waiter: Option<u64>,
    /// Address of the longest-waited-for primitive.
    pub sema: Option<usize>,
}

/// One row of the semaphore-waits introspection view.
#[derive(Clone, Debug)]
pub struct SemaphoreWaitRow {
    pub thread_id: u64,
    pub file: &'static str,
    pub line: u32,
    pub wait_time: Duration,
    pub object_addr: usize,
    pub object_name: &'static str,
    pub wait_type: RequestType,
    pub holder_thread_id: Option<u64>,
    pub holder_file: Option<&'static str>,
    pub holder_line: Option<u32>,
    pub waiters_flag: u32,
    pub lock_word: i64,
    pub reader_count: Option<u32>,
    pub last_reader_file: Option<&'static str>,
    pub last_reader_line: Option<u32>,
    pub last_writer_file: Option<&'static str>,
    pub last_writer_line: Option<u32>,
    pub os_wait_count: u64,
}

/// The set of wait sub-arrays; `reserve` round-robins across them.
pub struct WaitArrays {
    arrays: Vec<SyncArray>,
    next: AtomicUsize,
    options: WaitArrayOptions,
}

impl WaitArrays {
    /// `n_arrays` independent sub-arrays sharing `max_threads` cells.
    pub fn new(n_arrays: usize, max_threads: usize, options: WaitArrayOptions) -> Self {
        let n_arrays = n_arrays.max(1);
        let n_cells = 1 + (max_threads.max(1) - 1) / n_arrays;
        Self {
            arrays: (0..n_arrays).map(|_| SyncArray::new(n_cells)).collect(),
            next: AtomicUsize::new(0),
            options,
        }
    }

    fn pick(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.arrays.len()
    }

    /// Reserves a cell for a wait on `target`. The target's event is reset
    /// and its signal count captured, so a signal delivered between this
    /// call and the `wait` makes the wait return immediately.
    pub(crate) fn reserve<'a>(
        &'a self,
        target: WaitObject,
        request: RequestType,
        loc: &'static Location<'static>,
    ) -> Result<Reservation<'a>> {
        let array_index = self.pick();
        let array = &self.arrays[array_index];
        let cell_index = {
            let mut inner = array.inner.lock();
            inner.res_count += 1;
            let Some(index) = inner.cells.iter().position(|c| c.target.is_none()) else {
                return Err(BrasaError::NoFreeCell);
            };
            let cell = &mut inner.cells[index];
            cell.target = Some(target.clone());
            cell.request = request;
            cell.file = loc.file();
            cell.line = loc.line();
            cell.thread = super::current_thread_id();
            cell.waiting = false;
            inner.n_reserved += 1;
            index
        };
        // Outside the array mutex, like all event state changes.
        let signal_count = target.event_for(request).reset();
        let now = Instant::now();
        {
            let mut inner = array.inner.lock();
            let cell = &mut inner.cells[cell_index];
            cell.signal_count = signal_count;
            cell.reserved_at = Some(now);
        }
        Ok(Reservation {
            owner: self,
            slot: Some((array_index, cell_index)),
        })
    }

    fn free_cell(&self, array_index: usize, cell_index: usize) {
        let mut inner = self.arrays[array_index].inner.lock();
        let cell = &mut inner.cells[cell_index];
        debug_assert!(cell.target.is_some());
        cell.target = None;
        cell.waiting = false;
        cell.signal_count = 0;
        cell.reserved_at = None;
        inner.n_reserved -= 1;
    }

    /// Number of currently reserved cells across all sub-arrays.
    pub fn n_reserved(&self) -> usize {
        self.arrays
            .iter()
            .map(|a| a.inner.lock().n_reserved)
            .sum()
    }

    /// Reservations since startup.
    pub fn reservation_count(&self) -> u64 {
        self.arrays.iter().map(|a| a.inner.lock().res_count).sum()
    }

    /// Checks that the reserved-cell count matches the bookkeeping.
    pub fn validate(&self) {
        for array in &self.arrays {
            let inner = array.inner.lock();
            let count = inner.cells.iter().filter(|c| c.target.is_some()).count();
            assert_eq!(count, inner.n_reserved);
        }
    }

    /// Periodic sweep: signal any reserved cell whose primitive is
    /// observably free. There is a race with the release path flipping the
    /// lock word before signalling, so this sometimes wakes threads when
    /// nothing went wrong; the woken thread simply re-checks.
    pub fn wake_threads_if_sema_free(&self) {
        for array in &self.arrays {
            let inner = array.inner.lock();
            let mut seen = 0;
            for cell in &inner.cells {
                if seen >= inner.n_reserved {
                    break;
                }
                if let Some(target) = &cell.target {
                    seen += 1;
                    if target.can_wake(cell.request) {
                        target.event_for(cell.request).set();
                        object_signalled();
                    }
                }
            }
        }
    }

    /// Reports waits older than the warn threshold and walks the owner
    /// chain of each, so a stuck writer's own wait shows up in the log.
    pub fn print_long_waits(&self) -> LongWaitReport {
        let mut report = LongWaitReport::default();
        let now = Instant::now();
        for array in &self.arrays {
            let inner = array.inner.lock();
            for cell in &inner.cells {
                let Some(target) = &cell.target else {
                    continue;
                };
                if !cell.waiting {
                    continue;
                }
                let Some(reserved_at) = cell.reserved_at else {
                    continue;
                };
                let age = now.saturating_duration_since(reserved_at);
                if age > self.options.long_wait_warn {
                    warn!(
                        thread = cell.thread,
                        file = cell.file,
                        line = cell.line,
                        wait_secs = age.as_secs_f64(),
                        object = %format_args!("{:#x}", target.addr()),
                        "long semaphore wait"
                    );
                    self.print_cell(cell);
                    report.noticed = true;
                }
                if age > self.options.fatal_threshold {
                    report.fatal = true;
                }
                if age > report.longest_wait {
                    report.longest_wait = age;
                    report.waiter = Some(cell.thread);
                    report.sema = Some(target.addr());
                }
            }
            if report.noticed {
                self.print_waiter_chains(&inner, now);
            }
        }
        report
    }

    fn print_cell(&self, cell: &Cell) {
        let Some(target) = &cell.target else {
            return;
        };
        match target {
            WaitObject::Mutex(core) => {
                let (file, line) = core.locked_at().unwrap_or(("", 0));
                warn!(
                    name = core.name(),
                    lock_word = core.lock_word(),
                    holder = core.owner_thread(),
                    holder_file = file,
                    holder_line = line,
                    waiters = core.waiters(),
                    os_waits = core.os_wait_count(),
                    "  waiting on mutex"
                );
            }
            WaitObject::RwLock(core) => {
                let (sfile, sline) = core.last_read_locked_at().unwrap_or(("", 0));
                let (xfile, xline) = core.last_write_locked_at().unwrap_or(("", 0));
                warn!(
                    name = core.name(),
                    mode = cell.request.as_str(),
                    lock_word = core.lock_word(),
                    readers = core.reader_count(),
                    writer = core.writer_thread(),
                    waiters = core.waiters(),
                    last_read = %format_args!("{sfile}:{sline}"),
                    last_write = %format_args!("{xfile}:{xline}"),
                    os_waits = core.os_wait_count(),
                    "  waiting on rw-latch"
                );
            }
        }
    }

    /// For each long-waiting cell whose rw-latch has a writer, follows the
    /// writer's own wait, and so on. Bounded to guard against cycles.
    fn print_waiter_chains(&self, inner: &SyncArrayInner, now: Instant) {
        for cell in &inner.cells {
            let Some(WaitObject::RwLock(core)) = &cell.target else {
                continue;
            };
            if !cell.waiting {
                continue;
            }
            let age = cell
                .reserved_at
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or_default();
            if age <= self.options.long_wait_warn {
                continue;
            }
            let mut holder = core.writer_thread();
            let mut hops = 0usize;
            while holder != NO_THREAD {
                let Some(index) = inner.find_thread(holder) else {
                    break;
                };
                let next = &inner.cells[index];
                if !next.waiting {
                    break;
                }
                warn!(
                    thread = holder,
                    file = next.file,
                    line = next.line,
                    "  holder is itself waiting"
                );
                self.print_cell(next);
                holder = match &next.target {
                    Some(WaitObject::RwLock(c)) => c.writer_thread(),
                    _ => NO_THREAD,
                };
                if holder == next.thread {
                    break;
                }
                hops += 1;
                if hops > 100 {
                    warn!("  too many waiting threads, stopping the walk");
                    break;
                }
            }
        }
    }

    /// Rows for the semaphore-waits introspection view.
    pub fn semaphore_waits(&self) -> Vec<SemaphoreWaitRow> {
        let now = Instant::now();
        let mut rows = Vec::new();
        for array in &self.arrays {
            let inner = array.inner.lock();
            for cell in &inner.cells {
                let Some(target) = &cell.target else {
                    continue;
                };
                if !cell.waiting {
                    continue;
                }
                let wait_time = cell
                    .reserved_at
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or_default();
                let row = match target {
                    WaitObject::Mutex(core) => {
                        let holder_site = core.locked_at();
                        SemaphoreWaitRow {
                            thread_id: cell.thread,
                            file: cell.file,
                            line: cell.line,
                            wait_time,
                            object_addr: target.addr(),
                            object_name: core.name(),
                            wait_type: cell.request,
                            holder_thread_id: match core.owner_thread() {
                                NO_THREAD => None,
                                t => Some(t),
                            },
                            holder_file: holder_site.map(|s| s.0),
                            holder_line: holder_site.map(|s| s.1),
                            waiters_flag: core.waiters(),
                            lock_word: core.lock_word() as i64,
                            reader_count: None,
                            last_reader_file: None,
                            last_reader_line: None,
                            last_writer_file: None,
                            last_writer_line: None,
                            os_wait_count: core.os_wait_count(),
                        }
                    }
                    WaitObject::RwLock(core) => {
                        let last_s = core.last_read_locked_at();
                        let last_x = core.last_write_locked_at();
                        SemaphoreWaitRow {
                            thread_id: cell.thread,
                            file: cell.file,
                            line: cell.line,
                            wait_time,
                            object_addr: target.addr(),
                            object_name: core.name(),
                            wait_type: cell.request,
                            holder_thread_id: match core.writer_thread() {
                                NO_THREAD => None,
                                t => Some(t),
                            },
                            holder_file: last_x.map(|s| s.0),
                            holder_line: last_x.map(|s| s.1),
                            waiters_flag: core.waiters(),
                            lock_word: core.lock_word() as i64,
                            reader_count: Some(core.reader_count()),
                            last_reader_file: last_s.map(|s| s.0),
                            last_reader_line: last_s.map(|s| s.1),
                            last_writer_file: last_x.map(|s| s.0),
                            last_writer_line: last_x.map(|s| s.1),
                            os_wait_count: core.os_wait_count(),
                        }
                    }
                };
                rows.push(row);
            }
        }
        rows
    }
}

/// A reserved cell. `wait` suspends and frees the cell on wake-up; `cancel`
/// frees it without waiting (the retry after reservation succeeded). The
/// drop guard frees the cell if neither ran.
pub(crate) struct Reservation<'a> {
    owner: &'a WaitArrays,
    slot: Option<(usize, usize)>,
}

impl Reservation<'_> {
    pub(crate) fn wait(mut self) {
        let (array_index, cell_index) = self.slot.take().expect("reservation already consumed");
        let array = &self.owner.arrays[array_index];
        let (target, request, signal_count) = {
            let mut inner = array.inner.lock();
            let cell = &mut inner.cells[cell_index];
            debug_assert!(!cell.waiting);
            cell.waiting = true;
            (
                cell.target.clone().expect("cell not reserved"),
                cell.request,
                cell.signal_count,
            )
        };
        #[cfg(debug_assertions)]
        {
            let inner = array.inner.lock();
            if detect_deadlock(&inner, cell_index, cell_index, 0) {
                tracing::error!("deadlock of threads detected");
                drop(inner);
                self.owner.free_cell(array_index, cell_index);
                panic!("deadlock of threads waiting for semaphores");
            }
        }
        target.event_for(request).wait_low(signal_count);
        self.owner.free_cell(array_index, cell_index);
    }

    pub(crate) fn cancel(mut self) {
        if let Some((array_index, cell_index)) = self.slot.take() {
            self.owner.free_cell(array_index, cell_index);
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some((array_index, cell_index)) = self.slot.take() {
            self.owner.free_cell(array_index, cell_index);
        }
    }
}

/// Depth-first search over thread→holder edges. Only meaningful within one
/// sub-array; an edge whose holder recorded a non-zero pass is pruned, since
/// the releasing thread is then unknown.
#[cfg(debug_assertions)]
fn detect_deadlock(inner: &SyncArrayInner, start: usize, cell_index: usize, depth: usize) -> bool {
    if depth > 100 {
        return false;
    }
    let cell = &inner.cells[cell_index];
    if !cell.waiting {
        return false;
    }
    let Some(target) = &cell.target else {
        return false;
    };
    match target {
        WaitObject::Mutex(core) => {
            if core.lock_word() != 0 {
                let holder = core.owner_thread();
                // The holder may not have recorded itself yet, or may have
                // already released; then no deadlock can be inferred.
                if holder != NO_THREAD
                    && deadlock_step(inner, start, holder, 0, depth)
                {
                    tracing::error!(
                        mutex = core.name(),
                        holder,
                        "deadlock edge through mutex"
                    );
                    return true;
                }
            }
            false
        }
        WaitObject::RwLock(core) => {
            let owners = core.owners_snapshot();
            match cell.request {
                RequestType::RwExclusive | RequestType::RwWaitExclusive => {
                    for owner in &owners {
                        let blocks = match owner.request {
                            RequestType::RwExclusive | RequestType::RwWaitExclusive => {
                                owner.thread != cell.thread
                            }
                            RequestType::RwShared => true,
                            RequestType::Mutex => false,
                        };
                        if blocks && deadlock_step(inner, start, owner.thread, owner.pass, depth) {
                            tracing::error!(
                                latch = core.name(),
                                holder = owner.thread,
                                mode = owner.request.as_str(),
                                "deadlock edge through rw-latch"
                            );
                            return true;
                        }
                    }
                    false
                }
                RequestType::RwShared => {
                    for owner in &owners {
                        let blocks = matches!(
                            owner.request,
                            RequestType::RwExclusive | RequestType::RwWaitExclusive
                        );
                        if blocks && deadlock_step(inner, start, owner.thread, owner.pass, depth) {
                            tracing::error!(
                                latch = core.name(),
                                holder = owner.thread,
                                mode = owner.request.as_str(),
                                "deadlock edge through rw-latch"
                            );
                            return true;
                        }
                    }
                    false
                }
                RequestType::Mutex => false,
            }
        }
    }
}

#[cfg(debug_assertions)]
fn deadlock_step(
    inner: &SyncArrayInner,
    start: usize,
    thread: u64,
    pass: u32,
    depth: usize,
) -> bool {
    if pass != 0 {
        return false;
    }
    match inner.find_thread(thread) {
        Some(index) if index == start => true,
        Some(index) => detect_deadlock(inner, start, index, depth + 1),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::sync::{WaitMutex, WaitRwLock};
    use std::sync::mpsc;
    use std::thread;

    fn loc() -> &'static Location<'static> {
        Location::caller()
    }

    #[test]
    fn reserve_wait_free_leaves_cell_empty() {
        let arrays = WaitArrays::new(1, 8, WaitArrayOptions::default());
        let mutex = WaitMutex::new("m", ());
        let target = WaitObject::Mutex(Arc::clone(mutex.core()));
        let reservation = arrays
            .reserve(target.clone(), RequestType::Mutex, loc())
            .unwrap();
        assert_eq!(arrays.n_reserved(), 1);
        arrays.validate();
        // The mutex is free, so the wait returns via the missed-signal path
        // once the event fires.
        mutex.core().event().set();
        reservation.wait();
        assert_eq!(arrays.n_reserved(), 0);
        arrays.validate();
    }

    #[test]
    fn reserve_exhaustion_reports_no_free_cell() {
        let arrays = WaitArrays::new(1, 2, WaitArrayOptions::default());
        let mutex = WaitMutex::new("m", ());
        let target = WaitObject::Mutex(Arc::clone(mutex.core()));
        let _a = arrays
            .reserve(target.clone(), RequestType::Mutex, loc())
            .unwrap();
        let _b = arrays
            .reserve(target.clone(), RequestType::Mutex, loc())
            .unwrap();
        let err = arrays.reserve(target, RequestType::Mutex, loc());
        assert!(matches!(err, Err(BrasaError::NoFreeCell)));
    }

    #[test]
    fn sweep_wakes_waiter_whose_signal_was_missed() {
        let arrays = Arc::new(WaitArrays::new(1, 8, WaitArrayOptions::default()));
        let lock = Arc::new(WaitRwLock::new("l", ()));
        let target = WaitObject::RwLock(Arc::clone(lock.core()));
        let reservation = arrays
            .reserve(target, RequestType::RwShared, loc())
            .unwrap();
        // The latch is free the whole time: the sweep must notice and set
        // the event, releasing the waiter.
        let sweeper = {
            let arrays = Arc::clone(&arrays);
            thread::spawn(move || loop {
                arrays.wake_threads_if_sema_free();
                if arrays.n_reserved() == 0 {
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            })
        };
        reservation.wait();
        sweeper.join().unwrap();
        assert_eq!(arrays.n_reserved(), 0);
    }

    #[test]
    fn long_wait_report_finds_backdated_cell() {
        let options = WaitArrayOptions {
            long_wait_warn: Duration::from_secs(240),
            fatal_threshold: Duration::from_secs(600),
        };
        let arrays = WaitArrays::new(1, 8, options);
        let mutex = WaitMutex::new("m", ());
        let target = WaitObject::Mutex(Arc::clone(mutex.core()));
        let reservation = arrays
            .reserve(target.clone(), RequestType::Mutex, loc())
            .unwrap();
        {
            let mut inner = arrays.arrays[0].inner.lock();
            let cell = &mut inner.cells[0];
            cell.waiting = true;
            cell.reserved_at = Instant::now().checked_sub(Duration::from_secs(300));
            assert!(cell.reserved_at.is_some());
        }
        let report = arrays.print_long_waits();
        assert!(report.noticed);
        assert!(!report.fatal);
        assert!(report.longest_wait >= Duration::from_secs(299));
        assert_eq!(report.waiter, Some(super::super::current_thread_id()));
        assert_eq!(report.sema, Some(target.addr()));
        // Clean up without blocking.
        {
            let mut inner = arrays.arrays[0].inner.lock();
            inner.cells[0].waiting = false;
        }
        reservation.cancel();
    }

    #[test]
    fn long_wait_report_flags_fatal_past_threshold() {
        let options = WaitArrayOptions {
            long_wait_warn: Duration::from_secs(1),
            fatal_threshold: Duration::from_secs(2),
        };
        let arrays = WaitArrays::new(1, 8, options);
        let mutex = WaitMutex::new("m", ());
        let target = WaitObject::Mutex(Arc::clone(mutex.core()));
        let reservation = arrays
            .reserve(target, RequestType::Mutex, loc())
            .unwrap();
        {
            let mut inner = arrays.arrays[0].inner.lock();
            let cell = &mut inner.cells[0];
            cell.waiting = true;
            cell.reserved_at = Instant::now().checked_sub(Duration::from_secs(10));
        }
        let report = arrays.print_long_waits();
        assert!(report.noticed);
        assert!(report.fatal);
        {
            let mut inner = arrays.arrays[0].inner.lock();
            inner.cells[0].waiting = false;
        }
        reservation.cancel();
    }

    #[test]
    fn semaphore_view_lists_waiting_cells() {
        let arrays = WaitArrays::new(1, 8, WaitArrayOptions::default());
        let lock = Arc::new(WaitRwLock::new("view_latch", 0u8));
        let target = WaitObject::RwLock(Arc::clone(lock.core()));
        let reservation = arrays
            .reserve(target, RequestType::RwShared, loc())
            .unwrap();
        {
            let mut inner = arrays.arrays[0].inner.lock();
            inner.cells[0].waiting = true;
        }
        let rows = arrays.semaphore_waits();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].object_name, "view_latch");
        assert_eq!(rows[0].wait_type, RequestType::RwShared);
        assert_eq!(rows[0].lock_word, super::super::X_LOCK_DECR as i64);
        assert_eq!(rows[0].reader_count, Some(0));
        {
            let mut inner = arrays.arrays[0].inner.lock();
            inner.cells[0].waiting = false;
        }
        reservation.cancel();
    }

    #[cfg(debug_assertions)]
    #[test]
    fn cross_mutex_deadlock_is_detected() {
        // T1 holds m1 and waits for m2; the main thread holds m2 and waits
        // for m1. The second waiter's pre-sleep check trips the detector.
        let arrays = Arc::new(WaitArrays::new(1, 8, WaitArrayOptions::default()));
        let m1 = Arc::new(WaitMutex::new("m1", ()));
        let m2 = Arc::new(WaitMutex::new("m2", ()));

        let (m2_locked_tx, m2_locked_rx) = mpsc::channel();
        let (t1_ready_tx, t1_ready_rx) = mpsc::channel();
        let t1 = {
            let arrays = Arc::clone(&arrays);
            let m1 = Arc::clone(&m1);
            let m2 = Arc::clone(&m2);
            thread::spawn(move || {
                let _g1 = m1.lock(&arrays);
                m2_locked_rx.recv().unwrap();
                t1_ready_tx.send(()).unwrap();
                // Parks until the deadlocked peer panics and releases m2
                // during unwind.
                let _g2 = m2.lock(&arrays);
            })
        };

        let result = {
            let arrays = Arc::clone(&arrays);
            let m1 = Arc::clone(&m1);
            let m2 = Arc::clone(&m2);
            thread::spawn(move || {
                let _g2 = m2.lock(&arrays);
                m2_locked_tx.send(()).unwrap();
                t1_ready_rx.recv().unwrap();
                // Give T1 time to park and mark its cell as waiting.
                thread::sleep(Duration::from_millis(100));
                let _g1 = m1.lock(&arrays);
            })
            .join()
        };
        assert!(result.is_err(), "second waiter must panic on the deadlock");
        t1.join().unwrap();
        assert_eq!(arrays.n_reserved(), 0);
    }
}
