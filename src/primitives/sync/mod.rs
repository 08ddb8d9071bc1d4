#![allow(unsafe_code)]

//! Blocking latches built on the wait array.
//!
//! `WaitMutex` and `WaitRwLock` are the engine's internal synchronization
//! primitives. Uncontended acquisitions are a single compare-and-swap;
//! contended ones spin briefly, then reserve a cell in the wait array and
//! suspend on the primitive's embedded event. The release path signals the
//! event only when the waiters flag is raised, so the fast path stays cheap.

pub mod wait_array;

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::panic::Location;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::primitives::event::Event;
use crate::primitives::sync::wait_array::{object_signalled, WaitArrays, WaitObject};

/// Rounds of busy-waiting before a contended acquisition parks.
const SPIN_ROUNDS: usize = 30;

/// Lock word value of a free reader/writer latch. A writer subtracts the
/// whole amount; readers subtract 1 each.
pub const X_LOCK_DECR: i32 = 0x0010_0000;

/// Thread id 0 is reserved for "no thread".
pub const NO_THREAD: u64 = 0;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Dense per-process thread id, assigned on first use.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// What a wait-array cell is blocked on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestType {
    Mutex,
    RwShared,
    RwExclusive,
    /// Writer that holds the reservation and waits for readers to drain.
    RwWaitExclusive,
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Mutex => "MUTEX",
            RequestType::RwShared => "RW_LOCK_SHARED",
            RequestType::RwExclusive => "RW_LOCK_EX",
            RequestType::RwWaitExclusive => "RW_LOCK_WAIT_EX",
        }
    }
}

/// Last acquisition site of a latch, for diagnostics. Stores the caller's
/// `&'static Location` so loads stay a single pointer read.
pub(crate) struct SiteCell(AtomicPtr<Location<'static>>);

impl SiteCell {
    fn new() -> Self {
        Self(AtomicPtr::new(std::ptr::null_mut()))
    }

    fn store(&self, loc: &'static Location<'static>) {
        self.0
            .store(loc as *const Location<'static> as *mut _, Ordering::Relaxed);
    }

    fn load(&self) -> Option<&'static Location<'static>> {
        let ptr = self.0.load(Ordering::Relaxed);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }
}

/// A latch holder recorded for the debug deadlock detector.
#[derive(Clone, Copy, Debug)]
pub struct LatchOwner {
    pub thread: u64,
    pub request: RequestType,
    /// Non-zero when the latch was passed across threads; the deadlock
    /// detector cannot reason about such edges and prunes them.
    pub pass: u32,
}

// ---------------------------------------------------------------------------
// WaitMutex
// ---------------------------------------------------------------------------

/// Shared state of a `WaitMutex`, visible to wait-array diagnostics.
pub struct MutexCore {
    name: &'static str,
    lock_word: AtomicU32,
    waiters: AtomicU32,
    event: Event,
    owner: AtomicU64,
    os_wait_count: AtomicU64,
    locked_at: SiteCell,
}

impl MutexCore {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            lock_word: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            event: Event::new(),
            owner: AtomicU64::new(NO_THREAD),
            os_wait_count: AtomicU64::new(0),
            locked_at: SiteCell::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lock_word(&self) -> u32 {
        self.lock_word.load(Ordering::Relaxed)
    }

    pub fn waiters(&self) -> u32 {
        self.waiters.load(Ordering::Relaxed)
    }

    pub fn owner_thread(&self) -> u64 {
        self.owner.load(Ordering::Relaxed)
    }

    pub fn os_wait_count(&self) -> u64 {
        self.os_wait_count.load(Ordering::Relaxed)
    }

    pub fn locked_at(&self) -> Option<(&'static str, u32)> {
        self.locked_at.load().map(|loc| (loc.file(), loc.line()))
    }

    pub(crate) fn event(&self) -> &Event {
        &self.event
    }

    /// Free as observed by the wake-up sweep.
    pub(crate) fn is_free(&self) -> bool {
        self.lock_word.load(Ordering::Relaxed) == 0
    }

    fn try_acquire(&self, loc: &'static Location<'static>) -> bool {
        if self
            .lock_word
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(current_thread_id(), Ordering::Relaxed);
            self.locked_at.store(loc);
            true
        } else {
            false
        }
    }

    fn release(&self) {
        self.owner.store(NO_THREAD, Ordering::Relaxed);
        self.lock_word.store(0, Ordering::Release);
        if self.waiters.load(Ordering::Acquire) != 0 {
            self.waiters.store(0, Ordering::Relaxed);
            self.event.set();
            object_signalled();
        }
    }
}

/// Mutual exclusion latch whose contended path suspends via the wait array.
pub struct WaitMutex<T> {
    core: Arc<MutexCore>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for WaitMutex<T> {}
unsafe impl<T: Send> Sync for WaitMutex<T> {}

impl<T> WaitMutex<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            core: Arc::new(MutexCore::new(name)),
            data: UnsafeCell::new(value),
        }
    }

    pub fn core(&self) -> &Arc<MutexCore> {
        &self.core
    }

    #[track_caller]
    pub fn lock<'a>(&'a self, sync: &WaitArrays) -> WaitMutexGuard<'a, T> {
        let loc = Location::caller();
        for _ in 0..SPIN_ROUNDS {
            if self.core.try_acquire(loc) {
                return WaitMutexGuard { lock: self };
            }
            std::hint::spin_loop();
        }
        loop {
            let reservation = sync
                .reserve(
                    WaitObject::Mutex(Arc::clone(&self.core)),
                    RequestType::Mutex,
                    loc,
                )
                .expect("wait array has no free cell");
            self.core.waiters.store(1, Ordering::Release);
            if self.core.try_acquire(loc) {
                reservation.cancel();
                return WaitMutexGuard { lock: self };
            }
            self.core.os_wait_count.fetch_add(1, Ordering::Relaxed);
            reservation.wait();
        }
    }

    #[track_caller]
    pub fn try_lock(&self) -> Option<WaitMutexGuard<'_, T>> {
        let loc = Location::caller();
        if self.core.try_acquire(loc) {
            Some(WaitMutexGuard { lock: self })
        } else {
            None
        }
    }
}

pub struct WaitMutexGuard<'a, T> {
    lock: &'a WaitMutex<T>,
}

impl<T> Deref for WaitMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WaitMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WaitMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.core.release();
    }
}

// ---------------------------------------------------------------------------
// WaitRwLock
// ---------------------------------------------------------------------------

/// Shared state of a `WaitRwLock`.
///
/// Lock word protocol: `X_LOCK_DECR` free; each reader subtracts 1; a writer
/// subtracts `X_LOCK_DECR`. A negative word means a writer holds the
/// reservation while readers drain (the wait-ex state); zero means the
/// writer owns the latch.
pub struct RwLockCore {
    name: &'static str,
    lock_word: AtomicI32,
    waiters: AtomicU32,
    event: Event,
    wait_ex_event: Event,
    writer_thread: AtomicU64,
    os_wait_count: AtomicU64,
    last_s: SiteCell,
    last_x: SiteCell,
    #[cfg(debug_assertions)]
    owners: parking_lot::Mutex<Vec<LatchOwner>>,
}

impl RwLockCore {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            lock_word: AtomicI32::new(X_LOCK_DECR),
            waiters: AtomicU32::new(0),
            event: Event::new(),
            wait_ex_event: Event::new(),
            writer_thread: AtomicU64::new(NO_THREAD),
            os_wait_count: AtomicU64::new(0),
            last_s: SiteCell::new(),
            last_x: SiteCell::new(),
            #[cfg(debug_assertions)]
            owners: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lock_word(&self) -> i32 {
        self.lock_word.load(Ordering::Relaxed)
    }

    pub fn waiters(&self) -> u32 {
        self.waiters.load(Ordering::Relaxed)
    }

    pub fn writer_thread(&self) -> u64 {
        self.writer_thread.load(Ordering::Relaxed)
    }

    pub fn os_wait_count(&self) -> u64 {
        self.os_wait_count.load(Ordering::Relaxed)
    }

    pub fn last_read_locked_at(&self) -> Option<(&'static str, u32)> {
        self.last_s.load().map(|loc| (loc.file(), loc.line()))
    }

    pub fn last_write_locked_at(&self) -> Option<(&'static str, u32)> {
        self.last_x.load().map(|loc| (loc.file(), loc.line()))
    }

    pub fn reader_count(&self) -> u32 {
        let w = self.lock_word.load(Ordering::Relaxed);
        if w < 0 {
            (-w) as u32
        } else if w < X_LOCK_DECR {
            (X_LOCK_DECR - w) as u32
        } else {
            0
        }
    }

    pub(crate) fn event(&self) -> &Event {
        &self.event
    }

    pub(crate) fn wait_ex_event(&self) -> &Event {
        &self.wait_ex_event
    }

    /// Whether a request of the given type could proceed right now; used by
    /// the wake-up sweep.
    pub(crate) fn can_satisfy(&self, request: RequestType) -> bool {
        let w = self.lock_word.load(Ordering::Relaxed);
        match request {
            RequestType::RwShared | RequestType::RwExclusive => w > 0,
            RequestType::RwWaitExclusive => w == 0,
            RequestType::Mutex => false,
        }
    }

    pub(crate) fn owners_snapshot(&self) -> Vec<LatchOwner> {
        #[cfg(debug_assertions)]
        {
            self.owners.lock().clone()
        }
        #[cfg(not(debug_assertions))]
        {
            Vec::new()
        }
    }

    #[cfg(debug_assertions)]
    fn register_owner(&self, request: RequestType, pass: u32) {
        self.owners.lock().push(LatchOwner {
            thread: current_thread_id(),
            request,
            pass,
        });
    }

    #[cfg(not(debug_assertions))]
    fn register_owner(&self, _request: RequestType, _pass: u32) {}

    #[cfg(debug_assertions)]
    fn unregister_owner(&self, request: RequestType) {
        let mut owners = self.owners.lock();
        let tid = current_thread_id();
        if let Some(pos) = owners
            .iter()
            .position(|o| o.request == request && o.thread == tid)
        {
            owners.swap_remove(pos);
        } else if let Some(pos) = owners.iter().position(|o| o.request == request) {
            // Latch passed from another thread.
            owners.swap_remove(pos);
        }
    }

    #[cfg(not(debug_assertions))]
    fn unregister_owner(&self, _request: RequestType) {}

    #[cfg(debug_assertions)]
    fn promote_wait_ex(&self) {
        let mut owners = self.owners.lock();
        if let Some(owner) = owners
            .iter_mut()
            .find(|o| o.request == RequestType::RwWaitExclusive)
        {
            owner.request = RequestType::RwExclusive;
        }
    }

    #[cfg(not(debug_assertions))]
    fn promote_wait_ex(&self) {}

    fn try_s(&self, loc: &'static Location<'static>) -> bool {
        loop {
            let w = self.lock_word.load(Ordering::Relaxed);
            if w <= 0 {
                return false;
            }
            if self
                .lock_word
                .compare_exchange_weak(w, w - 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.last_s.store(loc);
                return true;
            }
        }
    }

    fn try_x(&self, loc: &'static Location<'static>) -> bool {
        if self
            .lock_word
            .compare_exchange(X_LOCK_DECR, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.writer_thread
                .store(current_thread_id(), Ordering::Relaxed);
            self.last_x.store(loc);
            true
        } else {
            false
        }
    }

    fn s_unlock(&self) {
        self.unregister_owner(RequestType::RwShared);
        let prev = self.lock_word.fetch_add(1, Ordering::Release);
        if prev == -1 {
            // Last reader out while a writer drains in wait-ex state.
            self.wait_ex_event.set();
            object_signalled();
        } else if prev + 1 == X_LOCK_DECR {
            self.wake_waiters();
        }
    }

    fn x_unlock(&self) {
        self.unregister_owner(RequestType::RwExclusive);
        self.writer_thread.store(NO_THREAD, Ordering::Relaxed);
        let prev = self.lock_word.fetch_add(X_LOCK_DECR, Ordering::Release);
        debug_assert!(prev == 0, "x_unlock of a latch not exclusively held");
        self.wake_waiters();
    }

    fn wake_waiters(&self) {
        if self.waiters.load(Ordering::Acquire) != 0 {
            self.waiters.store(0, Ordering::Relaxed);
            self.event.set();
            object_signalled();
        }
    }
}

/// Reader/writer latch with data, suspending through the wait array.
pub struct WaitRwLock<T> {
    core: Arc<RwLockCore>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for WaitRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for WaitRwLock<T> {}

impl<T> WaitRwLock<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            core: Arc::new(RwLockCore::new(name)),
            data: UnsafeCell::new(value),
        }
    }

    pub fn core(&self) -> &Arc<RwLockCore> {
        &self.core
    }

    fn s_lock(&self, sync: &WaitArrays, pass: u32, loc: &'static Location<'static>) {
        for _ in 0..SPIN_ROUNDS {
            if self.core.try_s(loc) {
                self.core.register_owner(RequestType::RwShared, pass);
                return;
            }
            std::hint::spin_loop();
        }
        loop {
            let reservation = sync
                .reserve(
                    WaitObject::RwLock(Arc::clone(&self.core)),
                    RequestType::RwShared,
                    loc,
                )
                .expect("wait array has no free cell");
            self.core.waiters.store(1, Ordering::Release);
            if self.core.try_s(loc) {
                reservation.cancel();
                self.core.register_owner(RequestType::RwShared, pass);
                return;
            }
            self.core.os_wait_count.fetch_add(1, Ordering::Relaxed);
            reservation.wait();
        }
    }

    fn x_lock(&self, sync: &WaitArrays, pass: u32, loc: &'static Location<'static>) {
        for _ in 0..SPIN_ROUNDS {
            if self.core.try_x(loc) {
                self.core.register_owner(RequestType::RwExclusive, pass);
                return;
            }
            std::hint::spin_loop();
        }
        loop {
            let w = self.core.lock_word.load(Ordering::Relaxed);
            if w > 0 {
                if self
                    .core
                    .lock_word
                    .compare_exchange(w, w - X_LOCK_DECR, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                // Writer slot reserved; readers may still be draining.
                self.core
                    .writer_thread
                    .store(current_thread_id(), Ordering::Relaxed);
                self.core.register_owner(RequestType::RwWaitExclusive, pass);
                if w != X_LOCK_DECR {
                    self.wait_for_readers(sync, loc);
                }
                self.core.promote_wait_ex();
                self.core.last_x.store(loc);
                return;
            }
            // Another writer holds or waits; park on the main event.
            let reservation = sync
                .reserve(
                    WaitObject::RwLock(Arc::clone(&self.core)),
                    RequestType::RwExclusive,
                    loc,
                )
                .expect("wait array has no free cell");
            self.core.waiters.store(1, Ordering::Release);
            if self.core.lock_word.load(Ordering::Relaxed) > 0 {
                reservation.cancel();
                continue;
            }
            self.core.os_wait_count.fetch_add(1, Ordering::Relaxed);
            reservation.wait();
        }
    }

    fn wait_for_readers(&self, sync: &WaitArrays, loc: &'static Location<'static>) {
        loop {
            if self.core.lock_word.load(Ordering::Acquire) == 0 {
                return;
            }
            let reservation = sync
                .reserve(
                    WaitObject::RwLock(Arc::clone(&self.core)),
                    RequestType::RwWaitExclusive,
                    loc,
                )
                .expect("wait array has no free cell");
            if self.core.lock_word.load(Ordering::Acquire) == 0 {
                reservation.cancel();
                return;
            }
            self.core.os_wait_count.fetch_add(1, Ordering::Relaxed);
            reservation.wait();
        }
    }

    #[track_caller]
    pub fn read<'a>(&'a self, sync: &WaitArrays) -> RwReadGuard<'a, T> {
        self.s_lock(sync, 0, Location::caller());
        RwReadGuard { lock: self }
    }

    #[track_caller]
    pub fn write<'a>(&'a self, sync: &WaitArrays) -> RwWriteGuard<'a, T> {
        self.x_lock(sync, 0, Location::caller());
        RwWriteGuard { lock: self }
    }

    #[track_caller]
    pub fn try_read(&self) -> Option<RwReadGuard<'_, T>> {
        if self.core.try_s(Location::caller()) {
            self.core.register_owner(RequestType::RwShared, 0);
            Some(RwReadGuard { lock: self })
        } else {
            None
        }
    }

    #[track_caller]
    pub fn try_write(&self) -> Option<RwWriteGuard<'_, T>> {
        if self.core.try_x(Location::caller()) {
            self.core.register_owner(RequestType::RwExclusive, 0);
            Some(RwWriteGuard { lock: self })
        } else {
            None
        }
    }

    #[track_caller]
    pub fn read_arc(self: &Arc<Self>, sync: &WaitArrays) -> ArcRwReadGuard<T> {
        self.s_lock(sync, 0, Location::caller());
        ArcRwReadGuard {
            lock: Arc::clone(self),
        }
    }

    #[track_caller]
    pub fn write_arc(self: &Arc<Self>, sync: &WaitArrays) -> ArcRwWriteGuard<T> {
        self.x_lock(sync, 0, Location::caller());
        ArcRwWriteGuard {
            lock: Arc::clone(self),
        }
    }

    /// Exclusive acquisition on behalf of an I/O that may complete on a
    /// different thread; `pass != 0` prunes deadlock-detector edges.
    #[track_caller]
    pub fn write_arc_pass(self: &Arc<Self>, sync: &WaitArrays, pass: u32) -> ArcRwWriteGuard<T> {
        self.x_lock(sync, pass, Location::caller());
        ArcRwWriteGuard {
            lock: Arc::clone(self),
        }
    }

    #[track_caller]
    pub fn try_read_arc(self: &Arc<Self>) -> Option<ArcRwReadGuard<T>> {
        if self.core.try_s(Location::caller()) {
            self.core.register_owner(RequestType::RwShared, 0);
            Some(ArcRwReadGuard {
                lock: Arc::clone(self),
            })
        } else {
            None
        }
    }

    #[track_caller]
    pub fn try_write_arc(self: &Arc<Self>) -> Option<ArcRwWriteGuard<T>> {
        if self.core.try_x(Location::caller()) {
            self.core.register_owner(RequestType::RwExclusive, 0);
            Some(ArcRwWriteGuard {
                lock: Arc::clone(self),
            })
        } else {
            None
        }
    }
}

pub struct RwReadGuard<'a, T> {
    lock: &'a WaitRwLock<T>,
}

impl<T> Deref for RwReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.core.s_unlock();
    }
}

pub struct RwWriteGuard<'a, T> {
    lock: &'a WaitRwLock<T>,
}

impl<T> Deref for RwWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.core.x_unlock();
    }
}

/// Shared guard that owns the lock, for holding a latch beyond a borrow
/// (mini-transaction memos).
pub struct ArcRwReadGuard<T> {
    lock: Arc<WaitRwLock<T>>,
}

impl<T> Deref for ArcRwReadGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ArcRwReadGuard<T> {
    fn drop(&mut self) {
        self.lock.core.s_unlock();
    }
}

pub struct ArcRwWriteGuard<T> {
    lock: Arc<WaitRwLock<T>>,
}

impl<T> ArcRwWriteGuard<T> {
    pub fn rwlock(&self) -> &Arc<WaitRwLock<T>> {
        &self.lock
    }
}

impl<T> Deref for ArcRwWriteGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for ArcRwWriteGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for ArcRwWriteGuard<T> {
    fn drop(&mut self) {
        self.lock.core.x_unlock();
    }
}
