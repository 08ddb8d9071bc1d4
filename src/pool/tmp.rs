//! Scratch buffers for the write path: a page image is copied (and possibly
//! transformed) here so the resident frame stays readable while the I/O is
//! in flight. Slot reservation is a lock-free flag; relaxed ordering
//! suffices because the buffers themselves sit behind their own mutexes and
//! are never published elsewhere.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};

pub(crate) struct TempSlots {
    slots: Vec<TempSlot>,
}

struct TempSlot {
    reserved: AtomicBool,
    page_buf: Mutex<Box<[u8]>>,
    out_buf: Mutex<Box<[u8]>>,
}

impl TempSlots {
    /// Sized so that every flusher and single-page-flush worker can hold a
    /// slot at once; `acquire` then never spins in practice.
    pub(crate) fn new(n_slots: usize, page_size: usize) -> Self {
        let slots = (0..n_slots.max(1))
            .map(|_| TempSlot {
                reserved: AtomicBool::new(false),
                page_buf: Mutex::new(vec![0u8; page_size].into_boxed_slice()),
                out_buf: Mutex::new(vec![0u8; page_size].into_boxed_slice()),
            })
            .collect();
        Self { slots }
    }

    pub(crate) fn acquire(&self) -> SlotGuard<'_> {
        loop {
            for (index, slot) in self.slots.iter().enumerate() {
                if !slot.reserved.swap(true, Ordering::Relaxed) {
                    return SlotGuard { slots: self, index };
                }
            }
            std::thread::yield_now();
        }
    }

    pub(crate) fn n_reserved(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.reserved.load(Ordering::Relaxed))
            .count()
    }
}

pub(crate) struct SlotGuard<'a> {
    slots: &'a TempSlots,
    index: usize,
}

impl SlotGuard<'_> {
    /// Staging copy of the page image.
    pub(crate) fn page_buf(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.slots.slots[self.index].page_buf.lock()
    }

    /// Output of the pre-write transform.
    pub(crate) fn out_buf(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.slots.slots[self.index].out_buf.lock()
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slots.slots[self.index]
            .reserved
            .store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn acquire_release_cycles() {
        let slots = TempSlots::new(2, 64);
        let a = slots.acquire();
        let b = slots.acquire();
        assert_eq!(slots.n_reserved(), 2);
        drop(a);
        assert_eq!(slots.n_reserved(), 1);
        let c = slots.acquire();
        assert_eq!(slots.n_reserved(), 2);
        drop(b);
        drop(c);
        assert_eq!(slots.n_reserved(), 0);
    }

    #[test]
    fn buffers_are_private_to_the_holder() {
        let slots = TempSlots::new(1, 8);
        {
            let guard = slots.acquire();
            guard.page_buf().fill(7);
            guard.out_buf().fill(9);
        }
        let guard = slots.acquire();
        assert_eq!(guard.page_buf()[0], 7);
        assert_eq!(guard.out_buf()[0], 9);
    }

    #[test]
    fn contended_acquire_always_succeeds() {
        let slots = Arc::new(TempSlots::new(2, 16));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let slots = Arc::clone(&slots);
            handles.push(thread::spawn(move || {
                for i in 0..200u8 {
                    let guard = slots.acquire();
                    guard.page_buf()[0] = i;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(slots.n_reserved(), 0);
    }
}
