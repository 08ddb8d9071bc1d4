#![forbid(unsafe_code)]

use parking_lot::{Condvar, Mutex};

/// An event a thread can suspend on, with a monotonic `signal_count` that
/// makes waits level-triggered: a waiter that snapshots the count at reset
/// time will not block if the event has been signalled since.
///
/// Threads may wait without holding any protecting latch, but `set` and
/// `reset` must be externally ordered with respect to the state they signal.
pub struct Event {
    state: Mutex<EventState>,
    cond: Condvar,
}

struct EventState {
    is_set: bool,
    signal_count: u64,
}

impl Event {
    /// Creates the event in the non-signalled state.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EventState {
                is_set: false,
                signal_count: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Signals the event, waking every waiter. Idempotent while set.
    pub fn set(&self) {
        let mut state = self.state.lock();
        if !state.is_set {
            state.is_set = true;
            state.signal_count += 1;
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Clears the event and returns the signal count to pass to `wait_low`.
    pub fn reset(&self) -> u64 {
        let mut state = self.state.lock();
        state.is_set = false;
        state.signal_count
    }

    /// Blocks until the event is set. Returns immediately if the event has
    /// been signalled since the `reset` that produced `signal_count`.
    pub fn wait_low(&self, signal_count: u64) {
        let mut state = self.state.lock();
        while !state.is_set && state.signal_count == signal_count {
            self.cond.wait(&mut state);
        }
    }

    /// Current signal count, for diagnostics.
    pub fn signal_count(&self) -> u64 {
        self.state.lock().signal_count
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_returns_immediately_after_missed_signal() {
        let event = Event::new();
        let count = event.reset();
        event.set();
        // Signalled between reset and wait: must not block.
        event.wait_low(count);
    }

    #[test]
    fn set_wakes_a_parked_waiter() {
        let event = Arc::new(Event::new());
        let count = event.reset();
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait_low(count))
        };
        thread::sleep(Duration::from_millis(20));
        event.set();
        waiter.join().unwrap();
    }

    #[test]
    fn reset_after_set_requires_new_signal() {
        let event = Arc::new(Event::new());
        event.set();
        let count = event.reset();
        assert!(count >= 1);
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait_low(count))
        };
        thread::sleep(Duration::from_millis(20));
        event.set();
        waiter.join().unwrap();
        assert!(event.signal_count() > count);
    }
}
