//! A genuine blocking park/unpark primitive for putting worker threads to sleep.
//!
//! [`Futex`] in this crate's sibling module is a busy-spin lock; it never actually
//! blocks the OS thread. Workers need real parking (`suspend_thread` can leave a
//! worker blocked indefinitely until the next wake-up or shutdown), so this type
//! wraps `std::thread::park`/`Thread::unpark` with a sticky-notification flag, the
//! same three-state dance `std::sync::mpsc` and `crossbeam_utils::sync::Parker` both
//! use to avoid the lost-wakeup race between "unpark arrives before park is called"
//! and "park is called before unpark arrives".

use crate::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, Thread};

const EMPTY: u8 = 0;
const PARKED: u8 = 1;
const NOTIFIED: u8 = 2;

/// A single-waiter blocking event.
///
/// Only the thread that owns an `Event` should call [`Event::park`]; any thread may
/// call [`Event::notify`]. A notification that arrives before `park` is called is not
/// lost: it is recorded and the next `park` call returns immediately.
pub struct Event {
    state: AtomicU8,
    thread: Thread,
}

impl Event {
    /// Creates an event owned by the calling thread.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            thread: thread::current(),
        }
    }

    /// Blocks the calling thread until [`Event::notify`] is called (or was already
    /// called since the last `park`).
    ///
    /// # Panics
    ///
    /// Panics (debug builds) if called from a thread other than the one that
    /// constructed this `Event` — parking is not transferable.
    pub fn park(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.thread.id(),
            "Event::park called from a thread that does not own this event",
        );

        if self
            .state
            .compare_exchange(EMPTY, PARKED, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            // Already NOTIFIED: consume it and return without blocking.
            self.state.store(EMPTY, Ordering::Release);
            return;
        }

        loop {
            thread::park();

            if self
                .state
                .compare_exchange(NOTIFIED, EMPTY, Ordering::Acquire, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            // Spurious wake (`thread::park` may return without a matching `unpark`):
            // state is still PARKED, go back to sleep.
        }
    }

    /// Wakes the owning thread if it is parked, or arranges for its next `park` call
    /// to return immediately.
    pub fn notify(&self) {
        if self.state.swap(NOTIFIED, Ordering::Release) == PARKED {
            self.thread.unpark();
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Event;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use std::thread;

    #[test]
    fn notify_before_park_is_not_lost() {
        let event = Event::new();
        event.notify();
        let started = Instant::now();
        event.park();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn notify_wakes_a_parked_thread() {
        // `Event` is tied to whichever thread constructs it, so build it on the
        // worker thread itself and hand a clone back to the notifier.
        let (tx, rx) = std::sync::mpsc::channel();

        let handle = thread::spawn(move || {
            let event = Arc::new(Event::new());
            tx.send(event.clone()).unwrap();
            event.park();
        });

        let event = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(20));
        event.notify();

        handle.join().unwrap();
    }
}
