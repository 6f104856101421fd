//! Intrusive, wait-free Vyukov MPSC queue with a dummy stub node.
//!
//! Push is wait-free for every producer. Pop is lock-free and restricted to
//! whichever single consumer currently holds the `IS_POLLING` bit packed into the
//! tail pointer's low bit — at most one worker drains the global queue at a time;
//! a waker that observes the bit set skips global polling entirely.
#![expect(unsafe_code, reason = "intrusive lock-free queue over raw task pointers")]

use alloc::boxed::Box;
use core::ptr::{self, NonNull};

use skein_os::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::task::{Batch, Task};

const IS_POLLING: usize = 1;

/// The shared global run queue.
///
/// `tail` is packed: bit 0 is the consumer spinlock (`IS_POLLING`), the rest of
/// the word is the tail pointer (task pointers are at least 2-byte aligned, so the
/// low bit is always free in a genuine pointer value).
pub(crate) struct GlobalQueue {
    head: AtomicPtr<Task>,
    tail: AtomicUsize,
    stub: Box<Task>,
}

// SAFETY: the queue's synchronization (head exchange + tail CAS) is what makes
// cross-thread task transfer sound; this mirrors `async_task::Runnable`'s own
// `Send` bound on the tasks it wraps.
unsafe impl Send for GlobalQueue {}
unsafe impl Sync for GlobalQueue {}

impl GlobalQueue {
    pub(crate) fn new() -> Self {
        let stub = Task::new_dummy();
        let stub_ptr = stub.as_ref() as *const Task as *mut Task;
        GlobalQueue {
            head: AtomicPtr::new(stub_ptr),
            tail: AtomicUsize::new(stub_ptr as usize),
            stub,
        }
    }

    fn stub_ptr(&self) -> *mut Task {
        self.stub.as_ref() as *const Task as *mut Task
    }

    /// Appends `batch` to the queue. Wait-free: every producer makes progress in
    /// a bounded number of steps regardless of other producers.
    ///
    /// The transient window between the head exchange and the predecessor's
    /// `next` store is the only place a concurrent `pop` can observe "empty, try
    /// again" even though a push is logically in flight.
    pub(crate) fn push(&self, batch: Batch) {
        let Some((head, tail)) = batch.into_raw_chain() else {
            return;
        };
        let prev = self.head.swap(tail.as_ptr(), Ordering::AcqRel);
        // SAFETY: `prev` was the queue's head and is still reachable (only the
        // single consumer ever frees nodes, and only after advancing past them).
        unsafe { (*prev).set_next(head.as_ptr()) };
    }

    /// Attempts to acquire the consumer lock. Returns `None` if another consumer
    /// already holds it.
    pub(crate) fn try_lock(&self) -> Option<GlobalQueueGuard<'_>> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail & IS_POLLING != 0 {
            return None;
        }
        self.tail
            .compare_exchange(tail, tail | IS_POLLING, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| GlobalQueueGuard { queue: self })
    }

    /// Dequeues one task. Must only be called while holding the consumer lock.
    ///
    /// Follows the standard Vyukov dequeue: skip the stub if it is at the tail,
    /// load `tail.next`; if null and `head == tail` the queue genuinely looks
    /// empty (push the stub back to re-anchor and retry once); if still null,
    /// report empty — a push is in its transient window and will complete shortly.
    fn pop(&self) -> Option<Box<Task>> {
        let mut tail = (self.tail.load(Ordering::Relaxed) & !IS_POLLING) as *mut Task;
        let stub = self.stub_ptr();

        if ptr::eq(tail, stub) {
            let next = unsafe { (*tail).next_ptr() };
            if next.is_null() {
                return None;
            }
            tail = next;
            self.store_tail(tail);
        }

        let next = unsafe { (*tail).next_ptr() };
        if !next.is_null() {
            self.store_tail(next);
            return Some(unsafe { Task::from_raw(NonNull::new_unchecked(tail)) });
        }

        let head = self.head.load(Ordering::Acquire);
        if !ptr::eq(tail, head) {
            // A push is mid-flight: `head` has moved but `tail.next` hasn't been
            // published yet. Not empty, just not ready.
            return None;
        }

        // Re-anchor on the stub so the next push has somewhere to link to even
        // though we're about to report "empty".
        self.push_stub();
        let next = unsafe { (*tail).next_ptr() };
        if next.is_null() {
            return None;
        }
        self.store_tail(next);
        Some(unsafe { Task::from_raw(NonNull::new_unchecked(tail)) })
    }

    fn store_tail(&self, new_tail: *mut Task) {
        // Release: publishes our advance past `tail` together with (on unlock)
        // clearing `IS_POLLING`.
        self.tail.store(new_tail as usize | IS_POLLING, Ordering::Release);
    }

    fn push_stub(&self) {
        let stub = self.stub_ptr();
        // The stub is about to become the new head; null its `next` first (the
        // canonical Vyukov push order) so a subsequent `pop` that finds the
        // queue still empty sees `stub.next == null` instead of the dangling
        // pointer to whatever the stub's last successor was.
        unsafe { (*stub).set_next(ptr::null_mut()) };
        let prev = self.head.swap(stub, Ordering::AcqRel);
        unsafe { (*prev).set_next(stub) };
    }

    pub(crate) fn is_empty(&self) -> bool {
        let tail = (self.tail.load(Ordering::Acquire) & !IS_POLLING) as *mut Task;
        let head = self.head.load(Ordering::Acquire);
        ptr::eq(tail, head) && ptr::eq(tail, self.stub_ptr())
    }
}

impl Drop for GlobalQueue {
    fn drop(&mut self) {
        let stub = self.stub_ptr();
        let mut current = self.head.load(Ordering::Relaxed);
        while !ptr::eq(current, stub) && !current.is_null() {
            let next = unsafe { (*current).next_ptr() };
            drop(unsafe { Task::from_raw(NonNull::new_unchecked(current)) });
            current = next;
        }
    }
}

/// RAII guard for the `IS_POLLING` consumer lock.
///
/// Every exit path releases the bit through `Drop` rather than a manual
/// store-on-each-branch, so an early return can never leak the lock.
pub(crate) struct GlobalQueueGuard<'a> {
    queue: &'a GlobalQueue,
}

impl GlobalQueueGuard<'_> {
    pub(crate) fn pop(&self) -> Option<Box<Task>> {
        self.queue.pop()
    }
}

impl Drop for GlobalQueueGuard<'_> {
    fn drop(&mut self) {
        let tail = self.queue.tail.load(Ordering::Relaxed);
        debug_assert_ne!(tail & IS_POLLING, 0, "guard exists only while the lock is held");
        self.queue.tail.store(tail & !IS_POLLING, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::new_task;

    fn dummy_batch(n: usize) -> Batch {
        let mut batch = Batch::new();
        for _ in 0..n {
            let (b, handle) = new_task(async {}, |_| {});
            handle.detach();
            batch.push_back_many(b);
        }
        batch
    }

    #[test]
    fn fresh_queue_is_empty() {
        let q = GlobalQueue::new();
        assert!(q.is_empty());
        let guard = q.try_lock().expect("uncontended lock");
        assert!(guard.pop().is_none());
    }

    #[test]
    fn push_then_pop_drains_in_order() {
        let q = GlobalQueue::new();
        q.push(dummy_batch(5));
        assert!(!q.is_empty());
        let guard = q.try_lock().expect("uncontended lock");
        let mut popped = 0;
        while guard.pop().is_some() {
            popped += 1;
        }
        assert_eq!(popped, 5);
        drop(guard);
        assert!(q.is_empty());
    }

    #[test]
    fn try_lock_is_exclusive() {
        let q = GlobalQueue::new();
        let first = q.try_lock().expect("first lock succeeds");
        assert!(q.try_lock().is_none(), "a second concurrent consumer must be rejected");
        drop(first);
        assert!(q.try_lock().is_some(), "lock is released once the guard drops");
    }

    #[test]
    fn pop_across_stub_reanchor_survives_repeated_drains() {
        let q = GlobalQueue::new();
        for _ in 0..3 {
            q.push(dummy_batch(1));
            let guard = q.try_lock().expect("uncontended lock");
            assert!(guard.pop().is_some());
            assert!(guard.pop().is_none());
        }
        assert!(q.is_empty());
    }
}
