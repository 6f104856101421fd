//! Per-worker bounded ring buffer: single producer (the owning worker), multi
//! consumer (stealers).
//!
//! Capacity is a fixed power of two; pushes that don't fully fit top the ring
//! up to capacity and spill the genuine remainder to the global queue rather
//! than growing.
#![expect(unsafe_code, reason = "raw ring buffer slots written behind atomics")]

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;

use skein_os::sync::atomic::{AtomicU32, Ordering};
use skein_os::{Backoff, CachePadded};

use crate::task::{Batch, Task};

/// Fixed ring capacity. Must be a power of two (wraparound arithmetic below
/// relies on it).
pub(crate) const N: u32 = 256;

/// A single-producer/multi-consumer bounded ring of `*mut Task`.
pub(crate) struct LocalQueue {
    head: CachePadded<AtomicU32>,
    tail: CachePadded<AtomicU32>,
    buffer: Box<[UnsafeCell<MaybeUninit<*mut Task>>]>,
}

// SAFETY: `buffer` cells are written only by the owner (guarded by `tail`) and
// read by the owner or by a stealer that has already claimed the slot via a
// successful CAS on `head` — never concurrently by two parties.
unsafe impl Send for LocalQueue {}
unsafe impl Sync for LocalQueue {}

impl LocalQueue {
    pub(crate) fn new() -> Self {
        LocalQueue {
            head: CachePadded::new(AtomicU32::new(0)),
            tail: CachePadded::new(AtomicU32::new(0)),
            buffer: (0..N).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect(),
        }
    }

    fn slot(&self, index: u32) -> &UnsafeCell<MaybeUninit<*mut Task>> {
        &self.buffer[(index % N) as usize]
    }

    pub(crate) fn len(&self) -> u32 {
        self.tail.load(Ordering::Relaxed).wrapping_sub(self.head.load(Ordering::Relaxed))
    }

    /// Owner-only: pops the task at `head`, racing stealers via CAS.
    pub(crate) fn pop_local(&self) -> Option<Box<Task>> {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Relaxed);
            if head == tail {
                return None;
            }
            // SAFETY: `head != tail`, so this slot was published by a prior
            // `push_many_from_batch` and not yet claimed.
            let ptr = unsafe { (*self.slot(head).get()).assume_init() };
            if self
                .head
                .compare_exchange_weak(head, head.wrapping_add(1), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: `ptr` came from a `Box<Task>` pushed by the owner and
                // this CAS is what gives us exclusive claim to it.
                return Some(unsafe { Box::from_raw(ptr) });
            }
            backoff.spin();
        }
    }

    /// Owner-only: pushes as many of `batch`'s tasks as fit, in order, updating
    /// `tail` with a release store on completion. If `batch` doesn't fully fit,
    /// the ring is topped up to capacity with its front tasks and the rest is
    /// handed back for the caller to push to the global queue.
    pub(crate) fn push_many_from_batch(&self, mut batch: Batch) -> Option<Batch> {
        let head = self.head.load(Ordering::Acquire);
        let mut tail = self.tail.load(Ordering::Relaxed);
        let room = N - tail.wrapping_sub(head);

        if batch.len() as u32 <= room {
            while let Some(task) = batch.pop_front() {
                // SAFETY: `tail` identifies a slot no stealer has claimed yet
                // (room was computed against the current `head`).
                unsafe { (*self.slot(tail).get()).write(task.into_raw().as_ptr()) };
                tail = tail.wrapping_add(1);
            }
            self.tail.store(tail, Ordering::Release);
            return None;
        }

        // Doesn't fully fit: only ever write the `room` slots between the old
        // and new `tail` — never touch a slot that hasn't just been computed as
        // free, since anything below `head` may still be occupied or claimed by
        // a stealer. Whatever's left in `batch` after that is the genuine
        // overflow for the caller to push to the global queue.
        for _ in 0..room {
            let task = batch.pop_front().expect("batch.len() > room, checked above");
            // SAFETY: `tail` identifies a slot no stealer has claimed yet.
            unsafe { (*self.slot(tail).get()).write(task.into_raw().as_ptr()) };
            tail = tail.wrapping_add(1);
        }
        self.tail.store(tail, Ordering::Release);
        Some(batch)
    }

    /// Steals roughly half of `self`'s queued tasks into `dst`, returning the
    /// first stolen task directly (not placed in `dst`). Returns `None` if empty
    /// or if a race with the owner invalidated the attempt (retried internally).
    pub(crate) fn steal_into(&self, dst: &LocalQueue) -> Option<Box<Task>> {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Acquire);
            let size = tail.wrapping_sub(head);
            if size == 0 {
                return None;
            }
            if size > N {
                // Owner's tail moved since we read `head`; reload from scratch.
                backoff.spin();
                continue;
            }
            let half = size - size / 2;

            let dst_tail = dst.tail.load(Ordering::Relaxed);
            for i in 0..half {
                // SAFETY: relaxed load tolerated here — the subsequent CAS on
                // `self.head` validates that these slots weren't concurrently
                // reused by the owner; other stealers synchronize through the
                // stealer's own tail release below.
                let ptr = unsafe { (*self.slot(head.wrapping_add(i)).get()).assume_init() };
                unsafe { (*dst.slot(dst_tail.wrapping_add(i)).get()).write(ptr) };
            }

            if self
                .head
                .compare_exchange(head, head.wrapping_add(half), Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                backoff.spin();
                continue;
            }

            // We took `half` tasks but return the first directly; only `half - 1`
            // land in `dst`.
            dst.tail.store(dst_tail.wrapping_add(half - 1), Ordering::Release);
            // SAFETY: just claimed by the successful CAS above.
            let first = unsafe { (*self.slot(head).get()).assume_init() };
            return Some(unsafe { Box::from_raw(first) });
        }
    }
}

impl Drop for LocalQueue {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let mut i = head;
        while i != tail {
            // SAFETY: everything between `head` and `tail` is an initialized,
            // still-owned task pointer; no other thread can observe this queue
            // once the worker owning it has exited.
            let ptr = unsafe { (*self.slot(i).get()).assume_init() };
            drop(unsafe { Box::from_raw(ptr) });
            i = i.wrapping_add(1);
        }
    }
}

impl core::fmt::Debug for LocalQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalQueue")
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .finish()
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
    fn push_then_pop_preserves_order_and_count() {
        let q = LocalQueue::new();
        assert!(q.push_many_from_batch(dummy_batch(10)).is_none());
        assert_eq!(q.len(), 10);
        let mut popped = 0;
        while q.pop_local().is_some() {
            popped += 1;
        }
        assert_eq!(popped, 10);
    }

    #[test]
    fn overflow_fills_the_ring_to_capacity_before_spilling_the_remainder() {
        let q = LocalQueue::new();
        let overflow = q.push_many_from_batch(dummy_batch((N + 1) as usize));
        assert_eq!(q.len(), N, "the ring must end up completely full, not half-drained");
        let mut overflow = overflow.expect("one task over capacity must overflow");
        assert_eq!(overflow.len(), 1);
        assert!(overflow.pop_front().is_some());
    }

    #[test]
    fn overflow_from_an_already_nonempty_ring_never_reads_unwritten_slots() {
        let q = LocalQueue::new();
        assert!(q.push_many_from_batch(dummy_batch(10)).is_none());
        let overflow = q.push_many_from_batch(dummy_batch((N - 10 + 5) as usize));
        assert_eq!(q.len(), N);
        let overflow = overflow.expect("5 tasks over capacity must overflow");
        assert_eq!(overflow.len(), 5);
    }

    #[test]
    fn steal_takes_roughly_half() {
        let victim = LocalQueue::new();
        victim.push_many_from_batch(dummy_batch(10));
        let thief = LocalQueue::new();
        let first = victim.steal_into(&thief);
        assert!(first.is_some());
        // 5 stolen total: 1 returned directly + 4 placed in `thief`.
        assert_eq!(thief.len(), 4);
        assert_eq!(victim.len(), 5);
    }
}
