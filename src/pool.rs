//! Pool header: owns the global queue, the slot array, and the `active_threads`
//! counter; implements the resume/suspend wake protocol and drives worker
//! spawn/join.
#![expect(unsafe_code, reason = "raw slot/worker pointer publication")]

use alloc::boxed::Box;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};
use std::sync::Mutex;
use std::thread::JoinHandle;

use skein_os::sync::atomic::Ordering;
use skein_os::thread::available_parallelism;

use crate::global_queue::GlobalQueue;
use crate::slot::{IdleQueue, PopOutcome, SlotState, Slots, IS_NOTIFIED, IS_SHUTDOWN, IS_WAKING};
use crate::task::Batch;
use crate::worker::{self, Thread};

/// Cap on the number of worker slots a pool may configure; a pool created with
/// `max_threads > MAX_SLOTS` silently caps at `MAX_SLOTS`.
pub const MAX_SLOTS: usize = 4096;

/// Configuration for [`crate::run`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Upper bound on worker threads; defaults to the host's available
    /// parallelism. Always clamped to at least 1 and at most [`MAX_SLOTS`].
    pub max_threads: usize,
    /// Stack size (bytes) for spawned worker threads; `None` uses the platform
    /// default.
    pub stack_size: Option<usize>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            max_threads: available_parallelism().get(),
            stack_size: None,
        }
    }
}

pub(crate) struct Pool {
    queue: GlobalQueue,
    slots: Slots,
    active_threads: StdAtomicUsize,
    handles: Box<[Mutex<Option<JoinHandle<()>>>]>,
    stack_size: Option<usize>,
}

impl Pool {
    pub(crate) fn new(options: &PoolOptions) -> Box<Pool> {
        let max_threads = options.max_threads.clamp(1, MAX_SLOTS);
        Box::new(Pool {
            queue: GlobalQueue::new(),
            slots: Slots::new(max_threads),
            active_threads: StdAtomicUsize::new(0),
            handles: (0..max_threads).map(|_| Mutex::new(None)).collect(),
            stack_size: options.stack_size,
        })
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn global_queue(&self) -> &GlobalQueue {
        &self.queue
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        IdleQueue::flags(self.slots.idle().load(Ordering::Acquire)) & IS_SHUTDOWN != 0
    }

    pub(crate) fn active_threads(&self) -> usize {
        self.active_threads.load(StdOrdering::Acquire)
    }

    /// Returns the `Thread` bound to `slot_index`, if it is currently
    /// `Associated` (live, whether running or parked).
    pub(crate) fn associated_worker(&self, slot_index: usize) -> Option<&Thread> {
        match self.slots.get(slot_index).load(Ordering::Acquire) {
            SlotState::Associated { thread } => {
                // SAFETY: an `Associated` slot's thread pointer is valid for as
                // long as the slot remains `Associated`; we only read fields
                // (`queue`, `ptr`, `idle_next`) the owning worker publishes
                // before it sets this state and clears on exit.
                Some(unsafe { thread.as_ref() })
            }
            _ => None,
        }
    }

    /// External enqueue: always goes to the global queue, then requests a wake.
    pub(crate) fn push_external(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        assert!(!self.is_shutdown(), "schedule observed after pool shutdown");
        self.queue.push(batch);
        self.resume_thread(false);
    }

    /// Publishes a freshly started worker's address into its slot, transitioning
    /// `Spawning -> Associated`. Performed by the new worker itself.
    pub(crate) fn publish_worker(&self, slot_index: usize, thread: NonNull<Thread>) {
        let slot = self.slots.get(slot_index);
        loop {
            let current = slot.load(Ordering::Acquire);
            debug_assert!(
                matches!(current, SlotState::Spawning),
                "worker publication expects its slot to still be Spawning"
            );
            if slot
                .compare_exchange(
                    current,
                    SlotState::Associated { thread },
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Enforces "at most one waker in flight": spawns a worker for a `Free`
    /// slot, wakes an `Associated` (parked) one, or merely records
    /// `IS_NOTIFIED` if the idle stack is empty.
    pub(crate) fn resume_thread(&self, was_waking: bool) {
        loop {
            let word = self.slots.idle().load(Ordering::Acquire);
            let flags = IdleQueue::flags(word);
            if flags & IS_SHUTDOWN != 0 {
                panic!("resume_thread observed shutdown");
            }
            if !was_waking && flags & (IS_WAKING | IS_NOTIFIED) != 0 {
                return; // another waker already in flight
            }

            match self.slots.pop_idle() {
                PopOutcome::Shutdown => panic!("resume_thread observed shutdown"),
                PopOutcome::Empty(observed) => {
                    let new_word = observed | IS_NOTIFIED;
                    if self
                        .slots
                        .idle()
                        .compare_exchange(observed, new_word, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        return;
                    }
                    continue;
                }
                PopOutcome::Popped { index, state } => {
                    self.active_threads.fetch_add(1, StdOrdering::AcqRel);
                    match state {
                        SlotState::Associated { thread } => {
                            // SAFETY: popped from the idle stack, so this worker
                            // is parked (or about to park) and its `Thread` is
                            // alive until it transitions out of `Associated`.
                            let thread = unsafe { thread.as_ref() };
                            thread.wake_with_pool_signal(self as *const Pool as usize);
                        }
                        SlotState::Free { .. } => {
                            self.spawn_worker(index);
                        }
                        _ => unreachable!("idle stack only ever links Free or Associated slots"),
                    }
                    return;
                }
            }
        }
    }

    /// Claims a `Free` slot for the calling OS-thread to run inline as worker 0,
    /// without spawning a new OS thread. Only used once, at `run` startup.
    pub(crate) fn take_inline_worker_slot(&self) -> usize {
        match self.slots.pop_idle() {
            PopOutcome::Popped { index, state: SlotState::Free { .. } } => {
                // Already exclusively ours: we just popped it off the idle stack.
                self.slots.get(index).store(SlotState::Spawning, Ordering::Release);
                self.active_threads.fetch_add(1, StdOrdering::AcqRel);
                index
            }
            _ => unreachable!("a freshly initialized pool's idle stack is all Free slots"),
        }
    }

    fn spawn_worker(&self, slot_index: usize) {
        // Already exclusively ours: `resume_thread` just popped it off the idle
        // stack as `Free`.
        self.slots.get(slot_index).store(SlotState::Spawning, Ordering::Release);

        let pool_ptr = NonNull::from(self);
        let mut builder = std::thread::Builder::new();
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        let spawned = builder.spawn(move || worker::run_worker(pool_ptr, slot_index));

        match spawned {
            Ok(handle) => {
                *self.handles[slot_index].lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
                    Some(handle);
            }
            Err(_) => {
                // OS-thread spawn failed: undo the accounting and push the slot
                // back onto the idle stack as `Free`.
                self.active_threads.fetch_sub(1, StdOrdering::AcqRel);
                self.slots.get(slot_index).store(SlotState::Free { next: 0 }, Ordering::Release);
                self.slots.push_idle(slot_index, SlotState::Free { next: 0 });
            }
        }
    }

    /// Re-links `thread`'s slot onto the idle stack as `Associated`, clears
    /// `IS_WAKING`, and consumes a pending `IS_NOTIFIED` if present. Returns
    /// whether the caller should actually block.
    pub(crate) fn suspend_thread(&self, thread: &Thread) -> bool {
        self.slots.push_idle(thread.slot_index, SlotState::Associated { thread: NonNull::from(thread) });

        loop {
            let word = self.slots.idle().load(Ordering::Acquire);
            let flags = IdleQueue::flags(word);
            let mut new_flags = flags & !IS_WAKING;
            let was_notified = flags & IS_NOTIFIED != 0;
            if was_notified {
                new_flags &= !IS_NOTIFIED;
            }
            let new_word = IdleQueue::pack(IdleQueue::top(word), IdleQueue::aba(word), new_flags);
            if self
                .slots
                .idle()
                .compare_exchange(word, new_word, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            if was_notified {
                return false; // don't block, we were notified before parking
            }

            // `active_threads` only counts *running* workers; `resume_thread`
            // re-increments it when this worker is later popped off the idle
            // stack and woken.
            let remaining = self.active_threads.fetch_sub(1, StdOrdering::AcqRel) - 1;
            if remaining == 0 && self.queue.is_empty() {
                self.initiate_shutdown();
            }
            return true;
        }
    }

    fn initiate_shutdown(&self) {
        #[cfg(feature = "tracing")]
        tracing::trace!(worker_count = self.worker_count(), "initiating shutdown");
        self.slots.idle().fetch_or(IS_SHUTDOWN, Ordering::AcqRel);
        for index in 0..self.slots.len() {
            if let SlotState::Associated { thread } = self.slots.get(index).load(Ordering::Acquire) {
                // SAFETY: still `Associated`; the worker either hasn't parked
                // yet (will observe shutdown on its next poll/park cycle) or is
                // parked and waiting on exactly this wake.
                let thread = unsafe { thread.as_ref() };
                thread.ptr.store(0, Ordering::Release);
                thread.notify();
            }
        }
    }

    /// Joins every worker thread that was ever spawned (skipping slots that
    /// never got an OS thread, e.g. the inline worker-0 case).
    pub(crate) fn join_all(&self) {
        for handle_slot in self.handles.iter() {
            let handle = handle_slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
            if let Some(handle) = handle {
                if handle.join().is_err() && !std::thread::panicking() {
                    panic!("a pool worker thread panicked");
                }
            }
        }
    }
}

impl core::fmt::Debug for Pool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pool")
            .field("worker_count", &self.worker_count())
            .field("active_threads", &self.active_threads())
            .field("is_shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_pool_has_no_active_threads_and_is_not_shut_down() {
        let pool = Pool::new(&PoolOptions { max_threads: 4, stack_size: None });
        assert_eq!(pool.active_threads(), 0);
        assert!(!pool.is_shutdown());
        assert_eq!(pool.worker_count(), 4);
    }

    #[test]
    fn max_threads_is_clamped_into_one_and_max_slots() {
        let zero = Pool::new(&PoolOptions { max_threads: 0, stack_size: None });
        assert_eq!(zero.worker_count(), 1);

        let huge = Pool::new(&PoolOptions { max_threads: MAX_SLOTS + 1000, stack_size: None });
        assert_eq!(huge.worker_count(), MAX_SLOTS);
    }

    #[test]
    fn take_inline_worker_slot_claims_one_slot_without_spawning() {
        let pool = Pool::new(&PoolOptions { max_threads: 3, stack_size: None });
        let index = pool.take_inline_worker_slot();
        assert!(index < pool.worker_count());
        assert_eq!(pool.active_threads(), 1);
        assert!(matches!(pool.slots.get(index).load(Ordering::Acquire), SlotState::Spawning));
    }
}
