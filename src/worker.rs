//! Per-worker state and the poll → run-with-LIFO-chaining → park → wake →
//! shutdown run loop.
#![expect(unsafe_code, reason = "thread-local worker pointer, slot publication")]

use alloc::boxed::Box;
use core::cell::Cell;
use core::hash::BuildHasher;
use core::ptr::{self, NonNull};
use std::hash::RandomState;
use std::thread_local;

use skein_os::sync::atomic::{AtomicUsize, Ordering};
use skein_os::Event;

use crate::local_queue::LocalQueue;
use crate::pool::Pool;
use crate::slot::SlotState;
use crate::task::{Batch, Task};

/// Number of local tasks processed before a worker re-steals from the global
/// queue for fairness.
const FAIRNESS_STEALING_INTERVAL: u32 = 61;

/// Bounded number of direct LIFO hops before a worker forces itself back through
/// the full poll loop, preserving fairness.
const MAX_DIRECT_HOPS: u32 = 7;

/// Sentinel value of `Thread::ptr` meaning "no pending direct successor".
const NO_SUCCESSOR: usize = 1;

// -----------------------------------------------------------------------------
// XorShift64Star

const FIXED_STATE: u64 = 0x9a7013f475bb8c23;

/// A fast pseudorandom generator for randomized steal-victim selection.
///
/// [xorshift*](https://en.wikipedia.org/wiki/Xorshift#xorshift*) tolerates weak
/// seeding as long as the seed isn't zero.
pub(crate) struct XorShift64Star {
    state: Cell<u64>,
}

impl XorShift64Star {
    pub(crate) const fn fixed() -> Self {
        XorShift64Star { state: Cell::new(FIXED_STATE) }
    }

    fn next(&self) -> u64 {
        let mut x = self.state.get();
        debug_assert_ne!(x, 0);
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state.set(x);
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    pub(crate) fn next_usize(&self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

fn random_nonzero_seed() -> u64 {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let rs = RandomState::new();
    let mut seed = 0;
    while seed == 0 {
        seed = rs.hash_one(COUNTER.fetch_add(1, Ordering::Relaxed));
    }
    seed
}

// -----------------------------------------------------------------------------
// Thread

/// Per-worker record, owned by the worker's OS-thread stack.
///
/// Its address is published into its slot only after every field is
/// initialized (see `Pool::run_worker`).
pub(crate) struct Thread {
    /// Switch-to pointer: `NO_SUCCESSOR` means no pending direct successor,
    /// `0` is the shutdown wake-up signal, any other value is a `*const Task`.
    pub(crate) ptr: AtomicUsize,
    pool: NonNull<Pool>,
    pub(crate) slot_index: usize,
    pub(crate) queue: LocalQueue,
    event: Event,
    xor_shift: XorShift64Star,
    ticks: Cell<u32>,
    /// Idle-stack link used only while this slot is `Associated` and parked;
    /// see `crate::slot`.
    pub(crate) idle_next: AtomicUsize,
}

// SAFETY: `Thread` is only ever accessed either by its owning worker thread or,
// for `ptr`/`idle_next`/`event`, through the synchronized slot/idle-stack
// protocol that serializes cross-thread access.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    fn new(pool: NonNull<Pool>, slot_index: usize) -> Box<Thread> {
        let thread = Box::new(Thread {
            ptr: AtomicUsize::new(NO_SUCCESSOR),
            pool,
            slot_index,
            queue: LocalQueue::new(),
            event: Event::new(),
            xor_shift: XorShift64Star::fixed(),
            ticks: Cell::new(0),
            idle_next: AtomicUsize::new(0),
        });
        let seed = random_nonzero_seed() ^ (pool.as_ptr() as u64) ^ (slot_index as u64);
        thread.xor_shift.state.set(seed | 1);
        thread
    }

    fn pool(&self) -> &Pool {
        // SAFETY: the pool outlives every worker it spawned (`Pool::run` joins
        // all workers before tearing down).
        unsafe { self.pool.as_ref() }
    }

    /// Wakes this worker from a park, or cancels a pending park that hasn't
    /// happened yet.
    pub(crate) fn notify(&self) {
        self.event.notify();
    }

    /// Publishes `pool_ptr` into `self.ptr` (non-zero) then sets the event, used
    /// by `resume_thread`'s wake path to ensure a parked worker sees a non-shutdown
    /// signal when it wakes.
    pub(crate) fn wake_with_pool_signal(&self, pool_ptr: usize) {
        self.ptr.compare_exchange(0, pool_ptr, Ordering::Relaxed, Ordering::Relaxed).ok();
        self.event.notify();
    }
}

thread_local! {
    static CURRENT: Cell<*const Thread> = const { Cell::new(ptr::null()) };
}

fn with_current<R>(f: impl FnOnce(&Thread) -> R) -> Option<R> {
    CURRENT.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            None
        } else {
            // SAFETY: only ever set to a `Thread` that outlives the run loop
            // call that set it (see `Pool::run_worker`).
            Some(f(unsafe { &*ptr }))
        }
    })
}

/// Returns the pool the calling thread's worker is bound to, if any.
pub(crate) fn current_pool() -> Option<NonNull<Pool>> {
    with_current(|thread| thread.pool)
}

/// The async-task "schedule" callback used for every task spawned in this
/// crate: invoked whenever a task's waker fires. Works from any calling thread —
/// within a worker bound to `pool`, it goes to that worker's local ring (cheap,
/// no cross-thread traffic); otherwise it falls back to `pool`'s external
/// enqueue. Unlike the public `Batch::schedule`, this never panics: a waker can
/// legitimately fire from a foreign thread (timers, I/O completion).
pub(crate) fn reschedule_on_wake(pool: NonNull<Pool>, runnable: async_task::Runnable) {
    let batch = Batch::from(Task::new(runnable));
    let handled = CURRENT.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            return None;
        }
        // SAFETY: see `with_current`.
        let thread = unsafe { &*ptr };
        if !core::ptr::eq(thread.pool.as_ptr(), pool.as_ptr()) {
            return None;
        }
        Some(thread)
    });

    match handled {
        Some(thread) => {
            if let Some(overflow) = thread.queue.push_many_from_batch(batch) {
                thread.pool().push_external(overflow);
            } else {
                thread.pool().resume_thread(false);
            }
        }
        // SAFETY: the pool outlives every task it could still be scheduling.
        None => unsafe { pool.as_ref() }.push_external(batch),
    }
}

/// Schedules `batch`, consuming it.
///
/// From inside a worker: appended to that worker's local ring (overflowing to
/// the global queue if it doesn't fit). From outside: pushed straight to the
/// global queue. Either way, `resume_thread` is invoked afterwards.
pub(crate) fn schedule_batch(batch: Batch) {
    match with_current(|thread| {
        let overflow = thread.queue.push_many_from_batch(batch);
        let pool = thread.pool();
        if let Some(overflow) = overflow {
            pool.push_external(overflow);
        } else {
            pool.resume_thread(false);
        }
    }) {
        Some(()) => {}
        None => panic!("schedule from outside a worker"),
    }
}

/// Requests LIFO hand-off of `task` on the calling worker's direct-hop chain.
///
/// A second call before an intervening suspension demotes the previously
/// pending successor to the back of the local ring.
pub(crate) fn schedule_next(task: Box<Task>) {
    match with_current(|thread| {
        let new_ptr = task.into_raw().as_ptr() as usize;
        let prev = thread.ptr.swap(new_ptr, Ordering::AcqRel);
        if prev != NO_SUCCESSOR && prev != 0 {
            // SAFETY: `prev` was published by an earlier `schedule_next` on this
            // same worker and not yet consumed by the run loop.
            let prev_task = unsafe { Task::from_raw(NonNull::new_unchecked(prev as *mut Task)) };
            if let Some(overflow) = thread.queue.push_many_from_batch(Batch::from(prev_task)) {
                thread.pool().push_external(overflow);
            }
        }
    }) {
        Some(()) => {}
        None => panic!("schedule_next from outside a worker"),
    }
}

/// Reschedules the current continuation to the back of the local ring and
/// suspends (`Task::yield`).
pub async fn yield_now() {
    futures_lite::future::yield_now().await;
}

// -----------------------------------------------------------------------------
// Run loop

enum PollResult {
    Found { task: Box<Task>, polled_global: bool },
    None,
}

impl Thread {
    fn poll(&self) -> PollResult {
        if let Some(task) = self.queue.pop_local() {
            return PollResult::Found { task, polled_global: false };
        }

        let pool = self.pool();
        if let Some(guard) = pool.global_queue().try_lock() {
            if let Some(task) = guard.pop() {
                // Drain a burst into the local ring while there's room.
                while self.queue.len() < crate::local_queue::N {
                    match guard.pop() {
                        Some(extra) => {
                            if let Some(overflow) =
                                self.queue.push_many_from_batch(Batch::from(extra))
                            {
                                pool.push_external(overflow);
                                break;
                            }
                        }
                        None => break,
                    }
                }
                return PollResult::Found { task, polled_global: true };
            }
        }

        let siblings = pool.worker_count();
        if siblings > 1 {
            let start = self.xor_shift.next_usize(siblings);
            for offset in 0..siblings {
                let victim_index = (start + offset) % siblings;
                if victim_index == self.slot_index {
                    continue;
                }
                if let Some(victim) = pool.associated_worker(victim_index) {
                    if let Some(task) = victim.queue.steal_into(&self.queue) {
                        return PollResult::Found { task, polled_global: false };
                    }
                }
            }
        }

        PollResult::None
    }

    fn maybe_periodic_steal(&self) {
        self.ticks.set(self.ticks.get() + 1);
        if self.ticks.get() >= FAIRNESS_STEALING_INTERVAL {
            self.ticks.set(0);
            let pool = self.pool();
            if let Some(guard) = pool.global_queue().try_lock() {
                while self.queue.len() < crate::local_queue::N {
                    match guard.pop() {
                        Some(task) => {
                            if let Some(overflow) = self.queue.push_many_from_batch(Batch::from(task))
                            {
                                pool.push_external(overflow);
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Runs the direct-hop chain for one polled task, returning once the chain
    /// is exhausted or the hop budget is spent.
    fn run_chain(&self, mut task: Box<Task>) {
        let mut hops = 0u32;
        loop {
            self.ptr.store(NO_SUCCESSOR, Ordering::Relaxed);
            #[cfg(feature = "tracing")]
            tracing::trace!(slot_index = self.slot_index, hops, "dispatching task");
            task.run();
            self.maybe_periodic_steal();

            let next = self.ptr.load(Ordering::Acquire);
            if next == NO_SUCCESSOR {
                return;
            }
            hops += 1;
            // SAFETY: published by `schedule_next` on this same worker and not
            // yet consumed.
            let next_task = unsafe { Task::from_raw(NonNull::new_unchecked(next as *mut Task)) };
            if hops >= MAX_DIRECT_HOPS {
                if let Some(overflow) = self.queue.push_many_from_batch(Batch::from(next_task)) {
                    self.pool().push_external(overflow);
                }
                return;
            }
            task = next_task;
        }
    }

    /// Runs until `pool.is_shutdown()` or this worker observes its own shutdown
    /// signal.
    pub(crate) fn run(&self) {
        let mut was_waking = true;
        loop {
            match self.poll() {
                PollResult::Found { task, polled_global } => {
                    if polled_global || was_waking {
                        self.pool().resume_thread(was_waking);
                    }
                    was_waking = false;
                    self.run_chain(task);
                }
                PollResult::None => {
                    let should_block = self.pool().suspend_thread(self);
                    if should_block {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(slot_index = self.slot_index, "parking");
                        self.event.park();
                        #[cfg(feature = "tracing")]
                        tracing::trace!(slot_index = self.slot_index, "woke from park");
                    }
                    if self.ptr.load(Ordering::Acquire) == 0 {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(slot_index = self.slot_index, "observed shutdown signal");
                        return; // shutdown
                    }
                    was_waking = true;
                }
            }
        }
    }
}

impl From<Box<Task>> for Batch {
    fn from(task: Box<Task>) -> Self {
        Batch::from_task(task)
    }
}

/// Spawns a worker bound to `pool` at `slot_index`, installing the thread-local
/// `CURRENT` pointer for the duration of `Thread::run`.
pub(crate) fn run_worker(pool: NonNull<Pool>, slot_index: usize) {
    let thread = Thread::new(pool, slot_index);
    let thread_ref: &Thread = &thread;
    CURRENT.with(|cell| cell.set(thread_ref as *const Thread));
    // SAFETY: `thread` is kept alive on this stack frame for the duration of
    // `run`; the slot publication below hands other threads a pointer into it
    // that is only dereferenced while this worker is `Associated` or parked,
    // both of which end before this function returns.
    unsafe { pool.as_ref().publish_worker(slot_index, NonNull::from(thread_ref)) };
    thread.run();
    CURRENT.with(|cell| cell.set(ptr::null()));
}
