//! A continuation with exactly two fields: an intrusive link and a run capability.
//!
//! [`Task`] is the node every queue in this crate links through: the local ring
//! stores `*mut Task`, the global MPSC links tasks through `next` directly, and
//! [`Batch`] is the private owning list used to move groups of them around. A task
//! is always owned by at most one queue or worker at a time; ownership transfers by
//! moving pointers, never by copying state.
#![expect(unsafe_code, reason = "intrusive linked list of boxed nodes")]

use alloc::boxed::Box;
use core::fmt;
use core::future::Future;
use core::ptr::{self, NonNull};

use async_task::Runnable;

use skein_os::sync::atomic::{AtomicPtr, Ordering};

use crate::worker;

/// An opaque, runnable continuation.
///
/// Every `Task` is a heap allocation owning one [`async_task::Runnable`] (the "run
/// capability") plus the intrusive `next` link every queue in this crate uses.
/// Users never construct a bare `Task` directly; [`spawn`] produces one already
/// wrapped in a [`Batch`] of length one, ready for [`Batch::schedule`] or
/// [`Batch::schedule_next`].
pub struct Task {
    next: AtomicPtr<Task>,
    // `None` only for the global queue's dummy stub node, which is never run.
    runnable: Option<Runnable>,
}

impl Task {
    pub(crate) fn new(runnable: Runnable) -> Box<Task> {
        Box::new(Task {
            next: AtomicPtr::new(ptr::null_mut()),
            runnable: Some(runnable),
        })
    }

    /// A stub node carrying no runnable, used to anchor the global MPSC queue.
    pub(crate) fn new_dummy() -> Box<Task> {
        Box::new(Task {
            next: AtomicPtr::new(ptr::null_mut()),
            runnable: None,
        })
    }

    /// Runs this task's continuation to its next suspension point, consuming it.
    ///
    /// The `runnable`'s own schedule closure (installed at spawn time) is what
    /// re-enqueues the task if it suspends rather than completes; by the time this
    /// call returns, the `Task` node itself has been consumed either way.
    pub(crate) fn run(self: Box<Task>) {
        let Task { runnable, .. } = *self;
        runnable
            .expect("the stub node is never linked into a ring or scheduled")
            .run();
    }

    #[inline(always)]
    pub(crate) fn next_ptr(&self) -> *mut Task {
        self.next.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn set_next(&self, next: *mut Task) {
        self.next.store(next, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn into_raw(self: Box<Task>) -> NonNull<Task> {
        NonNull::new(Box::into_raw(self)).expect("box pointer is never null")
    }

    /// # Safety
    /// `ptr` must have come from [`Task::into_raw`] and not yet been reclaimed.
    #[inline(always)]
    pub(crate) unsafe fn from_raw(ptr: NonNull<Task>) -> Box<Task> {
        unsafe { Box::from_raw(ptr.as_ptr()) }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("next", &self.next_ptr()).finish()
    }
}

// -----------------------------------------------------------------------------
// Batch

/// A private, owning, singly-linked list of [`Task`]s.
///
/// `head == None` if and only if `len == 0`; when non-empty, `tail` is reachable
/// from `head` via `len - 1` `next` traversals and `tail.next == null`. Batches are
/// moved by value; [`Batch::schedule`] and [`Batch::schedule_next`] consume one.
pub struct Batch {
    head: Option<NonNull<Task>>,
    tail: Option<NonNull<Task>>,
    len: usize,
}

// SAFETY: a Batch owns its tasks exclusively; the tasks themselves carry whatever
// the spawned future requires to be Send.
unsafe impl Send for Batch {}

impl Batch {
    /// An empty batch.
    pub const fn new() -> Self {
        Batch { head: None, tail: None, len: 0 }
    }

    /// A batch containing exactly one task.
    pub(crate) fn from_task(task: Box<Task>) -> Self {
        let ptr = task.into_raw();
        Batch { head: Some(ptr), tail: Some(ptr), len: 1 }
    }

    /// Number of tasks currently in the batch.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pushes `task` to the front of the batch in O(1).
    pub(crate) fn push_front(&mut self, task: Box<Task>) {
        let ptr = task.into_raw();
        unsafe { ptr.as_ref().set_next(self.head.map_or(ptr::null_mut(), |h| h.as_ptr())) };
        self.head = Some(ptr);
        if self.tail.is_none() {
            self.tail = Some(ptr);
        }
        self.len += 1;
    }

    /// Pushes `task` to the back of the batch in O(1).
    pub(crate) fn push_back(&mut self, task: Box<Task>) {
        let ptr = task.into_raw();
        unsafe { ptr.as_ref().set_next(ptr::null_mut()) };
        match self.tail {
            Some(t) => unsafe { t.as_ref().set_next(ptr.as_ptr()) },
            None => self.head = Some(ptr),
        }
        self.tail = Some(ptr);
        self.len += 1;
    }

    /// Prepends another batch's tasks, in order, in O(1). `other` is left empty.
    pub fn push_front_many(&mut self, mut other: Batch) {
        if other.is_empty() {
            return;
        }
        unsafe { other.tail.unwrap().as_ref().set_next(self.head.map_or(ptr::null_mut(), |h| h.as_ptr())) };
        if self.tail.is_none() {
            self.tail = other.tail;
        }
        self.head = other.head;
        self.len += other.len;
        other.head = None;
        other.tail = None;
        other.len = 0;
    }

    /// Appends another batch's tasks, in order, in O(1). `other` is left empty.
    pub fn push_back_many(&mut self, mut other: Batch) {
        if other.is_empty() {
            return;
        }
        match self.tail {
            Some(t) => unsafe { t.as_ref().set_next(other.head.unwrap().as_ptr()) },
            None => self.head = other.head,
        }
        self.tail = other.tail;
        self.len += other.len;
        other.head = None;
        other.tail = None;
        other.len = 0;
    }

    /// Removes and returns the task at the front of the batch, if any.
    pub(crate) fn pop_front(&mut self) -> Option<Box<Task>> {
        let head = self.head?;
        let next = unsafe { head.as_ref().next_ptr() };
        self.head = NonNull::new(next);
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(unsafe { Task::from_raw(head) })
    }

    /// Schedules every task in the batch, consuming it.
    ///
    /// From inside a worker, tasks land on that worker's local ring (overflowing to
    /// the global queue if it doesn't fit). From outside a worker, the whole batch
    /// goes straight to the global queue. Either way, a wake/spawn is requested
    /// afterwards.
    pub fn schedule(self) {
        worker::schedule_batch(self);
    }

    /// Decomposes the batch into its raw `(head, tail)` pointer pair without
    /// running `Drop` (ownership of the chain transfers intact to whichever queue
    /// receives it). Returns `None` for an empty batch.
    pub(crate) fn into_raw_chain(self) -> Option<(NonNull<Task>, NonNull<Task>)> {
        let batch = core::mem::ManuallyDrop::new(self);
        Some((batch.head?, batch.tail?))
    }

    /// Requests that this batch's single task run next on the calling worker's
    /// direct-hop chain, bypassing the queues entirely.
    ///
    /// # Panics
    ///
    /// Panics if called with anything other than a single task, or from outside a
    /// worker (the direct-hop chain only exists within a running worker).
    pub fn schedule_next(mut self) {
        assert_eq!(self.len, 1, "schedule_next requires exactly one task");
        let task = self.pop_front().expect("checked non-empty above");
        worker::schedule_next(task);
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}

/// Spawns a future onto the pool, returning a [`Batch`] of one holding the task and
/// a handle that resolves to the future's output.
///
/// Must be called with a pool running (either from inside a worker, or from any
/// thread while [`crate::run`] is executing elsewhere — the latter goes
/// through the external enqueue path).
pub(crate) fn new_task<F>(future: F, schedule: impl Fn(Runnable) + Send + Sync + 'static) -> (Batch, async_task::Task<F::Output>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let (runnable, handle) = async_task::spawn(future, schedule);
    (Batch::from_task(Task::new(runnable)), handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_task() -> Batch {
        let (batch, handle) = new_task(async {}, |_| {});
        handle.detach();
        batch
    }

    #[test]
    fn from_task_then_pop_front_yields_one_and_empties() {
        let mut batch = one_task();
        assert_eq!(batch.len(), 1);
        assert!(batch.pop_front().is_some());
        assert!(batch.is_empty());
        assert!(batch.pop_front().is_none());
    }

    #[test]
    fn push_back_many_preserves_order() {
        let mut a = Batch::new();
        a.push_back(new_task(async {}, |_| {}).0.pop_front().unwrap());
        let mut b = Batch::new();
        b.push_back_many(one_task());
        b.push_back_many(one_task());

        a.push_back_many(b);
        assert_eq!(a.len(), 3);
        let mut drained = 0;
        while a.pop_front().is_some() {
            drained += 1;
        }
        assert_eq!(drained, 3);
    }

    #[test]
    fn push_front_many_prepends() {
        let mut front = one_task();
        let back = one_task();
        front.push_front_many(back);
        assert_eq!(front.len(), 2);
        assert!(front.pop_front().is_some());
        assert!(front.pop_front().is_some());
        assert!(front.is_empty());
    }

    #[test]
    fn dropping_a_nonempty_batch_frees_every_task() {
        let mut batch = Batch::new();
        for _ in 0..10 {
            batch.push_back_many(one_task());
        }
        drop(batch);
    }

    #[test]
    #[should_panic(expected = "schedule_next requires exactly one task")]
    fn schedule_next_rejects_multi_task_batches() {
        let mut batch = one_task();
        batch.push_back_many(one_task());
        batch.schedule_next();
    }
}
