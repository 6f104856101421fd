//! A user-space M:N task scheduler: a thread pool that multiplexes a large
//! number of lightweight, resumable continuations across a bounded set of
//! worker threads.
//!
//! The entry point is [`run`]. From inside the entry future (or anything it
//! spawns), use [`spawn`] to fork child work, [`spawn_next`] for a LIFO
//! hand-off hint, [`yield_now`] to cooperatively hand control back to the
//! scheduler, and [`Batch`] for the lower-level batch operations.
//!
//! Unlike `skein_os`, this crate is `std`-only: it spawns real OS threads, which
//! has no `no_std` realization.

extern crate alloc;

mod error;
mod global_queue;
mod local_queue;
mod pool;
mod slot;
mod task;
mod worker;

use alloc::boxed::Box;
use core::future::Future;
use core::ptr::NonNull;

pub use error::PoolError;
pub use pool::{PoolOptions, MAX_SLOTS};
pub use task::Batch;
pub use worker::yield_now;

use pool::Pool;

/// A handle to a spawned task's eventual output.
///
/// Dropping a `JoinHandle` cancels the task (it will not be polled again); use
/// [`JoinHandle::detach`] to let it keep running in the background.
#[must_use = "tasks are canceled when their handle is dropped; use `.detach()` to run in the background"]
pub struct JoinHandle<T>(async_task::Task<T>);

impl<T> JoinHandle<T> {
    /// Detaches the task, letting it keep running without anyone awaiting it.
    pub fn detach(self) {
        self.0.detach();
    }

    /// Returns `true` if the task has finished running.
    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;
    fn poll(
        mut self: core::pin::Pin<&mut Self>,
        cx: &mut core::task::Context<'_>,
    ) -> core::task::Poll<T> {
        #[expect(unsafe_code, reason = "projecting to a pinned field of a repr(transparent)-like wrapper")]
        unsafe {
            core::pin::Pin::new_unchecked(&mut self.0).poll(cx)
        }
    }
}

/// Forks `future` onto the pool, returning a handle to its output.
///
/// # Panics
///
/// Panics if called from outside a running worker — fork new work from the
/// entry future or from a task it (transitively) spawned.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let pool = worker::current_pool().expect("spawn called from outside a worker");
    let schedule = move |runnable| worker::reschedule_on_wake(pool, runnable);
    let (batch, handle) = task::new_task(future, schedule);
    batch.schedule();
    JoinHandle(handle)
}

/// Forks `future` onto the pool as the calling worker's next direct hand-off
/// (the LIFO switch-to chain), rather than the back of the local ring.
///
/// A second `spawn_next` call before the first's target runs demotes that
/// first target to a normal (FIFO) local enqueue.
///
/// # Panics
///
/// Panics if called from outside a running worker, for the same reason as
/// [`spawn`].
pub fn spawn_next<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let pool = worker::current_pool().expect("spawn_next called from outside a worker");
    let schedule = move |runnable| worker::reschedule_on_wake(pool, runnable);
    let (batch, handle) = task::new_task(future, schedule);
    batch.schedule_next();
    JoinHandle(handle)
}

/// Runs `future` to completion on a fresh pool, blocking the calling thread.
///
/// The calling OS thread becomes worker 0, running inline rather than through a
/// spawned `std::thread`; it returns only once `future` has completed and
/// every other spawned worker has parked or shut down.
///
/// # Errors
///
/// Returns [`PoolError::AsyncFnDeadlocked`] if every worker parks without
/// `future` ever completing (e.g. it awaits something nothing in the pool will
/// ever notify).
pub fn run<F>(options: PoolOptions, future: F) -> Result<F::Output, PoolError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let pool = Pool::new(&options);
    let pool_ptr = NonNull::from(Box::leak(pool));

    // SAFETY: `pool_ptr` stays valid for the rest of this function; it is only
    // freed at the very end, after every worker (including the inline one
    // spawned below) has returned from its run loop.
    let pool_ref = unsafe { pool_ptr.as_ref() };

    let result = alloc::sync::Arc::new(std::sync::Mutex::new(None));
    let result_slot = alloc::sync::Arc::clone(&result);

    let entry = async move {
        let output = future.await;
        *result_slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(output);
    };

    let schedule = move |runnable| worker::reschedule_on_wake(pool_ptr, runnable);
    let (batch, handle) = task::new_task(entry, schedule);
    handle.detach();

    // Push directly rather than through `push_external`: no worker exists yet to
    // wake, and the very next step makes the calling thread into worker 0.
    pool_ref.global_queue().push(batch);

    let slot_index = pool_ref.take_inline_worker_slot();
    worker::run_worker(pool_ptr, slot_index);

    pool_ref.join_all();

    // SAFETY: every worker (inline and spawned) has returned and been joined;
    // nothing else holds a reference to the pool.
    let pool = unsafe { Box::from_raw(pool_ptr.as_ptr()) };
    drop(pool);

    match alloc::sync::Arc::try_unwrap(result) {
        Ok(cell) => match cell.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner) {
            Some(output) => Ok(output),
            None => Err(PoolError::AsyncFnDeadlocked),
        },
        Err(_) => Err(PoolError::AsyncFnDeadlocked),
    }
}

// The end-to-end scenarios (hello-task, fan-out, yield fairness, LIFO hint,
// overflow, deadlock detection) live in `tests/scheduler.rs` as black-box
// integration tests against this public surface.
