//! Low-level synchronization building blocks shared by the scheduler.
//!
//! - [`Backoff`]: exponential backoff for spin/CAS retry loops.
//! - [`CachePadded`]: cache-line isolation for contended atomics.
//! - [`Event`]: a real blocking park/unpark primitive for parked workers.

mod backoff;
mod cache_padded;

#[cfg(feature = "std")]
mod event;

pub use backoff::Backoff;
pub use cache_padded::CachePadded;

#[cfg(feature = "std")]
pub use event::Event;

#[cfg(all(test, feature = "std"))]
#[allow(dead_code, reason = "tests")]
pub(crate) mod tests {
    use core::{any::Any, panic::AssertUnwindSafe, sync::atomic};
    use std::{boxed::Box, panic, thread};

    pub(crate) fn test_unwind_panic<R>(f: impl FnOnce() -> R) -> Result<R, Box<dyn Any + Send>> {
        let prev_hook = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));

        let result = panic::catch_unwind(AssertUnwindSafe(f));

        panic::set_hook(prev_hook);
        result
    }

    pub(crate) fn test_thread_panic<F, T>(f: F) -> Result<T, Box<dyn Any + Send>>
    where
        F: FnOnce() -> T,
        F: Send + 'static,
        T: Send + 'static,
    {
        let prev_hook = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));
        atomic::fence(atomic::Ordering::SeqCst);
        let result = thread::spawn(f).join();
        panic::set_hook(prev_hook);
        result
    }
}
