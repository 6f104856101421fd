//! Host-thread queries used to size a pool.

use core::num::NonZero;

/// Returns an estimate of the default amount of parallelism a program should use.
///
/// Mirrors [`std::thread::available_parallelism`], but falls back to `1` (never `0`,
/// never an error) when the platform can't answer or the `std` feature is disabled.
pub fn available_parallelism() -> NonZero<usize> {
    #[cfg(feature = "std")]
    {
        std::thread::available_parallelism().unwrap_or(NonZero::<usize>::MIN)
    }
    #[cfg(not(feature = "std"))]
    {
        NonZero::<usize>::MIN
    }
}
