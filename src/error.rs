//! Error types returned from the public surface.
//!
//! Contract violations (invariants this scheduler owns) are not represented here —
//! they panic with a message naming the violated invariant, per the crate's
//! fatal-vs-expected distinction. This enum is only for conditions a caller can
//! reasonably anticipate and react to.

use core::fmt;

/// Conditions a caller of [`crate::run`] can observe and react to.
#[derive(Debug)]
#[non_exhaustive]
pub enum PoolError {
    /// The worker slot array (or a worker's stack) could not be allocated.
    OutOfMemory,
    /// Every worker parked and the entry computation never completed.
    ///
    /// This is not necessarily a bug in the entry computation: it is also what
    /// happens when the entry computation awaits something external (a channel, an
    /// I/O event) that nothing in the pool will ever complete.
    AsyncFnDeadlocked,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::OutOfMemory => f.write_str("failed to allocate pool resources"),
            PoolError::AsyncFnDeadlocked => {
                f.write_str("entry computation never completed: all workers parked")
            }
        }
    }
}

impl core::error::Error for PoolError {}
