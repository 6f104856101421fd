//! Low-level, platform-facing primitives shared by the `skein` scheduler.
//!
//! This crate carries the parts of a scheduler that are not specific to scheduling:
//! atomic re-exports with a `portable_atomic` fallback, cache-line padding, an
//! exponential-backoff spin helper, and a genuine blocking park/unpark event used to
//! put worker threads to sleep.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod sync;
pub mod thread;
pub mod utils;

pub use utils::{Backoff, CachePadded};

#[cfg(feature = "std")]
pub use utils::Event;
