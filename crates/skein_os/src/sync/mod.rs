//! Shared-ownership and atomic primitives.
//!
//! `Arc`/`Weak` are re-exported from `alloc` so callers never need to choose between
//! `std::sync` and `alloc::sync` directly; `atomic` re-exports `core::sync::atomic`
//! with a `portable_atomic` fallback for targets missing native atomic widths.

pub mod atomic;

pub use alloc::sync::{Arc, Weak};
