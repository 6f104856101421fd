//! Cache-line padding, the same shape as `crossbeam-utils::CachePadded`.

use core::fmt;
use core::ops::{Deref, DerefMut};

// x86_64/aarch64-class cores prefetch pairs of 64-byte lines, so 128 bytes is the
// commonly used padding width on those targets; everything else falls back to a
// single 64-byte line, which is still correct (just leaves a little contention
// headroom on the table) on targets this crate hasn't been tuned for.
#[cfg_attr(
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    ),
    repr(align(128))
)]
#[cfg_attr(
    not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    )),
    repr(align(64))
)]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Wraps `value`, padding it out to a full cache line.
    #[inline(always)]
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    /// Unwraps the padded value.
    #[inline(always)]
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePadded").field("value", &self.value).finish()
    }
}

impl<T: Default> Default for CachePadded<T> {
    #[inline]
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::CachePadded;
    use core::mem::{align_of, size_of};

    #[test]
    fn pads_out_to_a_line() {
        assert!(size_of::<CachePadded<u8>>() >= 64);
        assert!(align_of::<CachePadded<u8>>() >= 64);
    }

    #[test]
    fn deref_reaches_the_value() {
        let padded = CachePadded::new(42_u32);
        assert_eq!(*padded, 42);
    }
}
