//! Mutual-exclusion decorator for composition layers.
//!
//! The core heaps are not internally thread-safe; thread safety comes from
//! wrapping a whole layer in `Locked` and taking the mutex around every
//! public operation. The default composition carries three such wraps: the
//! high-frequency path, the low-frequency path, and the partition space, so
//! a small-object and a large-object allocation can proceed in parallel.

use parking_lot::{Mutex, MutexGuard};

/// A composition layer behind a single mutex.
pub struct Locked<H> {
    inner: Mutex<H>,
}

impl<H> Locked<H> {
    /// Wraps `inner`.
    pub const fn new(inner: H) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Acquires the layer for one or more operations.
    pub fn lock(&self) -> MutexGuard<'_, H> {
        self.inner.lock()
    }
}
