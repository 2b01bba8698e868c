//! Size-segregated dispatch over one-size heaps.
//!
//! One heap per size class; dispatch is a single array index. The free path
//! recovers the object's size from its owning reap (address-based) before
//! indexing, so nothing about the object needs to be passed in.

use std::ptr::NonNull;

use crate::one_size::{object_size_of, OneSizeHeap, SizedHeap};
use crate::partition::PageSource;
use crate::size_class::{size_to_index, MAX_DEDICATED_SIZE};

/// Largest size served by the high-frequency path.
pub const MAX_FREQ_SIZE: usize = MAX_DEDICATED_SIZE;
const NUM_CLASSES: usize = size_to_index(MAX_FREQ_SIZE) + 1;

#[cfg(feature = "object-cache")]
type PerSizeHeap = crate::object_cache::CacheHeap<OneSizeHeap>;
#[cfg(not(feature = "object-cache"))]
type PerSizeHeap = OneSizeHeap;

/// The high-frequency path: an array of per-size heaps.
pub struct SegSizeHeap {
    heaps: Box<[PerSizeHeap]>,
}

impl SegSizeHeap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heaps: (0..NUM_CLASSES).map(|_| PerSizeHeap::default()).collect(),
        }
    }

    /// Allocates one object of `size` bytes (`size ≤ MAX_FREQ_SIZE`).
    pub fn allocate(&mut self, size: usize, source: &PageSource) -> Option<NonNull<u8>> {
        debug_assert!(size > 0 && size <= MAX_FREQ_SIZE);
        self.heaps[size_to_index(size)].allocate(size, source)
    }

    /// Frees one object, routing by the size recorded in its subheap.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap's `allocate`, not freed
    /// since, and `tag` must be its partition tag.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>, tag: u8, source: &PageSource) {
        let size = unsafe { object_size_of(ptr, tag) };
        debug_assert!(size > 0 && size <= MAX_FREQ_SIZE);
        unsafe { self.heaps[size_to_index(size)].release(ptr, tag, source) };
    }

    /// Usable size of a live object.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live object of this heap with partition tag `tag`.
    pub unsafe fn size_of(ptr: NonNull<u8>, tag: u8) -> usize {
        unsafe { object_size_of(ptr, tag) }
    }
}

impl Default for SegSizeHeap {
    fn default() -> Self {
        Self::new()
    }
}
