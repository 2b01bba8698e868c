//! A layered general-purpose memory allocator.
//!
//! Vam composes specialized sub-allocators so every request lands on the
//! structure best suited to serve it:
//!
//! - A **frequency classifier** watches request sizes and promotes popular
//!   small sizes to a **high-frequency path**: size-segregated subheaps
//!   ("reaps") that bump-allocate fresh slots and recycle freed ones through
//!   bitmaps.
//! - Everything else takes the **low-frequency path**: boundary-tagged
//!   blocks carved out of partition-sized superchunks by splitting, merged
//!   back by coalescing, and indexed by a segregated-fit free list with a
//!   bitmap-accelerated best-fit search. Truly huge requests bypass even
//!   that and get partitions of their own.
//! - Both paths draw fixed-size page clusters from a **partition space**: a
//!   reserved, partition-aligned arena whose slots carry a one-byte tag, so
//!   any pointer is routed back to its owner with a bounds check and one
//!   table read.
//!
//! # Quick start
//!
//! ```
//! let heap = vam::Vam::with_partitions(32).unwrap();
//! let p = heap.allocate(24);
//! assert!(!p.is_null());
//! unsafe {
//!     assert!(heap.size_of(p) >= 24);
//!     heap.deallocate(p);
//! }
//! ```
//!
//! A lazily-initialized process-wide instance is available through
//! [`global`].

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]

use std::io;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

mod cluster;
mod frequency;
mod header;
mod list;
mod locked;
#[cfg_attr(not(feature = "object-cache"), allow(dead_code))]
mod object_cache;
mod one_size;
mod partition;
mod reap;
mod seg_fit;
mod seg_size;
mod size_class;
mod split_coalesce;
mod stats;
mod two_heap;

pub use frequency::{high_freq_reached, FrequencyPredicate};
pub use size_class::{
    DEFAULT_PARTITIONS, MAX_DEDICATED_SIZE, MAX_PAGE_ORDER, OBJECT_QUANTUM, PAGE_SIZE,
    PARTITION_SIZE,
};
pub use stats::SourceStats;

use frequency::FrequencyClassifier;
use locked::Locked;
use partition::{PageSource, LOW_FREQ_TAG};
use seg_size::SegSizeHeap;
use two_heap::TwoHeap;

#[cfg(feature = "tracing")]
macro_rules! trace_event {
    ($($arg:tt)*) => { tracing::debug!($($arg)*) };
}
#[cfg(not(feature = "tracing"))]
macro_rules! trace_event {
    ($($arg:tt)*) => {};
}
pub(crate) use trace_event;

/// The composed allocator.
///
/// Thread safety comes from three internal locks (high-frequency path,
/// low-frequency path, partition space); the classifier itself is lock-free,
/// so a small-object and a large-object allocation can proceed in parallel.
pub struct Vam {
    classifier: FrequencyClassifier,
    high: Locked<SegSizeHeap>,
    low: Locked<TwoHeap>,
    source: PageSource,
}

impl Vam {
    /// Creates an allocator with the default address-space arena
    /// ([`DEFAULT_PARTITIONS`] slots).
    ///
    /// # Errors
    ///
    /// Fails if the OS refuses the address-space reservation.
    pub fn new() -> io::Result<Self> {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Creates an allocator whose arena holds `num_partitions` slots of
    /// [`PARTITION_SIZE`] bytes. The arena bounds both the total live bytes
    /// and the largest single allocation.
    ///
    /// # Errors
    ///
    /// Fails if the OS refuses the address-space reservation.
    pub fn with_partitions(num_partitions: usize) -> io::Result<Self> {
        Self::with_predicate(num_partitions, high_freq_reached)
    }

    /// Creates an allocator with a custom promotion predicate deciding when
    /// a size class moves to the high-frequency path.
    ///
    /// # Errors
    ///
    /// Fails if the OS refuses the address-space reservation.
    pub fn with_predicate(
        num_partitions: usize,
        predicate: FrequencyPredicate,
    ) -> io::Result<Self> {
        Ok(Self {
            classifier: FrequencyClassifier::new(predicate),
            high: Locked::new(SegSizeHeap::new()),
            low: Locked::new(TwoHeap::new()),
            source: PageSource::new(num_partitions)?,
        })
    }

    /// Allocates at least `size` bytes aligned to [`OBJECT_QUANTUM`].
    ///
    /// Zero-size requests are served as minimum-size ones. Returns null when
    /// memory is exhausted.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        let Some(size) = size
            .max(1)
            .checked_add(OBJECT_QUANTUM - 1)
            .map(|s| s & !(OBJECT_QUANTUM - 1))
        else {
            return ptr::null_mut();
        };

        let mut allocated = None;
        if self.classifier.classify(size) {
            allocated = self.high.lock().allocate(size, &self.source);
            debug_assert!(allocated.is_none_or(|p| {
                self.source.tag_of(p.as_ptr()) != Some(LOW_FREQ_TAG)
            }));
        }
        // Cold sizes, and hot ones the high path could not serve.
        if allocated.is_none() {
            allocated = self.low.lock().allocate(size, &self.source);
            debug_assert!(allocated.is_none_or(|p| {
                self.source.tag_of(p.as_ptr()) == Some(LOW_FREQ_TAG)
            }));
        }
        allocated.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Frees a block returned by [`allocate`](Self::allocate). Null is a
    /// no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by this
    /// allocator's `allocate` (not an interior pointer), not freed since.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        match self.source.tag_of(ptr.as_ptr()) {
            Some(LOW_FREQ_TAG) => unsafe { self.low.lock().release(ptr, &self.source) },
            Some(tag) => unsafe { self.high.lock().release(ptr, tag, &self.source) },
            None => debug_assert!(false, "freeing a pointer the allocator does not own"),
        }
    }

    /// Usable size of a live block, at least what was requested.
    ///
    /// # Safety
    ///
    /// `ptr` must be a pointer previously returned by this allocator's
    /// `allocate`, not freed since.
    pub unsafe fn size_of(&self, ptr: *mut u8) -> usize {
        let Some(ptr) = NonNull::new(ptr) else {
            return 0;
        };
        match self.source.tag_of(ptr.as_ptr()) {
            Some(LOW_FREQ_TAG) => {
                let _guard = self.low.lock();
                unsafe { TwoHeap::size_of(ptr) }
            }
            Some(tag) => {
                let _guard = self.high.lock();
                unsafe { SegSizeHeap::size_of(ptr, tag) }
            }
            None => {
                debug_assert!(false, "sizing a pointer the allocator does not own");
                0
            }
        }
    }

    /// Snapshot of the page-source counters (commits, uncommits, discards,
    /// partition claims).
    #[must_use]
    pub fn source_stats(&self) -> SourceStats {
        self.source.stats()
    }

    /// Whether `ptr` was served by the high-frequency path. Diagnostic; used
    /// to observe frequency promotion from the outside.
    #[must_use]
    pub fn is_high_frequency(&self, ptr: *mut u8) -> bool {
        matches!(self.source.tag_of(ptr), Some(tag) if tag != LOW_FREQ_TAG)
    }
}

// SAFETY: every interior raw pointer is reachable only through one of the
// three locks, and the memory they reference is owned by the arena held in
// `source`.
unsafe impl Send for Vam {}
unsafe impl Sync for Vam {}

/// The process-wide allocator, reserved on first use.
///
/// # Panics
///
/// Panics if the initial address-space reservation fails.
pub fn global() -> &'static Vam {
    static GLOBAL: OnceLock<Vam> = OnceLock::new();
    GLOBAL.get_or_init(|| Vam::new().expect("failed to reserve allocator address space"))
}
