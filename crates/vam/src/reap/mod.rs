//! Fixed-object-size bump/recycle subheaps ("reaps").
//!
//! A reap serves one object size out of one page cluster and lives at the
//! start of the memory it manages. Never-touched slots are handed out by
//! bumping a pointer; once the bump region is exhausted, freed slots are
//! recycled through a per-variant structure (bitmap, bitmap with an offset
//! cache, bytemap, or an intrusive free list). Every variant starts with a
//! [`ReapBase`], so the owning heaps can read the object size from a bare
//! cluster address.

use std::ptr::NonNull;

use crate::list::ListNode;

// Only the configured workhorse is reachable outside of tests; the other
// variants stay compiled so the feature switches are always buildable.
#[allow(dead_code)]
pub mod bitmap;
#[allow(dead_code)]
pub mod bitmap_cache;
#[allow(dead_code)]
pub mod bytemap;
#[allow(dead_code)]
pub mod free_list;

pub use bitmap::BitmapReap;
pub use bitmap_cache::BitmapCacheReap;
pub use bytemap::BytemapReap;
pub use free_list::FreelistReap;

/// The reap variant serving the high-frequency path.
#[cfg(feature = "workhorse-bitmap")]
pub type Workhorse = BitmapReap;
/// The reap variant serving the high-frequency path.
#[cfg(all(not(feature = "workhorse-bitmap"), feature = "workhorse-bytemap"))]
pub type Workhorse = BytemapReap;
/// The reap variant serving the high-frequency path.
#[cfg(all(
    not(feature = "workhorse-bitmap"),
    not(feature = "workhorse-bytemap"),
    feature = "workhorse-freelist"
))]
pub type Workhorse = FreelistReap;
/// The reap variant serving the high-frequency path.
#[cfg(all(
    not(feature = "workhorse-bitmap"),
    not(feature = "workhorse-bytemap"),
    not(feature = "workhorse-freelist")
))]
pub type Workhorse = BitmapCacheReap;

/// Bump-allocation state shared by every reap variant.
///
/// `#[repr(C)]` and first-field placement are load-bearing: the free path
/// recovers a reap from a cluster address and reads the object size through
/// this prefix without knowing the variant.
#[repr(C)]
pub struct ReapBase {
    object_size: usize,
    num_total: usize,
    num_free: usize,
    base_ptr: *mut u8,
    num_bumped: usize,
    bump_ptr: *mut u8,
}

impl ReapBase {
    pub(crate) fn new(object_size: usize, num_total: usize, base_ptr: *mut u8) -> Self {
        Self {
            object_size,
            num_total,
            num_free: num_total,
            base_ptr,
            num_bumped: 0,
            bump_ptr: base_ptr,
        }
    }

    /// Hands out the next never-touched slot, if any.
    pub(crate) fn bump(&mut self) -> Option<NonNull<u8>> {
        if self.num_bumped < self.num_total {
            let ptr = self.bump_ptr;
            self.bump_ptr = unsafe { self.bump_ptr.add(self.object_size) };
            self.num_bumped += 1;
            self.num_free -= 1;
            NonNull::new(ptr)
        } else {
            None
        }
    }

    pub(crate) fn object_size(&self) -> usize {
        self.object_size
    }

    pub(crate) fn num_total(&self) -> usize {
        self.num_total
    }

    pub(crate) fn num_free(&self) -> usize {
        self.num_free
    }

    /// Slot index of `ptr`, asserting it is slot-aligned.
    pub(crate) fn slot_of(&self, ptr: NonNull<u8>) -> usize {
        let offset = ptr.as_ptr() as usize - self.base_ptr as usize;
        debug_assert_eq!(offset % self.object_size, 0);
        let slot = offset / self.object_size;
        debug_assert!(slot < self.num_total);
        slot
    }

    pub(crate) fn slot_ptr(&self, slot: usize) -> NonNull<u8> {
        debug_assert!(slot < self.num_total);
        unsafe { NonNull::new_unchecked(self.base_ptr.add(slot * self.object_size)) }
    }
}

/// A fixed-object-size subheap constructed in place on a page cluster.
pub trait Reap {
    /// Builds a reap at the start of `cluster`, reserving space for itself
    /// and its recycling structure before the first object slot.
    ///
    /// # Safety
    ///
    /// `cluster` must point at `size` bytes of exclusively owned, writable,
    /// quantum-aligned memory, large enough for the reap overhead plus at
    /// least one object of `object_size` bytes.
    unsafe fn init(cluster: NonNull<u8>, size: usize, object_size: usize) -> NonNull<Self>
    where
        Self: Sized;

    /// Hands out a slot, or `None` when the reap is full.
    fn allocate(&mut self) -> Option<NonNull<u8>>;

    /// Recycles a slot.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this reap's `allocate` and must not
    /// already be free.
    unsafe fn release(&mut self, ptr: NonNull<u8>);

    /// The fixed object size served by this reap.
    fn object_size(&self) -> usize;

    /// Total object slots in the reap.
    fn num_total(&self) -> usize;

    /// Currently free slots (bump reserve plus recycled).
    fn num_free(&self) -> usize;

    /// The link used by the owning one-size heap.
    fn link(&mut self) -> NonNull<ListNode>;

    /// Recovers the reap from its link.
    ///
    /// # Safety
    ///
    /// `node` must have been obtained from [`link`](Self::link) of a live
    /// reap of this exact variant.
    unsafe fn from_link(node: NonNull<ListNode>) -> NonNull<Self>
    where
        Self: Sized;
}

/// Reads the object size of whatever reap variant occupies `cluster`.
///
/// # Safety
///
/// `cluster` must be the base address of a live reap.
pub(crate) unsafe fn object_size_at(cluster: NonNull<u8>) -> usize {
    unsafe { cluster.cast::<ReapBase>().as_ref().object_size }
}
