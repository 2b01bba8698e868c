//! Boundary-tag splitting and coalescing over the segregated-fit index.
//!
//! Blocks come from superchunks: whole partitions obtained from the page
//! source and framed by sentinel headers so coalescing can never run off
//! either end. Allocation takes a free block from the index (or opens a
//! fresh superchunk), then splits off any usable remainder; freeing merges
//! with free neighbors before refiling the block.

use std::ptr::NonNull;

use crate::header::BlockHeader;
use crate::list::ListNode;
use crate::partition::{PageSource, LOW_FREQ_TAG};
use crate::seg_fit::SegFitHeap;
use crate::size_class::PARTITION_SIZE;

/// Size of the span requested from the page source for each superchunk.
pub const SUPER_CHUNK_SIZE: usize = PARTITION_SIZE;

/// Largest block servable by this layer: a superchunk minus its four
/// sentinel headers.
pub const MAX_OBJECT_SIZE: usize = SUPER_CHUNK_SIZE - 4 * BlockHeader::SIZE;

/// Smallest block this layer will carve: a freed block's payload must hold
/// an intrusive list node.
pub(crate) const MIN_BLOCK_SIZE: usize = std::mem::size_of::<ListNode>();

/// Split/coalesce heap; owns the free-block index.
pub struct SplitCoalesceHeap {
    index: SegFitHeap,
}

impl SplitCoalesceHeap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            index: SegFitHeap::new(),
        }
    }

    /// Allocates `size` bytes (`size ≤ MAX_OBJECT_SIZE`), splitting the
    /// chosen block when the remainder is worth keeping.
    pub fn allocate(&mut self, size: usize, source: &PageSource) -> Option<NonNull<u8>> {
        debug_assert!(size <= MAX_OBJECT_SIZE);
        let size = size.max(MIN_BLOCK_SIZE);

        let payload = match self.index.allocate(size) {
            Some(payload) => payload,
            None => self.fresh_superchunk(source)?,
        };

        unsafe {
            let header = BlockHeader::for_payload(payload.as_ptr());
            debug_assert!(BlockHeader::is_free(header));
            BlockHeader::set_free(header, false);

            if let Some(rest) = Self::split(header, size) {
                debug_assert!(BlockHeader::is_free(rest));
                self.index
                    .insert(NonNull::new_unchecked(BlockHeader::payload(rest)));
                debug_assert_eq!(BlockHeader::prev(rest), header);
                debug_assert_eq!(BlockHeader::next(header), rest);
            }
            debug_assert_eq!(BlockHeader::prev(BlockHeader::next(header)), header);
            debug_assert!(!BlockHeader::is_free(header));
            debug_assert!((*header).size() >= size);
        }
        Some(payload)
    }

    /// Opens a fresh superchunk and returns its one giant free block.
    ///
    /// Four headers frame the chunk: an empty head, the giant object's own
    /// header, a tail carrying the giant object's boundary tag, and a guard
    /// whose free bit stays clear so nothing coalesces past the end.
    fn fresh_superchunk(&mut self, source: &PageSource) -> Option<NonNull<u8>> {
        let chunk = source.allocate(SUPER_CHUNK_SIZE, LOW_FREQ_TAG)?;
        unsafe {
            let head = chunk.cast::<BlockHeader>().as_ptr();
            (*head).set_size(0);
            (*head).set_prev_size(0);
            (*head).set_prev_free(false);

            let object = head.add(1);
            (*object).set_size(MAX_OBJECT_SIZE);
            (*object).set_prev_size(0);
            (*object).set_prev_free(false);
            debug_assert_eq!(BlockHeader::next(head), object);

            let tail = BlockHeader::next(object);
            (*tail).set_size(0);
            (*tail).set_prev_size(MAX_OBJECT_SIZE);
            (*tail).set_prev_free(true);
            BlockHeader::set_free(tail, false);

            Some(NonNull::new_unchecked(BlockHeader::payload(object)))
        }
    }

    /// Splits `header` down to `requested` bytes if the leftover can hold a
    /// header plus a minimum block; returns the remainder's header.
    unsafe fn split(header: *mut BlockHeader, requested: usize) -> Option<*mut BlockHeader> {
        unsafe {
            let actual = (*header).size();
            debug_assert!(actual >= requested);
            debug_assert!(!BlockHeader::is_free(header));
            let remaining = actual - requested;
            if remaining < BlockHeader::SIZE + MIN_BLOCK_SIZE {
                return None;
            }

            (*header).set_size(requested);
            let rest = BlockHeader::next(header);
            (*rest).set_size(remaining - BlockHeader::SIZE);
            (*rest).set_prev_size(requested);
            (*rest).set_prev_free(false);

            let next = BlockHeader::next(rest);
            debug_assert_eq!((*next).prev_size(), actual);
            (*next).set_prev_size(remaining - BlockHeader::SIZE);
            (*next).set_prev_free(true);

            Some(rest)
        }
    }

    /// Frees a block, coalescing with whichever neighbors are free.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// heap and must not already be free.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        unsafe {
            let mut header = BlockHeader::for_payload(ptr.as_ptr());
            debug_assert!(!BlockHeader::is_free(header), "double free");
            debug_assert_eq!(BlockHeader::next(BlockHeader::prev(header)), header);
            debug_assert_eq!(BlockHeader::prev(BlockHeader::next(header)), header);

            BlockHeader::set_free(header, true);

            if (*header).prev_free() {
                let prev = BlockHeader::prev(header);
                self.index
                    .remove(NonNull::new_unchecked(BlockHeader::payload(prev)));
                Self::coalesce(prev, header);
                header = prev;
            }

            let next = BlockHeader::next(header);
            if BlockHeader::is_free(next) {
                self.index
                    .remove(NonNull::new_unchecked(BlockHeader::payload(next)));
                Self::coalesce(header, next);
            }

            self.index
                .insert(NonNull::new_unchecked(BlockHeader::payload(header)));
        }
    }

    /// Merges two adjacent free blocks into `first`.
    unsafe fn coalesce(first: *mut BlockHeader, second: *mut BlockHeader) {
        unsafe {
            debug_assert_eq!(BlockHeader::next(first), second);
            debug_assert_eq!(BlockHeader::prev(second), first);
            debug_assert!(BlockHeader::is_free(first) && BlockHeader::is_free(second));

            let new_size = second as usize - first as usize + (*second).size();
            (*first).set_size(new_size);
            (*BlockHeader::next(first)).set_prev_size(new_size);
            debug_assert_eq!(BlockHeader::prev(BlockHeader::next(first)), first);
        }
    }

    /// Usable size of a live block.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of this heap.
    pub unsafe fn size_of(ptr: NonNull<u8>) -> usize {
        unsafe { (*BlockHeader::for_payload(ptr.as_ptr())).size() }
    }
}

impl Default for SplitCoalesceHeap {
    fn default() -> Self {
        Self::new()
    }
}
