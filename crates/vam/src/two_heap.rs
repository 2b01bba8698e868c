//! Size routing between the split/coalesce heap and dedicated huge spans.
//!
//! Requests up to [`MAX_OBJECT_SIZE`] go through the split/coalesce layer.
//! Anything larger gets its own page-source span, sized so it always
//! occupies whole partitions of its own, with a single header recording the
//! size; the header also lets the free path tell the two cases apart.

use std::ptr::NonNull;

use crate::header::BlockHeader;
use crate::partition::{PageSource, LOW_FREQ_TAG};
use crate::size_class::{PAGE_SIZE, PARTITION_SIZE};
use crate::split_coalesce::{SplitCoalesceHeap, MAX_OBJECT_SIZE};

/// The low-frequency path: split/coalesce for regular sizes, raw spans for
/// huge ones.
pub struct TwoHeap {
    regular: SplitCoalesceHeap,
}

impl TwoHeap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            regular: SplitCoalesceHeap::new(),
        }
    }

    /// Allocates `size` bytes from whichever side fits.
    pub fn allocate(&mut self, size: usize, source: &PageSource) -> Option<NonNull<u8>> {
        if size <= MAX_OBJECT_SIZE {
            return self.regular.allocate(size, source);
        }

        // The span must exceed a partition so the huge object is routed by
        // its own partition tag, and must be page-granular for the source.
        let with_header = size.checked_add(BlockHeader::SIZE)?;
        let huge_size = if with_header <= PARTITION_SIZE {
            PARTITION_SIZE + PAGE_SIZE
        } else {
            with_header.checked_next_multiple_of(PAGE_SIZE)?
        };

        let base = source.allocate(huge_size, LOW_FREQ_TAG)?;
        unsafe {
            let header = base.cast::<BlockHeader>().as_ptr();
            (*header).set_size(size);
            Some(NonNull::new_unchecked(BlockHeader::payload(header)))
        }
    }

    /// Frees a block allocated by [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap and not freed since.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>, source: &PageSource) {
        unsafe {
            let header = BlockHeader::for_payload(ptr.as_ptr());
            if (*header).size() <= MAX_OBJECT_SIZE {
                self.regular.release(ptr);
            } else {
                source.release(NonNull::new_unchecked(header.cast::<u8>()));
            }
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

impl Default for TwoHeap {
    fn default() -> Self {
        Self::new()
    }
}
