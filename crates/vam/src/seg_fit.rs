//! Segregated-fit index of boundary-tagged free blocks.
//!
//! Size classes up to `2 × MAX_DEDICATED_SIZE` get one free list each,
//! tracked by a per-class counter and a packed occupancy bitmap so best-fit
//! is a bit scan. Larger blocks live on a single unsorted list served
//! first-fit. Free blocks store their list node in the payload itself.

use std::ptr::NonNull;

use crate::header::BlockHeader;
use crate::list::{ListNode, RawList};
use crate::size_class::{index_to_size, size_to_index, MAX_DEDICATED_SIZE, WORD_BITS};

/// Number of size classes with a dedicated free list.
pub const NUM_DEDICATED: usize = size_to_index(2 * MAX_DEDICATED_SIZE) + 1;
const BITMAP_WORDS: usize = NUM_DEDICATED / WORD_BITS;

const _: () = assert!(NUM_DEDICATED % WORD_BITS == 0);
const _: () = assert!(NUM_DEDICATED.is_power_of_two());

/// Free-block index with bitmap-accelerated best-fit.
pub struct SegFitHeap {
    dedicated: [RawList; NUM_DEDICATED],
    counters: [usize; NUM_DEDICATED],
    bitmap: [usize; BITMAP_WORDS],
    large: RawList,
}

impl SegFitHeap {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dedicated: std::array::from_fn(|_| RawList::new()),
            counters: [0; NUM_DEDICATED],
            bitmap: [0; BITMAP_WORDS],
            large: RawList::new(),
        }
    }

    /// Takes a free block of at least `size` bytes: best-fit within the
    /// dedicated classes, else first-fit on the large list. Returns the
    /// block's payload pointer.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.sanity_check();
        let index = size_to_index(size);
        let mut taken = None;

        if index < NUM_DEDICATED {
            if self.counters[index] > 0 {
                taken = Some(index);
            } else {
                taken = self.next_occupied(index + 1);
            }
        }

        if let Some(class) = taken {
            self.counters[class] -= 1;
            if self.counters[class] == 0 {
                self.bitmap[class / WORD_BITS] &= !(1 << (class % WORD_BITS));
            }
            let node = self.dedicated[class]
                .first()
                .expect("occupied size class with empty list");
            unsafe { self.dedicated[class].remove(node) };
            self.sanity_check();
            return Some(node.cast::<u8>());
        }

        // First fit among the large blocks.
        let mut cursor = self.large.first();
        while let Some(node) = cursor {
            let header = unsafe { BlockHeader::for_payload(node.as_ptr().cast::<u8>()) };
            if unsafe { (*header).size() } >= size {
                unsafe { self.large.remove(node) };
                self.sanity_check();
                return Some(node.cast::<u8>());
            }
            cursor = unsafe { node.as_ref().next() };
        }

        self.sanity_check();
        None
    }

    /// Finds the lowest occupied class at or above `from`.
    fn next_occupied(&self, from: usize) -> Option<usize> {
        if from >= NUM_DEDICATED {
            return None;
        }
        let word_index = from / WORD_BITS;
        let masked = self.bitmap[word_index] & (!0 << (from % WORD_BITS));
        if masked != 0 {
            return Some(word_index * WORD_BITS + masked.trailing_zeros() as usize);
        }
        for w in word_index + 1..BITMAP_WORDS {
            if self.bitmap[w] != 0 {
                return Some(w * WORD_BITS + self.bitmap[w].trailing_zeros() as usize);
            }
        }
        None
    }

    /// Files a free block (given by payload pointer) under its size class.
    ///
    /// # Safety
    ///
    /// `ptr` must be the payload of a block whose header chain is intact and
    /// whose free bit is set; the payload must be writable and at least a
    /// list node large.
    pub unsafe fn insert(&mut self, ptr: NonNull<u8>) {
        self.sanity_check();
        let header = unsafe { BlockHeader::for_payload(ptr.as_ptr()) };
        unsafe {
            debug_assert!(BlockHeader::is_free(header));
            debug_assert_eq!(BlockHeader::next(BlockHeader::prev(header)), header);
            debug_assert_eq!(BlockHeader::prev(BlockHeader::next(header)), header);
        }

        let index = size_to_index(unsafe { (*header).size() });
        let node = ptr.cast::<ListNode>();
        if index < NUM_DEDICATED {
            if self.counters[index] == 0 {
                debug_assert!(self.dedicated[index].is_empty());
                debug_assert_eq!(self.bitmap[index / WORD_BITS] & (1 << (index % WORD_BITS)), 0);
                self.bitmap[index / WORD_BITS] |= 1 << (index % WORD_BITS);
            }
            self.counters[index] += 1;
            unsafe { self.dedicated[index].push_front(node) };
        } else {
            unsafe { self.large.push_front(node) };
        }
        self.sanity_check();
    }

    /// Unlinks a specific free block, the coalescing path's O(1) removal.
    ///
    /// # Safety
    ///
    /// `ptr` must be the payload of a block currently filed in this index.
    pub unsafe fn remove(&mut self, ptr: NonNull<u8>) {
        let header = unsafe { BlockHeader::for_payload(ptr.as_ptr()) };
        let index = size_to_index(unsafe { (*header).size() });
        let node = ptr.cast::<ListNode>();
        if index < NUM_DEDICATED {
            self.counters[index] -= 1;
            if self.counters[index] == 0 {
                debug_assert!(self.dedicated[index].is_sole(node));
                debug_assert!(self.bitmap[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0);
                self.bitmap[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
            }
            unsafe { self.dedicated[index].remove(node) };
        } else {
            unsafe { self.large.remove(node) };
        }
        self.sanity_check();
    }

    #[cfg(debug_assertions)]
    fn sanity_check(&self) {
        for index in 0..NUM_DEDICATED {
            let bit = self.bitmap[index / WORD_BITS] & (1 << (index % WORD_BITS));
            if self.dedicated[index].is_empty() {
                debug_assert_eq!(self.counters[index], 0);
                debug_assert_eq!(bit, 0);
                continue;
            }
            debug_assert!(bit != 0);
            let mut count = 0;
            for node in unsafe { self.dedicated[index].iter() } {
                let header = unsafe { BlockHeader::for_payload(node.as_ptr().cast::<u8>()) };
                unsafe {
                    debug_assert_eq!((*header).size(), (*BlockHeader::next(header)).prev_size());
                    debug_assert_eq!((*header).prev_size(), (*BlockHeader::prev(header)).size());
                    debug_assert!(BlockHeader::is_free(header));
                    debug_assert!(!BlockHeader::is_free(BlockHeader::prev(header)));
                    debug_assert!(!BlockHeader::is_free(BlockHeader::next(header)));
                    debug_assert_eq!((*header).size(), index_to_size(index));
                }
                count += 1;
            }
            debug_assert_eq!(self.counters[index], count);
        }

        for node in unsafe { self.large.iter() } {
            let header = unsafe { BlockHeader::for_payload(node.as_ptr().cast::<u8>()) };
            unsafe {
                debug_assert_eq!((*header).size(), (*BlockHeader::next(header)).prev_size());
                debug_assert_eq!((*header).prev_size(), (*BlockHeader::prev(header)).size());
                debug_assert!(BlockHeader::is_free(header));
                debug_assert!((*header).size() > 2 * MAX_DEDICATED_SIZE);
            }
        }
    }

    #[cfg(not(debug_assertions))]
    fn sanity_check(&self) {}
}

impl Default for SegFitHeap {
    fn default() -> Self {
        Self::new()
    }
}
