//! A bitmap reap with a small cache of free-slot offsets.
//!
//! Frees push byte offsets onto a stack; only when the stack fills is it
//! drained into the bitmap. Allocation pops the stack and refills it by
//! consuming one whole bitmap word at a time, so bitmap traffic happens in
//! word-sized batches instead of per object.

use std::mem;
use std::ptr::NonNull;

use crate::list::{container_of, ListNode};
use crate::reap::{Reap, ReapBase};
use crate::size_class::{align_up, OBJECT_QUANTUM, WORD_BITS};

/// Capacity of the offset cache, matched to one bitmap word.
pub const CACHE_SIZE: usize = WORD_BITS;

/// Bitmap-recycling reap with an offset cache.
#[repr(C)]
pub struct BitmapCacheReap {
    base: ReapBase,
    bitmap: *mut usize,
    lowest_bit: usize,
    num_cached: usize,
    // Byte offsets fit u16 because high-frequency clusters top out at 64 KiB.
    cached_offsets: [u16; CACHE_SIZE],
    link: ListNode,
}

impl BitmapCacheReap {
    /// Moves every cached offset into the bitmap.
    fn drain_cache(&mut self) {
        for i in 0..self.num_cached {
            let offset = self.cached_offsets[i] as usize;
            debug_assert_eq!(offset % self.base.object_size(), 0);
            let slot = offset / self.base.object_size();
            debug_assert!(slot < self.base.num_total());
            let word = unsafe { &mut *self.bitmap.add(slot / WORD_BITS) };
            debug_assert_eq!(*word & (1 << (slot % WORD_BITS)), 0, "slot already free");
            *word |= 1 << (slot % WORD_BITS);
            if slot < self.lowest_bit {
                self.lowest_bit = slot;
            }
        }
        self.num_cached = 0;
    }

    /// Consumes the first non-zero bitmap word into the cache.
    fn refill_cache(&mut self) {
        debug_assert_eq!(self.num_cached, 0);
        unsafe {
            let mut word_index = self.lowest_bit / WORD_BITS;
            while *self.bitmap.add(word_index) == 0 {
                word_index += 1;
            }
            let mut word = *self.bitmap.add(word_index);
            self.lowest_bit = (word_index + 1) * WORD_BITS;

            // Push the highest offsets first so pops deliver the low slots.
            while word != 0 {
                let bit = WORD_BITS - 1 - word.leading_zeros() as usize;
                let slot = word_index * WORD_BITS + bit;
                debug_assert!(slot < self.base.num_total());
                debug_assert!(self.num_cached < CACHE_SIZE);
                self.cached_offsets[self.num_cached] = (slot * self.base.object_size()) as u16;
                self.num_cached += 1;
                word &= !(1 << bit);
            }
            *self.bitmap.add(word_index) = 0;
        }
        debug_assert!(self.num_cached > 0);
        debug_assert!(self.num_cached <= self.base.num_free());
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.num_cached
    }
}

impl Reap for BitmapCacheReap {
    unsafe fn init(cluster: NonNull<u8>, size: usize, object_size: usize) -> NonNull<Self> {
        let header = cluster.cast::<Self>();
        let max_objects = (size - mem::size_of::<Self>()) / object_size;
        let bitmap_words = max_objects.div_ceil(WORD_BITS);

        let bitmap = unsafe { cluster.add(mem::size_of::<Self>()).cast::<usize>() };
        unsafe { bitmap.write_bytes(0, bitmap_words) };
        let base_offset = align_up(
            mem::size_of::<Self>() + bitmap_words * mem::size_of::<usize>(),
            OBJECT_QUANTUM,
        );
        let base_ptr = unsafe { cluster.as_ptr().add(base_offset) };

        let num_total = (size - base_offset) / object_size;
        debug_assert!(num_total > 0);
        debug_assert!(size <= usize::from(u16::MAX) + 1, "offsets must fit u16");
        unsafe {
            header.write(Self {
                base: ReapBase::new(object_size, num_total, base_ptr),
                bitmap: bitmap.as_ptr(),
                lowest_bit: num_total,
                num_cached: 0,
                cached_offsets: [0; CACHE_SIZE],
                link: ListNode::new(),
            });
        }
        header
    }

    fn allocate(&mut self) -> Option<NonNull<u8>> {
        if let Some(ptr) = self.base.bump() {
            return Some(ptr);
        }
        if self.base.num_free() == 0 {
            return None;
        }
        if self.num_cached == 0 {
            self.refill_cache();
        }
        self.num_cached -= 1;
        let offset = self.cached_offsets[self.num_cached] as usize;
        self.base.num_free -= 1;
        Some(self.base.slot_ptr(offset / self.base.object_size()))
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        debug_assert!(self.base.num_free() < self.base.num_total());
        debug_assert!(self.num_cached < CACHE_SIZE);
        let offset = ptr.as_ptr() as usize - self.base.slot_ptr(0).as_ptr() as usize;
        debug_assert_eq!(offset % self.base.object_size(), 0);
        self.cached_offsets[self.num_cached] = offset as u16;
        self.num_cached += 1;
        if self.num_cached == CACHE_SIZE {
            self.drain_cache();
        }
        self.base.num_free += 1;
    }

    fn object_size(&self) -> usize {
        self.base.object_size()
    }

    fn num_total(&self) -> usize {
        self.base.num_total()
    }

    fn num_free(&self) -> usize {
        self.base.num_free()
    }

    fn link(&mut self) -> NonNull<ListNode> {
        NonNull::from(&mut self.link)
    }

    unsafe fn from_link(node: NonNull<ListNode>) -> NonNull<Self> {
        unsafe { container_of(node, mem::offset_of!(Self, link)) }
    }
}
