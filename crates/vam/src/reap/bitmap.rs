//! A reap that recycles freed slots through a bitmap (1 = free).

use std::mem;
use std::ptr::NonNull;

use crate::list::{container_of, ListNode};
use crate::reap::{Reap, ReapBase};
use crate::size_class::{align_up, OBJECT_QUANTUM, WORD_BITS};

/// Bitmap-recycling reap.
///
/// `lowest_bit` is a monotone hint: no slot below it is free, so the
/// allocation scan can start at its word.
#[repr(C)]
pub struct BitmapReap {
    base: ReapBase,
    bitmap: *mut usize,
    lowest_bit: usize,
    link: ListNode,
}

impl BitmapReap {
    fn set_bit(&mut self, slot: usize) {
        let word = unsafe { &mut *self.bitmap.add(slot / WORD_BITS) };
        debug_assert_eq!(*word & (1 << (slot % WORD_BITS)), 0, "slot already free");
        *word |= 1 << (slot % WORD_BITS);
    }
}

impl Reap for BitmapReap {
    unsafe fn init(cluster: NonNull<u8>, size: usize, object_size: usize) -> NonNull<Self> {
        let header = cluster.cast::<Self>();
        let max_objects = (size - mem::size_of::<Self>()) / object_size;
        let bitmap_words = max_objects.div_ceil(WORD_BITS);

        // The bitmap sits right after the reap itself, objects after that.
        let bitmap = unsafe { cluster.add(mem::size_of::<Self>()).cast::<usize>() };
        unsafe { bitmap.write_bytes(0, bitmap_words) };
        let base_offset = align_up(
            mem::size_of::<Self>() + bitmap_words * mem::size_of::<usize>(),
            OBJECT_QUANTUM,
        );
        let base_ptr = unsafe { cluster.as_ptr().add(base_offset) };

        let num_total = (size - base_offset) / object_size;
        debug_assert!(num_total > 0);
        unsafe {
            header.write(Self {
                base: ReapBase::new(object_size, num_total, base_ptr),
                bitmap: bitmap.as_ptr(),
                lowest_bit: num_total,
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

        // Find the first non-zero bitmap word at or above the hint, then the
        // lowest set bit within it.
        unsafe {
            let mut word_index = self.lowest_bit / WORD_BITS;
            while *self.bitmap.add(word_index) == 0 {
                word_index += 1;
            }
            let word = self.bitmap.add(word_index);
            let bit = (*word).trailing_zeros() as usize;
            let slot = word_index * WORD_BITS + bit;
            debug_assert!(slot < self.base.num_total());
            *word &= !(1 << bit);
            self.lowest_bit = slot + 1;
            self.base.num_free -= 1;
            Some(self.base.slot_ptr(slot))
        }
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        debug_assert!(self.base.num_free() < self.base.num_total());
        let slot = self.base.slot_of(ptr);
        self.set_bit(slot);
        self.base.num_free += 1;
        if slot < self.lowest_bit {
            self.lowest_bit = slot;
        }
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
