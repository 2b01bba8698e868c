//! A reap that recycles freed slots through a bytemap (1 = free).

use std::mem;
use std::ptr::NonNull;

use crate::list::{container_of, ListNode};
use crate::reap::{Reap, ReapBase};
use crate::size_class::{align_up, OBJECT_QUANTUM};

/// Bytemap-recycling reap. One byte per slot; allocation is a linear scan
/// from the `lowest_byte` hint.
#[repr(C)]
pub struct BytemapReap {
    base: ReapBase,
    bytemap: *mut u8,
    lowest_byte: usize,
    link: ListNode,
}

impl Reap for BytemapReap {
    unsafe fn init(cluster: NonNull<u8>, size: usize, object_size: usize) -> NonNull<Self> {
        let header = cluster.cast::<Self>();
        let max_objects = (size - mem::size_of::<Self>()) / object_size;

        let bytemap = unsafe { cluster.add(mem::size_of::<Self>()) };
        unsafe { bytemap.write_bytes(0, max_objects) };
        let base_offset = align_up(mem::size_of::<Self>() + max_objects, OBJECT_QUANTUM);
        let base_ptr = unsafe { cluster.as_ptr().add(base_offset) };

        let num_total = (size - base_offset) / object_size;
        debug_assert!(num_total > 0);
        unsafe {
            header.write(Self {
                base: ReapBase::new(object_size, num_total, base_ptr),
                bytemap: bytemap.as_ptr(),
                lowest_byte: num_total,
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
        unsafe {
            let mut slot = self.lowest_byte;
            while *self.bytemap.add(slot) == 0 {
                slot += 1;
            }
            debug_assert!(slot < self.base.num_total());
            debug_assert_eq!(*self.bytemap.add(slot), 1);
            *self.bytemap.add(slot) = 0;
            self.lowest_byte = slot + 1;
            self.base.num_free -= 1;
            Some(self.base.slot_ptr(slot))
        }
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        debug_assert!(self.base.num_free() < self.base.num_total());
        let slot = self.base.slot_of(ptr);
        unsafe {
            debug_assert_eq!(*self.bytemap.add(slot), 0, "slot already free");
            *self.bytemap.add(slot) = 1;
        }
        self.base.num_free += 1;
        if slot < self.lowest_byte {
            self.lowest_byte = slot;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reap::tests::{exercise_reap, exercise_reap_across_words, scratch, scratch_ptr};

    #[test]
    fn bump_then_recycle() {
        exercise_reap::<BytemapReap>();
    }

    #[test]
    fn recycles_across_map_words() {
        exercise_reap_across_words::<BytemapReap>();
    }

    #[test]
    fn lowest_slot_is_recycled_first() {
        let mut buf = scratch(1024);
        let size = buf.len() * 8;
        let reap = unsafe { BytemapReap::init(scratch_ptr(&mut buf), size, 16) };
        let reap = unsafe { &mut *reap.as_ptr() };
        let slots: Vec<_> = (0..reap.num_total()).map(|_| reap.allocate().unwrap()).collect();

        unsafe {
            reap.release(slots[99]);
            reap.release(slots[12]);
        }
        assert_eq!(reap.allocate().unwrap(), slots[12]);
        assert_eq!(reap.allocate().unwrap(), slots[99]);
    }
}
