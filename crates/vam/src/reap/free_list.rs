//! A reap that recycles freed slots through an intrusive LIFO free list.

use std::mem;
use std::ptr::{self, NonNull};

use crate::list::{container_of, ListNode};
use crate::reap::{Reap, ReapBase};
use crate::size_class::{align_up, OBJECT_QUANTUM};

struct FreeSlot {
    next: *mut FreeSlot,
}

/// Freelist-recycling reap. The list is threaded through the freed slots
/// themselves, so there is no scan and no side structure.
#[repr(C)]
pub struct FreelistReap {
    base: ReapBase,
    free_head: *mut FreeSlot,
    link: ListNode,
}

impl Reap for FreelistReap {
    unsafe fn init(cluster: NonNull<u8>, size: usize, object_size: usize) -> NonNull<Self> {
        debug_assert!(object_size >= mem::size_of::<FreeSlot>());
        let header = cluster.cast::<Self>();
        let base_offset = align_up(mem::size_of::<Self>(), OBJECT_QUANTUM);
        let base_ptr = unsafe { cluster.as_ptr().add(base_offset) };

        let num_total = (size - base_offset) / object_size;
        debug_assert!(num_total > 0);
        unsafe {
            header.write(Self {
                base: ReapBase::new(object_size, num_total, base_ptr),
                free_head: ptr::null_mut(),
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
        debug_assert!(!self.free_head.is_null());
        let slot = self.free_head;
        self.free_head = unsafe { (*slot).next };
        self.base.num_free -= 1;
        NonNull::new(slot.cast::<u8>())
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        debug_assert!(self.base.num_free() < self.base.num_total());
        debug_assert!(self.base.slot_of(ptr) < self.base.num_total());
        let slot = ptr.as_ptr().cast::<FreeSlot>();
        unsafe {
            (*slot).next = self.free_head;
        }
        self.free_head = slot;
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
