//! One-object-size heap over a family of reaps.
//!
//! Subheaps are created in exponentially growing page clusters (one order
//! per partition tag) and recycled aggressively: a reap that empties is
//! destroyed and its cluster returned to the page source. The owning reap of
//! any pointer is recovered by masking the address with the cluster size
//! encoded in its partition tag, so no per-object back-reference exists.

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::list::RawList;
use crate::partition::PageSource;
use crate::reap::{self, Reap, Workhorse};
use crate::size_class::{MAX_PAGE_ORDER, PAGE_MASK, PAGE_SIZE};

/// A fixed-size heap serving one size class.
pub trait SizedHeap {
    /// Allocates one object of `size` bytes.
    fn allocate(&mut self, size: usize, source: &PageSource) -> Option<NonNull<u8>>;

    /// Frees one object.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap's `allocate` and not freed
    /// since; `tag` must be the partition tag of `ptr`.
    unsafe fn release(&mut self, ptr: NonNull<u8>, tag: u8, source: &PageSource);
}

/// Cluster base of an object from its address and partition tag.
fn cluster_base(ptr: NonNull<u8>, tag: u8) -> NonNull<u8> {
    debug_assert!((1..=MAX_PAGE_ORDER).contains(&tag));
    let addr = ptr.as_ptr() as usize;
    let masked = addr & (PAGE_MASK << (tag - 1));
    // Derive from the object pointer to keep provenance over the cluster.
    unsafe { NonNull::new_unchecked(ptr.as_ptr().wrapping_sub(addr - masked)) }
}

/// Object size of whatever subheap owns `ptr`, read from the reap prefix.
///
/// # Safety
///
/// `ptr` must point into a live subheap cluster whose partition tag is
/// `tag`.
pub(crate) unsafe fn object_size_of(ptr: NonNull<u8>, tag: u8) -> usize {
    unsafe { reap::object_size_at(cluster_base(ptr, tag)) }
}

/// Heap of subheaps all serving the same object size.
pub struct OneSizeHeap<R: Reap = Workhorse> {
    avai: RawList,
    full: RawList,
    object_size: usize,
    next_order: u8,
    _reap: PhantomData<R>,
}

impl<R: Reap> OneSizeHeap<R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            avai: RawList::new(),
            full: RawList::new(),
            object_size: 0,
            next_order: 1,
            _reap: PhantomData,
        }
    }

    /// The fixed object size, adopted from the first request.
    #[cfg(test)]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    fn create_subheap(&mut self, source: &PageSource) -> Option<NonNull<R>> {
        let order = self.next_order;
        let cluster_size = PAGE_SIZE << (order - 1);
        let cluster = source.allocate(cluster_size, order)?;
        debug_assert_eq!(cluster.as_ptr() as usize % cluster_size, 0);
        crate::trace_event!(object_size = self.object_size, order, "subheap created");

        let mut reap = unsafe { R::init(cluster, cluster_size, self.object_size) };
        unsafe {
            let node = reap.as_mut().link();
            self.avai.push_front(node);
        }
        if self.next_order < MAX_PAGE_ORDER {
            self.next_order += 1;
        }
        Some(reap)
    }

    fn destroy_subheap(&mut self, mut reap: NonNull<R>, source: &PageSource) {
        unsafe {
            let r = reap.as_mut();
            debug_assert_eq!(r.num_free(), r.num_total());
            let node = r.link();
            self.avai.remove(node);
            source.release(NonNull::new_unchecked(reap.as_ptr().cast::<u8>()));
        }
        if self.next_order > 1 {
            self.next_order -= 1;
        }
    }

    #[cfg(debug_assertions)]
    fn sanity_check(&self) {
        for node in unsafe { self.avai.iter() } {
            let reap = unsafe { R::from_link(node) };
            let r = unsafe { reap.as_ref() };
            debug_assert_eq!(reap.as_ptr() as usize % PAGE_SIZE, 0);
            debug_assert_eq!(r.object_size(), self.object_size);
            debug_assert!(r.num_free() > 0 && r.num_free() <= r.num_total());
        }
        for node in unsafe { self.full.iter() } {
            let reap = unsafe { R::from_link(node) };
            let r = unsafe { reap.as_ref() };
            debug_assert_eq!(reap.as_ptr() as usize % PAGE_SIZE, 0);
            debug_assert_eq!(r.object_size(), self.object_size);
            debug_assert_eq!(r.num_free(), 0);
        }
    }

    #[cfg(not(debug_assertions))]
    fn sanity_check(&self) {}
}

impl<R: Reap> SizedHeap for OneSizeHeap<R> {
    fn allocate(&mut self, size: usize, source: &PageSource) -> Option<NonNull<u8>> {
        self.sanity_check();
        debug_assert!(self.object_size == 0 || size == self.object_size);
        debug_assert!(size < PAGE_SIZE);

        // The first request fixes the object size.
        if self.object_size == 0 {
            self.object_size = size;
        }

        // Serve from an available subheap. A reap that hands out its last
        // slot moves to the full list right away, so membership of `avai`
        // always implies free slots and the free path can trust it.
        while let Some(node) = self.avai.first() {
            let mut reap = unsafe { R::from_link(node) };
            let r = unsafe { reap.as_mut() };
            if let Some(ptr) = r.allocate() {
                if r.num_free() == 0 {
                    unsafe {
                        self.avai.remove(node);
                        self.full.push_front(node);
                    }
                }
                self.sanity_check();
                return Some(ptr);
            }
            debug_assert_eq!(r.num_free(), 0);
            unsafe {
                self.avai.remove(node);
                self.full.push_front(node);
            }
        }

        // Everything is full: grow.
        let mut reap = self.create_subheap(source)?;
        let r = unsafe { reap.as_mut() };
        let ptr = r.allocate();
        debug_assert!(ptr.is_some());
        if r.num_free() == 0 {
            let node = r.link();
            unsafe {
                self.avai.remove(node);
                self.full.push_front(node);
            }
        }
        self.sanity_check();
        ptr
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, tag: u8, source: &PageSource) {
        self.sanity_check();
        let mut reap = cluster_base(ptr, tag).cast::<R>();
        let r = unsafe { reap.as_mut() };
        debug_assert_eq!(r.object_size(), self.object_size);
        unsafe { r.release(ptr) };

        if r.num_free() == 1 {
            // Just left the full list.
            let node = r.link();
            unsafe {
                self.full.remove(node);
                self.avai.push_front(node);
            }
        } else if r.num_free() == r.num_total() {
            self.destroy_subheap(reap, source);
        }
        self.sanity_check();
    }
}

impl<R: Reap> Default for OneSizeHeap<R> {
    fn default() -> Self {
        Self::new()
    }
}
