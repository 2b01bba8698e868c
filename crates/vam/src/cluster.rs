//! Fixed-size page-cluster heap over one committed partition span.
//!
//! A `ClusterHeap` owns a contiguous page-granular span and hands it out in
//! fixed-size clusters. Each cluster has a map entry carrying its status
//! flags and the link node for the free list. Freed clusters can optionally
//! be discarded (their physical backing hinted back to the OS) while staying
//! on the free list.

use std::ptr::NonNull;

use crate::list::{container_of, ListNode, RawList};
use crate::size_class::PAGE_SIZE;

const CLUSTER_FREE: u8 = 0b01;
const CLUSTER_DISCARDED: u8 = 0b10;

struct ClusterEntry {
    flags: u8,
    link: ListNode,
}

/// A heap of `heap_size / cluster_size` fixed-size page clusters.
pub struct ClusterHeap {
    base: NonNull<u8>,
    heap_size: usize,
    cluster_size: usize,
    num_clusters: usize,
    num_free: usize,
    num_discarded: usize,
    free_list: RawList,
    map: Box<[ClusterEntry]>,
}

impl ClusterHeap {
    /// Builds a cluster heap over `[base, base + heap_size)`.
    ///
    /// # Panics
    ///
    /// Panics unless `base` is page-aligned and `heap_size` is a non-zero
    /// multiple of `cluster_size`, itself a non-zero multiple of the page
    /// size.
    pub fn new(base: NonNull<u8>, heap_size: usize, cluster_size: usize) -> Self {
        assert!(heap_size != 0 && heap_size % PAGE_SIZE == 0);
        assert!(cluster_size != 0 && cluster_size % PAGE_SIZE == 0);
        assert!(heap_size % cluster_size == 0);
        assert_eq!(base.as_ptr() as usize % PAGE_SIZE, 0);

        let num_clusters = heap_size / cluster_size;
        let map: Box<[ClusterEntry]> = (0..num_clusters)
            .map(|_| ClusterEntry {
                // The span starts with no physical backing, so every cluster
                // begins free and discarded.
                flags: CLUSTER_FREE | CLUSTER_DISCARDED,
                link: ListNode::new(),
            })
            .collect();

        let mut heap = Self {
            base,
            heap_size,
            cluster_size,
            num_clusters,
            num_free: num_clusters,
            num_discarded: num_clusters,
            free_list: RawList::new(),
            map,
        };
        for index in (0..num_clusters).rev() {
            let node = NonNull::from(&mut heap.map[index].link);
            unsafe { heap.free_list.push_front(node) };
        }
        heap.sanity_check();
        heap
    }

    /// Pops a free cluster, or returns `None` when all are in use.
    pub fn allocate_cluster(&mut self) -> Option<NonNull<u8>> {
        self.sanity_check();
        if self.num_free == 0 {
            debug_assert!(self.free_list.is_empty());
            return None;
        }

        let node = self.free_list.first()?;
        unsafe { self.free_list.remove(node) };
        self.num_free -= 1;

        let index = self.node_index(node);
        let entry = &mut self.map[index];
        debug_assert!(entry.flags & CLUSTER_FREE != 0);
        entry.flags &= !CLUSTER_FREE;
        if entry.flags & CLUSTER_DISCARDED != 0 {
            entry.flags &= !CLUSTER_DISCARDED;
            self.num_discarded -= 1;
        }

        let ptr = unsafe { self.base.add(index * self.cluster_size) };
        self.sanity_check();
        Some(ptr)
    }

    /// Returns a cluster to the free list.
    ///
    /// With the `aggressive-discard` feature the cluster's backing is hinted
    /// back to the OS immediately; otherwise it stays resident for reuse.
    ///
    /// # Safety
    ///
    /// `ptr` must be a cluster previously returned by
    /// [`allocate_cluster`](Self::allocate_cluster) and not currently free.
    ///
    /// Returns `true` if a discard hint was issued.
    pub unsafe fn free_cluster(&mut self, ptr: NonNull<u8>) -> bool {
        self.sanity_check();
        let index = self.index_of(ptr);
        let node = NonNull::from(&mut self.map[index].link);
        unsafe { self.free_list.push_front(node) };
        self.num_free += 1;

        let entry = &mut self.map[index];
        debug_assert_eq!(entry.flags & CLUSTER_FREE, 0);
        entry.flags |= CLUSTER_FREE;

        let discarded;
        #[cfg(feature = "aggressive-discard")]
        {
            // Best effort: a refused hint just keeps the pages resident.
            let _ = unsafe { vam_sys::discard(ptr.as_ptr(), self.cluster_size) };
            entry.flags |= CLUSTER_DISCARDED;
            self.num_discarded += 1;
            discarded = true;
        }
        #[cfg(not(feature = "aggressive-discard"))]
        {
            entry.flags &= !CLUSTER_DISCARDED;
            discarded = false;
        }

        self.sanity_check();
        discarded
    }

    /// Whether the cluster holding `ptr` has been discarded.
    #[allow(dead_code)]
    #[must_use]
    pub fn is_discarded(&self, ptr: NonNull<u8>) -> bool {
        self.map[self.index_of(ptr)].flags & CLUSTER_DISCARDED != 0
    }

    /// Whether every cluster is free.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_free == self.num_clusters
    }

    /// Whether no cluster is free.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.num_free == 0
    }

    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    #[must_use]
    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    #[allow(dead_code)]
    #[must_use]
    pub fn num_free(&self) -> usize {
        self.num_free
    }

    fn index_of(&self, ptr: NonNull<u8>) -> usize {
        let offset = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        debug_assert!(offset < self.heap_size);
        debug_assert_eq!(offset % self.cluster_size, 0);
        offset / self.cluster_size
    }

    fn node_index(&self, node: NonNull<ListNode>) -> usize {
        let entry: NonNull<ClusterEntry> =
            unsafe { container_of(node, std::mem::offset_of!(ClusterEntry, link)) };
        let offset = entry.as_ptr() as usize - self.map.as_ptr() as usize;
        let index = offset / std::mem::size_of::<ClusterEntry>();
        debug_assert!(index < self.num_clusters);
        index
    }

    #[cfg(debug_assertions)]
    fn sanity_check(&self) {
        let mut num_free = 0;
        let mut num_discarded = 0;
        for node in unsafe { self.free_list.iter() } {
            let index = self.node_index(node);
            let entry = &self.map[index];
            debug_assert!(entry.flags & CLUSTER_FREE != 0);
            // Discarded clusters must form a suffix of the free list: fresh
            // frees are pushed at the head, discarded ones accumulate behind.
            debug_assert!(num_discarded == 0 || entry.flags & CLUSTER_DISCARDED != 0);
            num_free += 1;
            if entry.flags & CLUSTER_DISCARDED != 0 {
                num_discarded += 1;
            }
        }
        debug_assert_eq!(num_free, self.num_free);
        debug_assert_eq!(num_discarded, self.num_discarded);
    }

    #[cfg(not(debug_assertions))]
    fn sanity_check(&self) {}
}

// SAFETY: the heap exclusively owns its span and map; access is serialized
// by the owning partition lock.
unsafe impl Send for ClusterHeap {}
