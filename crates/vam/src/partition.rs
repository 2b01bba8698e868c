//! The partition space: address-to-owner routing and partition lifecycle.
//!
//! One contiguous, partition-aligned arena of address space is reserved up
//! front; partitions are claimed by committing a slot and released by
//! uncommitting it. Every slot has a one-byte tag, so classifying any
//! pointer is a bounds check plus one table read. Per tag, claimed
//! partitions sit on a `full` or `avai` list of cluster heaps; the cluster
//! heap instances live in a pre-reserved pool slot per partition, so
//! claiming a partition never re-enters allocation.

use std::io;
use std::mem;
use std::ptr::NonNull;

use crate::cluster::ClusterHeap;
use crate::list::{container_of, ListNode, RawList};
use crate::locked::Locked;
use crate::size_class::{align_up, MAX_PAGE_ORDER, PAGE_SIZE, PARTITION_SIZE};
use crate::stats::SourceStats;
use vam_sys::{MapOptions, Region};

/// Tag of partitions backing the low-frequency (boundary-tagged) heap.
pub const LOW_FREQ_TAG: u8 = 0;

/// Tag byte of unclaimed partitions.
pub const INVALID_TAG: u8 = 0xFF;

/// Number of distinct partition tags: the low-frequency tag plus one per
/// subheap order.
pub const NUM_TAGS: usize = MAX_PAGE_ORDER as usize + 1;

const _: () = assert!(NUM_TAGS <= 255, "0xFF is reserved for INVALID_TAG");

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SlotStatus {
    /// Never claimed, or released back to the arena.
    Unused,
    /// Claimed, with at least one free cluster.
    Avai,
    /// Claimed, no free clusters.
    Full,
    /// Non-head partition of a multi-partition (huge) claim.
    HugeTail,
}

struct PartitionSlot {
    status: SlotStatus,
    link: ListNode,
    heap: Option<ClusterHeap>,
}

struct TagLists {
    full: RawList,
    avai: RawList,
}

/// The process-wide partition table and arena.
pub struct PartitionSpace {
    arena: Region,
    base: usize,
    num_partitions: usize,
    tag_map: Box<[u8]>,
    slots: Box<[PartitionSlot]>,
    lists: [TagLists; NUM_TAGS],
    scan_hint: usize,
    stats: SourceStats,
}

impl PartitionSpace {
    /// Reserves an arena of `num_partitions` slots.
    ///
    /// # Errors
    ///
    /// Fails if the OS refuses the address-space reservation.
    ///
    /// # Panics
    ///
    /// Panics if `num_partitions` is zero.
    pub fn new(num_partitions: usize) -> io::Result<Self> {
        assert!(num_partitions > 0);
        let arena = unsafe {
            MapOptions::new()
                .len(num_partitions * PARTITION_SIZE)
                .align(PARTITION_SIZE)
                .reserve_only(true)
                .map()?
        };
        let base = arena.ptr() as usize;

        let tag_map = vec![INVALID_TAG; num_partitions].into_boxed_slice();
        let slots: Box<[PartitionSlot]> = (0..num_partitions)
            .map(|_| PartitionSlot {
                status: SlotStatus::Unused,
                link: ListNode::new(),
                heap: None,
            })
            .collect();

        let space = Self {
            arena,
            base,
            num_partitions,
            tag_map,
            slots,
            lists: std::array::from_fn(|_| TagLists {
                full: RawList::new(),
                avai: RawList::new(),
            }),
            scan_hint: 0,
            stats: SourceStats::default(),
        };
        space.sanity_check();
        Ok(space)
    }

    /// Partition index of `addr`, or `None` if it is outside the arena.
    fn partition_index(&self, addr: usize) -> Option<usize> {
        if !self.arena.contains(addr) {
            return None;
        }
        Some((addr - self.base) / PARTITION_SIZE)
    }

    fn slot_base(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.num_partitions);
        unsafe { NonNull::new_unchecked(self.arena.ptr().add(index * PARTITION_SIZE)) }
    }

    fn slot_index(&self, node: NonNull<ListNode>) -> usize {
        let slot: NonNull<PartitionSlot> =
            unsafe { container_of(node, mem::offset_of!(PartitionSlot, link)) };
        let offset = slot.as_ptr() as usize - self.slots.as_ptr() as usize;
        let index = offset / mem::size_of::<PartitionSlot>();
        debug_assert!(index < self.num_partitions);
        index
    }

    /// The classification oracle: the tag of the partition holding `ptr`,
    /// or `None` for unclaimed or foreign addresses.
    pub fn tag_of(&self, ptr: *mut u8) -> Option<u8> {
        let index = self.partition_index(ptr as usize)?;
        let tag = self.tag_map[index];
        (tag != INVALID_TAG).then_some(tag)
    }

    /// Snapshot of the provider-call counters.
    #[must_use]
    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    /// Allocates a page cluster (`size ≤ PARTITION_SIZE`) or a dedicated
    /// huge span, claiming partitions as needed. Returns `None` on
    /// exhaustion of the arena or the OS.
    pub fn allocate(&mut self, size: usize, tag: u8) -> Option<NonNull<u8>> {
        debug_assert!((tag as usize) < NUM_TAGS);
        self.sanity_check();
        let ptr = if size <= PARTITION_SIZE {
            self.allocate_regular(size, tag)
        } else {
            self.allocate_huge(size, tag)
        };
        self.sanity_check();
        ptr
    }

    fn allocate_regular(&mut self, cluster_size: usize, tag: u8) -> Option<NonNull<u8>> {
        // Serve from a partition that still has free clusters.
        while let Some(node) = self.lists[tag as usize].avai.first() {
            let index = self.slot_index(node);
            let heap = self.slots[index]
                .heap
                .as_mut()
                .expect("listed partition without a cluster heap");
            debug_assert_eq!(heap.cluster_size(), cluster_size);
            if let Some(ptr) = heap.allocate_cluster() {
                return Some(ptr);
            }
            // Exhausted: park it on the full list and keep walking.
            unsafe {
                self.lists[tag as usize].avai.remove(node);
                self.lists[tag as usize].full.push_front(node);
            }
            self.slots[index].status = SlotStatus::Full;
        }

        // Claim a fresh partition.
        let index = self.find_unused_run(1)?;
        let base = self.slot_base(index);
        unsafe { vam_sys::commit(base.as_ptr(), PARTITION_SIZE).ok()? };
        self.stats.record_commit(PARTITION_SIZE, 1);
        crate::trace_event!(partition = index, tag, cluster_size, "partition claimed");

        self.slots[index].heap = Some(ClusterHeap::new(base, PARTITION_SIZE, cluster_size));
        self.tag_map[index] = tag;
        self.slots[index].status = SlotStatus::Avai;
        let node = NonNull::from(&mut self.slots[index].link);
        unsafe { self.lists[tag as usize].avai.push_front(node) };

        let ptr = self.slots[index]
            .heap
            .as_mut()
            .and_then(ClusterHeap::allocate_cluster);
        debug_assert!(ptr.is_some());
        ptr
    }

    fn allocate_huge(&mut self, size: usize, tag: u8) -> Option<NonNull<u8>> {
        let heap_size = align_up(size, PAGE_SIZE);
        let span = heap_size.div_ceil(PARTITION_SIZE);
        let index = self.find_unused_run(span)?;
        let base = self.slot_base(index);
        unsafe { vam_sys::commit(base.as_ptr(), heap_size).ok()? };
        self.stats.record_commit(heap_size, span);
        crate::trace_event!(partition = index, tag, span, "huge span claimed");

        // A one-shot subheap: a single cluster covering the whole span.
        self.slots[index].heap = Some(ClusterHeap::new(base, heap_size, heap_size));
        self.tag_map[index] = tag;
        self.slots[index].status = SlotStatus::Full;
        for tail in index + 1..index + span {
            self.slots[tail].status = SlotStatus::HugeTail;
        }
        let node = NonNull::from(&mut self.slots[index].link);
        unsafe { self.lists[tag as usize].full.push_front(node) };

        let ptr = self.slots[index]
            .heap
            .as_mut()
            .and_then(ClusterHeap::allocate_cluster);
        debug_assert!(ptr.is_some());
        debug_assert!(self.slots[index].heap.as_ref().is_some_and(ClusterHeap::is_full));
        ptr
    }

    /// First-fit scan for `span` contiguous unused slots, starting at the
    /// rotating hint.
    fn find_unused_run(&mut self, span: usize) -> Option<usize> {
        debug_assert!(span >= 1);
        if span > self.num_partitions {
            return None;
        }
        let starts = self.num_partitions - span + 1;
        let hint = self.scan_hint.min(starts - 1);
        for start in (hint..starts).chain(0..hint) {
            if self.slots[start..start + span]
                .iter()
                .all(|slot| slot.status == SlotStatus::Unused)
            {
                self.scan_hint = start + 1;
                return Some(start);
            }
        }
        None
    }

    /// Returns a page cluster to its owning partition; releases the
    /// partition when it empties, unless it is the last available one of
    /// its tag.
    ///
    /// Unknown pointers are a no-op, per the tag-routing contract.
    ///
    /// # Safety
    ///
    /// `ptr` must be a cluster previously handed out by
    /// [`allocate`](Self::allocate) and not currently free.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        self.sanity_check();
        let Some(index) = self.partition_index(ptr.as_ptr() as usize) else {
            debug_assert!(false, "releasing a pointer outside the arena");
            return;
        };
        let tag = self.tag_map[index];
        if tag == INVALID_TAG {
            return;
        }

        let (discarded, empty) = {
            let heap = self.slots[index]
                .heap
                .as_mut()
                .expect("tagged partition without a cluster heap");
            (unsafe { heap.free_cluster(ptr) }, heap.is_empty())
        };
        if discarded {
            self.stats.record_discard();
        }

        let status = self.slots[index].status;
        let node = NonNull::from(&mut self.slots[index].link);
        let sole_avai =
            status == SlotStatus::Avai && self.lists[tag as usize].avai.is_sole(node);

        if empty && !sole_avai {
            self.release_partition(index, tag);
        } else if status == SlotStatus::Full {
            unsafe {
                self.lists[tag as usize].full.remove(node);
                self.lists[tag as usize].avai.push_front(node);
            }
            self.slots[index].status = SlotStatus::Avai;
        }
        self.sanity_check();
    }

    fn release_partition(&mut self, index: usize, tag: u8) {
        let node = NonNull::from(&mut self.slots[index].link);
        match self.slots[index].status {
            SlotStatus::Avai => unsafe { self.lists[tag as usize].avai.remove(node) },
            SlotStatus::Full => unsafe { self.lists[tag as usize].full.remove(node) },
            status => debug_assert!(false, "releasing partition in state {status:?}"),
        }

        let heap = self.slots[index].heap.take().expect("released twice");
        let heap_size = heap.heap_size();
        let span = heap_size.div_ceil(PARTITION_SIZE);
        let _ = unsafe { vam_sys::uncommit(heap.base().as_ptr(), heap_size) };
        self.stats.record_uncommit(heap_size, span);
        crate::trace_event!(partition = index, tag, span, "partition released");

        self.tag_map[index] = INVALID_TAG;
        self.slots[index].status = SlotStatus::Unused;
        for tail in index + 1..index + span {
            debug_assert_eq!(self.slots[tail].status, SlotStatus::HugeTail);
            self.slots[tail].status = SlotStatus::Unused;
        }
    }

    #[cfg(debug_assertions)]
    fn sanity_check(&self) {
        let mut listed = 0;
        for (tag, lists) in self.lists.iter().enumerate() {
            for node in unsafe { lists.avai.iter() } {
                let index = self.slot_index(node);
                debug_assert_eq!(self.slots[index].status, SlotStatus::Avai);
                debug_assert_eq!(self.tag_map[index], tag as u8);
                listed += 1;
            }
            for node in unsafe { lists.full.iter() } {
                let index = self.slot_index(node);
                debug_assert_eq!(self.slots[index].status, SlotStatus::Full);
                debug_assert_eq!(self.tag_map[index], tag as u8);
                debug_assert!(self.slots[index]
                    .heap
                    .as_ref()
                    .is_some_and(ClusterHeap::is_full));
                listed += 1;
            }
        }
        let mut unused = 0;
        let mut tails = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            match slot.status {
                SlotStatus::Unused => {
                    debug_assert_eq!(self.tag_map[index], INVALID_TAG);
                    debug_assert!(slot.heap.is_none());
                    unused += 1;
                }
                SlotStatus::HugeTail => {
                    debug_assert_eq!(self.tag_map[index], INVALID_TAG);
                    debug_assert!(slot.heap.is_none());
                    tails += 1;
                }
                SlotStatus::Avai | SlotStatus::Full => {}
            }
        }
        debug_assert_eq!(listed + unused + tails, self.num_partitions);
    }

    #[cfg(not(debug_assertions))]
    fn sanity_check(&self) {}
}

// SAFETY: all interior raw pointers reference memory owned by the arena or
// the boxed tables; access is serialized by the enclosing lock.
unsafe impl Send for PartitionSpace {}

/// The shared, locked page source both allocation paths draw from.
pub struct PageSource {
    inner: Locked<PartitionSpace>,
}

impl PageSource {
    /// Reserves a page source with `num_partitions` arena slots.
    ///
    /// # Errors
    ///
    /// Fails if the address-space reservation is refused.
    pub fn new(num_partitions: usize) -> io::Result<Self> {
        Ok(Self {
            inner: Locked::new(PartitionSpace::new(num_partitions)?),
        })
    }

    /// See [`PartitionSpace::allocate`].
    pub fn allocate(&self, size: usize, tag: u8) -> Option<NonNull<u8>> {
        self.inner.lock().allocate(size, tag)
    }

    /// See [`PartitionSpace::release`].
    ///
    /// # Safety
    ///
    /// `ptr` must be a live cluster handed out by [`allocate`](Self::allocate).
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        unsafe { self.inner.lock().release(ptr) }
    }

    /// See [`PartitionSpace::tag_of`].
    pub fn tag_of(&self, ptr: *mut u8) -> Option<u8> {
        self.inner.lock().tag_of(ptr)
    }

    /// Snapshot of the provider-call counters.
    pub fn stats(&self) -> SourceStats {
        self.inner.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_and_routes_regular_clusters() {
        let mut space = PartitionSpace::new(8).unwrap();
        let a = space.allocate(4 * PAGE_SIZE, 3).unwrap();
        let b = space.allocate(4 * PAGE_SIZE, 3).unwrap();
        // Same partition serves both clusters.
        assert_eq!(space.stats().partitions_claimed, 1);
        assert_eq!(space.tag_of(a.as_ptr()), Some(3));
        assert_eq!(space.tag_of(b.as_ptr()), Some(3));
        assert_eq!(
            space.tag_of(unsafe { a.as_ptr().add(PAGE_SIZE) }),
            Some(3),
            "interior pointers classify by partition"
        );
    }

    #[test]
    fn tags_partition_the_address_space() {
        let mut space = PartitionSpace::new(8).unwrap();
        let low = space.allocate(PARTITION_SIZE, LOW_FREQ_TAG).unwrap();
        let high = space.allocate(PAGE_SIZE, 1).unwrap();
        assert_eq!(space.tag_of(low.as_ptr()), Some(LOW_FREQ_TAG));
        assert_eq!(space.tag_of(high.as_ptr()), Some(1));
        assert_eq!(space.tag_of(std::ptr::null_mut()), None);
        assert_eq!(space.stats().partitions_claimed, 2);
    }

    #[test]
    fn last_available_partition_is_retained() {
        let mut space = PartitionSpace::new(8).unwrap();
        let a = space.allocate(PAGE_SIZE, 1).unwrap();
        unsafe { space.release(a) };
        // Empty but sole member of avai[1]: kept warm.
        assert_eq!(space.stats().partitions_released, 0);
        assert_eq!(space.tag_of(a.as_ptr()), Some(1));
        // The retained partition serves the next claim without committing.
        let commits = space.stats().commits;
        let b = space.allocate(PAGE_SIZE, 1).unwrap();
        assert_eq!(space.stats().commits, commits);
        assert_eq!(a, b);
    }

    #[test]
    fn second_empty_partition_is_released() {
        let mut space = PartitionSpace::new(8).unwrap();
        // Fill partition 1 completely so a second one gets claimed.
        let per_partition = PARTITION_SIZE / PAGE_SIZE;
        let mut clusters = Vec::new();
        for _ in 0..per_partition + 1 {
            clusters.push(space.allocate(PAGE_SIZE, 1).unwrap());
        }
        assert_eq!(space.stats().partitions_claimed, 2);
        // Empty the first partition; the second stays available, so the
        // first is released.
        let released = clusters
            .iter()
            .filter(|c| space.partition_index(c.as_ptr() as usize) == Some(0))
            .copied()
            .collect::<Vec<_>>();
        for cluster in released {
            unsafe { space.release(cluster) };
        }
        assert_eq!(space.stats().partitions_released, 1);
    }

    #[test]
    fn huge_spans_claim_contiguous_partitions() {
        let mut space = PartitionSpace::new(8).unwrap();
        let size = 3 * PARTITION_SIZE + PAGE_SIZE;
        let huge = space.allocate(size, LOW_FREQ_TAG).unwrap();
        assert_eq!(space.stats().partitions_claimed, 4);
        assert_eq!(space.stats().commits, 1);
        assert!(space.stats().commit_bytes >= size as u64);
        assert_eq!(space.tag_of(huge.as_ptr()), Some(LOW_FREQ_TAG));
        // Tail partitions carry no tag.
        assert_eq!(space.tag_of(unsafe { huge.as_ptr().add(PARTITION_SIZE) }), None);

        unsafe { space.release(huge) };
        assert_eq!(space.stats().partitions_released, 4);
        assert_eq!(space.tag_of(huge.as_ptr()), None);
    }

    #[test]
    fn arena_exhaustion_returns_none() {
        let mut space = PartitionSpace::new(2).unwrap();
        assert!(space.allocate(PARTITION_SIZE, LOW_FREQ_TAG).is_some());
        assert!(space.allocate(PARTITION_SIZE, 1).is_some());
        assert!(space.allocate(PARTITION_SIZE, 2).is_none());
        assert!(space.allocate(3 * PARTITION_SIZE, LOW_FREQ_TAG).is_none());
    }

    #[test]
    fn huge_spans_fit_around_claimed_partitions() {
        let mut space = PartitionSpace::new(6).unwrap();
        let a = space.allocate(PAGE_SIZE, 1).unwrap();
        // 4-partition span must start past partition 0.
        let size = 3 * PARTITION_SIZE + PAGE_SIZE;
        let huge = space.allocate(size, LOW_FREQ_TAG).unwrap();
        let a_index = space.partition_index(a.as_ptr() as usize).unwrap();
        let huge_index = space.partition_index(huge.as_ptr() as usize).unwrap();
        assert_ne!(a_index, huge_index);
        assert!(huge_index + 4 <= 6);
    }
}
