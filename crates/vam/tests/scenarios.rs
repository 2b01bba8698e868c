//! End-to-end scenarios pinning the allocator's routing and OS behavior.

use vam::{Vam, PAGE_SIZE, PARTITION_SIZE};

fn heap() -> Vam {
    Vam::with_partitions(32).expect("arena reservation failed")
}

#[test]
fn small_hot_path_stops_going_to_the_os() {
    let heap = heap();
    // Warm up: the 24-byte class is promoted once 24 * count exceeds a
    // page, and the first high-frequency partition gets claimed.
    for _ in 0..500 {
        let p = heap.allocate(24);
        assert!(!p.is_null());
        unsafe { heap.deallocate(p) };
    }
    let warm = heap.source_stats();

    for _ in 0..10_000 {
        let p = heap.allocate(24);
        assert!(!p.is_null());
        assert!(heap.is_high_frequency(p));
        unsafe { heap.deallocate(p) };
    }
    let steady = heap.source_stats();
    assert_eq!(steady.commits, warm.commits, "no page-provider traffic after warmup");
    assert_eq!(steady.partitions_claimed, warm.partitions_claimed);
}

#[test]
fn frequency_promotion_switches_partitions() {
    let heap = heap();
    let first = heap.allocate(40);
    assert!(
        !heap.is_high_frequency(first),
        "a cold size starts on the low-frequency path"
    );
    unsafe { heap.deallocate(first) };

    // Drive the cumulative bytes of the 40-byte class past one page.
    let mut promoted = None;
    for _ in 0..=PAGE_SIZE / 40 + 1 {
        let p = heap.allocate(40);
        assert!(!p.is_null());
        if heap.is_high_frequency(p) {
            promoted = Some(p);
            break;
        }
        unsafe { heap.deallocate(p) };
    }
    let promoted = promoted.expect("the 40-byte class never got promoted");
    // From now on every 40-byte allocation is high-frequency.
    let next = heap.allocate(40);
    assert!(heap.is_high_frequency(next));
    unsafe {
        heap.deallocate(promoted);
        heap.deallocate(next);
    }
}

#[test]
fn huge_allocation_is_one_commit_one_uncommit() {
    let heap = heap();
    let size = 10 * PARTITION_SIZE;
    let before = heap.source_stats();

    let p = heap.allocate(size);
    assert!(!p.is_null());
    let after_alloc = heap.source_stats();
    assert_eq!(after_alloc.commits - before.commits, 1);
    assert!(after_alloc.commit_bytes - before.commit_bytes >= (size + PAGE_SIZE) as u64);
    unsafe {
        assert!(heap.size_of(p) >= size);
        // The span is really writable end to end.
        p.write_bytes(0xC3, size);
        heap.deallocate(p);
    }
    let after_free = heap.source_stats();
    assert_eq!(after_free.uncommits - after_alloc.uncommits, 1);
    assert_eq!(
        after_free.partitions_released - before.partitions_released,
        after_alloc.partitions_claimed - before.partitions_claimed
    );
}

#[test]
fn split_serves_a_smaller_request_from_a_freed_block() {
    let heap = heap();
    // Sizes above MAX_DEDICATED stay on the low-frequency path forever.
    let a = heap.allocate(2000);
    let b = heap.allocate(2000);
    let c = heap.allocate(2000);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());

    unsafe { heap.deallocate(b) };
    // The freed block is split: the request reuses b's exact address and
    // the remainder goes back to the index.
    let d = heap.allocate(1100);
    assert_eq!(d, b);
    unsafe {
        assert!(heap.size_of(d) >= 1100);
        assert!(heap.size_of(d) < 2000);
        heap.deallocate(a);
        heap.deallocate(c);
        heap.deallocate(d);
    }
}

#[test]
fn freed_neighbors_coalesce_into_their_sum() {
    let heap = heap();
    let a = heap.allocate(2000);
    let b = heap.allocate(2000);
    let c = heap.allocate(2000);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());

    unsafe {
        heap.deallocate(b);
        heap.deallocate(a);
    }
    // a and b merged (plus the header between them): a request for the
    // combined span is served at a's address.
    let merged = heap.allocate(2000 + 16 + 2000);
    assert_eq!(merged, a);
    unsafe {
        heap.deallocate(merged);
        heap.deallocate(c);
    }
}

#[test]
fn mixed_stream_collapses_back_to_giant_free_blocks() {
    let heap = heap();
    let mut live = Vec::new();
    let mut huge = Vec::new();
    for i in 0..1000 {
        live.push(heap.allocate(8));
        live.push(heap.allocate(48));
        if i % 100 == 0 {
            huge.push(heap.allocate(1024 * 1024));
        }
    }
    for p in &live {
        assert!(!p.is_null());
    }
    for p in live.iter().rev().chain(huge.iter().rev()) {
        unsafe { heap.deallocate(*p) };
    }

    let drained = heap.source_stats();
    // Everything went back: the retained partitions can serve a
    // maximum-size low-frequency block without new OS traffic, which is
    // only possible if the freed blocks coalesced back into one giant
    // block per superchunk.
    let giant = heap.allocate(PARTITION_SIZE / 2);
    assert!(!giant.is_null());
    assert_eq!(heap.source_stats().commits, drained.commits);
    unsafe { heap.deallocate(giant) };

    // The address space actually shrank back: what stays claimed is one
    // retained partition per subheap order touched plus the low-frequency
    // superchunks, independent of how much was allocated.
    let outstanding = drained.partitions_claimed - drained.partitions_released;
    assert!(
        outstanding <= 8,
        "too many partitions retained after drain: {outstanding}"
    );
}

#[test]
fn single_size_churn_is_rss_bounded() {
    let heap = heap();
    let size = 512 * 1024;
    let p = heap.allocate(size);
    unsafe { heap.deallocate(p) };
    let warm = heap.source_stats();
    for _ in 0..200 {
        let p = heap.allocate(size);
        assert!(!p.is_null());
        unsafe { heap.deallocate(p) };
    }
    let steady = heap.source_stats();
    assert_eq!(steady.commits, warm.commits);
    assert_eq!(
        steady.partitions_claimed - steady.partitions_released,
        warm.partitions_claimed - warm.partitions_released
    );
}

#[test]
fn sizes_of_live_blocks_survive_heavy_interleaving() {
    let heap = heap();
    let sizes = [8, 16, 24, 48, 96, 200, 1024, 2048, 50_000];
    let mut rounds = Vec::new();
    for round in 0..50 {
        let mut batch = Vec::new();
        for &size in &sizes {
            let p = heap.allocate(size);
            assert!(!p.is_null());
            batch.push((p, size));
        }
        rounds.push(batch);
        if round % 3 == 2 {
            for (p, size) in rounds.remove(0) {
                unsafe {
                    assert!(heap.size_of(p) >= size);
                    heap.deallocate(p);
                }
            }
        }
    }
    for batch in rounds {
        for (p, size) in batch {
            unsafe {
                assert!(heap.size_of(p) >= size);
                heap.deallocate(p);
            }
        }
    }
}
