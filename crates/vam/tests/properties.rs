//! Property tests over randomized allocate/deallocate sequences.

use vam::{Vam, OBJECT_QUANTUM};

/// Deterministic pseudo-random stream so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound as u64) as usize
    }
}

struct LiveBlock {
    ptr: *mut u8,
    size: usize,
    fill: u8,
}

fn random_size(rng: &mut Lcg) -> usize {
    match rng.below(10) {
        0..=5 => 1 + rng.below(256),            // small, reap territory
        6..=8 => 257 + rng.below(4096),         // mid, split/coalesce
        _ => 4096 + rng.below(200_000),         // large, still low-frequency
    }
}

fn fill(block: &LiveBlock) {
    unsafe { block.ptr.write_bytes(block.fill, block.size) };
}

fn verify_fill(block: &LiveBlock) {
    let bytes = unsafe { std::slice::from_raw_parts(block.ptr, block.size) };
    assert!(
        bytes.iter().all(|&b| b == block.fill),
        "block at {:p} (size {}) was clobbered",
        block.ptr,
        block.size
    );
}

#[test]
fn random_churn_preserves_contents_alignment_and_sizes() {
    let heap = Vam::with_partitions(64).expect("arena reservation failed");
    let mut rng = Lcg(0x9E37_79B9_7F4A_7C15);
    let mut live: Vec<LiveBlock> = Vec::new();
    let mut allocs = 0usize;
    let mut frees = 0usize;

    for step in 0..20_000 {
        let do_alloc = live.is_empty() || (live.len() < 400 && rng.below(2) == 0);
        if do_alloc {
            let size = random_size(&mut rng);
            let ptr = heap.allocate(size);
            assert!(!ptr.is_null(), "step {step}: allocate({size}) failed");
            assert_eq!(ptr as usize % OBJECT_QUANTUM, 0);
            unsafe { assert!(heap.size_of(ptr) >= size) };
            let block = LiveBlock {
                ptr,
                size,
                fill: (step % 251) as u8,
            };
            fill(&block);
            live.push(block);
            allocs += 1;
        } else {
            let victim = live.swap_remove(rng.below(live.len()));
            verify_fill(&victim);
            unsafe { heap.deallocate(victim.ptr) };
            frees += 1;
        }
    }

    assert_eq!(allocs - frees, live.len());

    // No two live blocks overlap.
    let mut ranges: Vec<(usize, usize)> = live
        .iter()
        .map(|b| (b.ptr as usize, b.ptr as usize + b.size))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(
            pair[0].1 <= pair[1].0,
            "live blocks overlap: {:x?} and {:x?}",
            pair[0],
            pair[1]
        );
    }

    for block in &live {
        verify_fill(block);
    }
    for block in live {
        unsafe { heap.deallocate(block.ptr) };
    }
}

#[test]
fn churn_does_not_accumulate_partitions() {
    let heap = Vam::with_partitions(64).expect("arena reservation failed");
    let mut rng = Lcg(42);

    // Warm up: promote the hot sizes and fault in the working set.
    for _ in 0..2000 {
        let size = [24, 40, 512, 8192][rng.below(4)];
        let p = heap.allocate(size);
        assert!(!p.is_null());
        unsafe { heap.deallocate(p) };
    }
    let warm = heap.source_stats();

    // Steady-state churn must not go back to the OS.
    for _ in 0..20_000 {
        let size = [24, 40, 512, 8192][rng.below(4)];
        let p = heap.allocate(size);
        assert!(!p.is_null());
        unsafe { heap.deallocate(p) };
    }
    let steady = heap.source_stats();
    assert_eq!(
        steady.commits, warm.commits,
        "steady-state churn should be served from retained partitions"
    );
}

#[test]
fn interleaved_threads_never_alias() {
    let heap = std::sync::Arc::new(Vam::with_partitions(64).expect("arena reservation failed"));
    let mut handles = Vec::new();
    for t in 0..4u8 {
        let heap = heap.clone();
        handles.push(std::thread::spawn(move || {
            let mut rng = Lcg(u64::from(t) + 7);
            let mut live: Vec<LiveBlock> = Vec::new();
            for step in 0..4000 {
                if live.is_empty() || (live.len() < 100 && rng.below(2) == 0) {
                    let size = random_size(&mut rng);
                    let ptr = heap.allocate(size);
                    assert!(!ptr.is_null());
                    let block = LiveBlock {
                        ptr,
                        size,
                        fill: t.wrapping_mul(31).wrapping_add((step % 97) as u8),
                    };
                    fill(&block);
                    live.push(block);
                } else {
                    let victim = live.swap_remove(rng.below(live.len()));
                    // A torn fill here means another thread's block aliased
                    // ours.
                    verify_fill(&victim);
                    unsafe { heap.deallocate(victim.ptr) };
                }
            }
            for block in live {
                verify_fill(&block);
                unsafe { heap.deallocate(block.ptr) };
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}
