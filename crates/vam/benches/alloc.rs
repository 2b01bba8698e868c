use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use vam::Vam;

fn fixed_size_churn(c: &mut Criterion) {
    let heap = Vam::with_partitions(64).expect("arena reservation failed");
    // Promote the size so the bench measures the reap fast path.
    for _ in 0..1000 {
        let p = heap.allocate(24);
        unsafe { heap.deallocate(p) };
    }
    c.bench_function("hot_24_byte_churn", |b| {
        b.iter(|| {
            let p = heap.allocate(black_box(24));
            unsafe { heap.deallocate(p) };
        });
    });
}

fn cold_mid_size_churn(c: &mut Criterion) {
    let heap = Vam::with_partitions(64).expect("arena reservation failed");
    c.bench_function("low_freq_4k_churn", |b| {
        b.iter(|| {
            let p = heap.allocate(black_box(4096));
            unsafe { heap.deallocate(p) };
        });
    });
}

fn mixed_batch(c: &mut Criterion) {
    let heap = Vam::with_partitions(64).expect("arena reservation failed");
    let sizes = [16usize, 24, 48, 96, 256, 1024, 2048, 16 * 1024];
    c.bench_function("mixed_batch_64", |b| {
        b.iter(|| {
            let mut live = [std::ptr::null_mut(); 64];
            for (i, slot) in live.iter_mut().enumerate() {
                *slot = heap.allocate(sizes[i % sizes.len()]);
            }
            for p in live {
                unsafe { heap.deallocate(black_box(p)) };
            }
        });
    });
}

criterion_group!(benches, fixed_size_churn, cold_mid_size_churn, mixed_batch);
criterion_main!(benches);
