//! Per-size object cache in front of a fixed-size heap.
//!
//! Freed objects go onto a LIFO list threaded through the objects
//! themselves. Allocation misses refill the cache with a batch from
//! upstream, doubling the batch target up to a cap; when the cache
//! overflows, one object is flushed, the target halves, and the cache
//! shrinks to it.

use std::ptr::{self, NonNull};

use crate::one_size::SizedHeap;
use crate::partition::PageSource;

/// Upper bound on the cache and its refill target.
pub const MAX_CACHE_SIZE: usize = 32;

struct CachedObject {
    next: *mut CachedObject,
}

/// A caching decorator over any [`SizedHeap`].
pub struct CacheHeap<H> {
    upstream: H,
    cached: *mut CachedObject,
    num_cached: usize,
    target: usize,
}

impl<H: SizedHeap> CacheHeap<H> {
    #[must_use]
    pub fn new(upstream: H) -> Self {
        Self {
            upstream,
            cached: ptr::null_mut(),
            num_cached: 0,
            target: 1,
        }
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let head = NonNull::new(self.cached)?;
        self.cached = unsafe { (*head.as_ptr()).next };
        self.num_cached -= 1;
        Some(head.cast::<u8>())
    }

    unsafe fn push(&mut self, ptr: NonNull<u8>) {
        let obj = ptr.as_ptr().cast::<CachedObject>();
        unsafe { (*obj).next = self.cached };
        self.cached = obj;
        self.num_cached += 1;
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.num_cached
    }
}

impl<H: SizedHeap> SizedHeap for CacheHeap<H> {
    fn allocate(&mut self, size: usize, source: &PageSource) -> Option<NonNull<u8>> {
        if let Some(ptr) = self.pop() {
            return Some(ptr);
        }

        let ptr = self.upstream.allocate(size, source)?;
        if self.target < MAX_CACHE_SIZE {
            self.target <<= 1;
        }
        // Refill the cache with a batch; stop early if upstream runs dry.
        debug_assert_eq!(self.num_cached, 0);
        for _ in 0..self.target {
            let Some(extra) = self.upstream.allocate(size, source) else {
                break;
            };
            unsafe { self.push(extra) };
        }
        Some(ptr)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, tag: u8, source: &PageSource) {
        if self.num_cached < MAX_CACHE_SIZE {
            unsafe { self.push(ptr) };
            return;
        }
        // Cache full: this object goes upstream, and the cache shrinks to a
        // halved target.
        unsafe { self.upstream.release(ptr, tag, source) };
        if self.target > 1 {
            self.target >>= 1;
        }
        while self.num_cached > self.target {
            let victim = self.pop().expect("cache count out of sync");
            let victim_tag = source
                .tag_of(victim.as_ptr())
                .expect("cached object without a partition tag");
            unsafe { self.upstream.release(victim, victim_tag, source) };
        }
    }
}

impl<H: SizedHeap + Default> Default for CacheHeap<H> {
    fn default() -> Self {
        Self::new(H::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::one_size::OneSizeHeap;
    use crate::reap::Workhorse;

    fn source() -> PageSource {
        PageSource::new(8).expect("arena reservation failed")
    }

    #[test]
    fn misses_prefill_the_cache_with_a_doubling_batch() {
        let source = source();
        let mut heap = CacheHeap::new(OneSizeHeap::<Workhorse>::new());
        assert_eq!(heap.target, 1);
        let _a = heap.allocate(48, &source).unwrap();
        // First miss doubles the target to 2 and caches a batch.
        assert_eq!(heap.target, 2);
        assert_eq!(heap.cached(), 2);
        // Cache hits do not touch the target.
        let _b = heap.allocate(48, &source).unwrap();
        let _c = heap.allocate(48, &source).unwrap();
        assert_eq!(heap.cached(), 0);
        assert_eq!(heap.target, 2);
        let _d = heap.allocate(48, &source).unwrap();
        assert_eq!(heap.target, 4);
        assert_eq!(heap.cached(), 4);
    }

    #[test]
    fn frees_stay_in_the_cache_until_it_overflows() {
        let source = source();
        let mut heap = CacheHeap::new(OneSizeHeap::<Workhorse>::new());
        let ptrs: Vec<_> = (0..MAX_CACHE_SIZE + 8)
            .map(|_| heap.allocate(32, &source).unwrap())
            .collect();
        // Drain whatever the refills cached so the counter starts clean.
        while heap.pop().is_some() {}

        let mut tags = Vec::new();
        for p in &ptrs {
            tags.push(source.tag_of(p.as_ptr()).unwrap());
        }
        for (p, tag) in ptrs.iter().zip(&tags).take(MAX_CACHE_SIZE) {
            unsafe { heap.release(*p, *tag, &source) };
        }
        assert_eq!(heap.cached(), MAX_CACHE_SIZE);

        // The overflowing free flushes and halves the target.
        let before = heap.target;
        unsafe { heap.release(ptrs[MAX_CACHE_SIZE], tags[MAX_CACHE_SIZE], &source) };
        assert!(heap.target <= before);
        assert!(heap.cached() <= heap.target);
    }

    #[test]
    fn cache_hits_return_most_recently_freed() {
        let source = source();
        let mut heap = CacheHeap::new(OneSizeHeap::<Workhorse>::new());
        let a = heap.allocate(64, &source).unwrap();
        let b = heap.allocate(64, &source).unwrap();
        let tag_a = source.tag_of(a.as_ptr()).unwrap();
        let tag_b = source.tag_of(b.as_ptr()).unwrap();
        while heap.pop().is_some() {}
        unsafe {
            heap.release(a, tag_a, &source);
            heap.release(b, tag_b, &source);
        }
        assert_eq!(heap.allocate(64, &source).unwrap(), b);
        assert_eq!(heap.allocate(64, &source).unwrap(), a);
    }
}
