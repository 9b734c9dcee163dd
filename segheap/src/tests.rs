//! End-to-end allocator scenarios over the mock provider.
//!
//! These drive the public surface only (plus the internal invariant
//! walker) and pin down the observable contract: placement of first
//! allocations, split/coalesce behavior, in-place reallocation, aligned
//! allocation, and full-drain accounting.

use crate::heap::Heap;
use crate::layout::PAGE_SIZE;
use crate::sys::mock::MockSource;
use crate::ThreadCache;

/// 64 MiB regions keep the mock's up-front reservation modest.
const TEST_CAP: usize = 64 << 20;

fn test_heap() -> Heap<MockSource> {
    Heap::with_max_size(MockSource, TEST_CAP)
}

fn check(heap: &Heap<MockSource>) {
    heap.with_core(|core| core.check_invariants());
}

fn base_of(heap: &Heap<MockSource>) -> usize {
    heap.with_core(|core| core.region_base() as usize).unwrap()
}

#[test]
fn s1_first_small_allocation_at_region_start() {
    let heap = test_heap();
    let p = heap.malloc(24);
    assert!(!p.is_null());
    assert_eq!(p as usize, base_of(&heap), "first slice starts the region");

    let usable = heap.usable_size(p);
    assert!((24..=32).contains(&usable));
    assert_eq!(usable, 32);

    check(&heap);
    heap.free(p);
    check(&heap);

    let stats = heap.stats();
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.small_slabs, 0);
    assert_eq!(stats.free_pages, stats.heap_pages);
}

#[test]
fn small_slices_pack_contiguously() {
    let heap = test_heap();
    let p1 = heap.malloc(24) as usize;
    let p2 = heap.malloc(24) as usize;
    let p3 = heap.malloc(24) as usize;
    // Same class 32 slab, consecutive slices.
    assert_eq!(p2, p1 + 32);
    assert_eq!(p3, p2 + 32);
    check(&heap);
}

#[test]
fn s2_split_then_coalesce_releases_blocked_slab() {
    let heap = test_heap();
    let a = heap.malloc(1024);
    let b = heap.malloc(1024);
    let c = heap.malloc(1024);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());

    // One single-page blocked slab, carved front to back.
    assert_eq!(b as usize, a as usize + 1040);
    assert_eq!(c as usize, b as usize + 1040);
    assert_eq!(heap.stats().blocked_slabs, 1);

    heap.free(b);
    check(&heap);
    heap.free(a);
    check(&heap);
    heap.free(c);
    check(&heap);

    let stats = heap.stats();
    assert_eq!(stats.blocked_slabs, 0);
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.free_pages, stats.heap_pages);

    // The freed run is reused for the next same-shaped request.
    let again = heap.malloc(1024);
    assert_eq!(again, a);
}

#[test]
fn s3_realloc_grows_in_place_into_free_neighbor() {
    let heap = test_heap();
    let p = heap.malloc(200);
    assert!(!p.is_null());
    // Nothing was allocated after `p`, so the rest of the slab is one free
    // block right behind it.
    let q = heap.realloc(p, 300);
    assert_eq!(q, p);
    assert_eq!(heap.usable_size(q), 312);
    check(&heap);
    heap.free(q);
}

#[test]
fn s4_realloc_moves_when_pinned_and_preserves_contents() {
    let heap = test_heap();
    let p = heap.malloc(200);
    assert!(!p.is_null());
    for i in 0..200 {
        unsafe { *p.add(i) = (i % 251) as u8 };
    }
    // Pin the free space behind `p`.
    let pin = heap.malloc(200);
    assert_eq!(pin as usize, p as usize + 208);

    let q = heap.realloc(p, 5000);
    assert!(!q.is_null());
    assert_ne!(q, p);
    for i in 0..200 {
        assert_eq!(unsafe { *q.add(i) }, (i % 251) as u8);
    }
    check(&heap);
    heap.free(pin);
    heap.free(q);
    check(&heap);
}

#[test]
fn s5_huge_request_gets_page_aligned_single_alloc() {
    let heap = test_heap();
    let p = heap.malloc(200_000);
    assert!(!p.is_null());
    assert_eq!(p as usize % PAGE_SIZE, 0);
    assert_eq!(heap.usable_size(p), 49 * PAGE_SIZE);
    assert_eq!(heap.stats().single_alloc_slabs, 1);

    heap.free(p);
    let stats = heap.stats();
    assert_eq!(stats.single_alloc_slabs, 0);
    assert_eq!(stats.free_pages, stats.heap_pages);

    // The released run is eligible for the next same-sized request.
    let again = heap.malloc(200_000);
    assert_eq!(again, p);
    heap.free(again);
}

#[test]
fn s6_aligned_alloc_alignments() {
    let heap = test_heap();

    let p = heap.aligned_alloc(4096, 128);
    assert!(!p.is_null());
    assert_eq!(p as usize % 4096, 0);
    assert!(heap.usable_size(p) >= 128);

    // Small size, small alignment: promoted size class.
    let q = heap.aligned_alloc(64, 100);
    assert!(!q.is_null());
    assert_eq!(q as usize % 64, 0);
    assert_eq!(heap.usable_size(q), 128);

    // Coarser than a page: carved run.
    let r = heap.aligned_alloc(2 * PAGE_SIZE, 100);
    assert!(!r.is_null());
    assert_eq!(r as usize % (2 * PAGE_SIZE), 0);

    // Sub-page alignment on a large size rides page alignment.
    let s = heap.aligned_alloc(32, 5000);
    assert!(!s.is_null());
    assert_eq!(s as usize % 32, 0);

    check(&heap);
    heap.free(p);
    heap.free(q);
    heap.free(r);
    heap.free(s);
    check(&heap);

    // Invalid alignment and zero size fail.
    assert!(heap.aligned_alloc(3, 10).is_null());
    assert!(heap.aligned_alloc(32, 0).is_null());
}

#[test]
fn s7_calloc_zero_fills() {
    let heap = test_heap();
    let p = heap.calloc(100, 8);
    assert!(!p.is_null());
    for i in 0..800 {
        assert_eq!(unsafe { *p.add(i) }, 0, "byte {} not zeroed", i);
    }
    heap.free(p);

    // Multiplication overflow is a clean failure.
    assert!(heap.calloc(usize::MAX, 2).is_null());
}

#[test]
fn empty_edges() {
    let heap = test_heap();
    assert!(heap.malloc(0).is_null());
    heap.free(core::ptr::null_mut()); // no-op

    // realloc(null, n) == malloc(n)
    let p = heap.realloc(core::ptr::null_mut(), 64);
    assert!(!p.is_null());

    // realloc(p, 0) frees and returns null.
    assert!(heap.realloc(p, 0).is_null());
    assert_eq!(heap.stats().allocated_bytes, 0);

    assert_eq!(heap.usable_size(core::ptr::null_mut()), 0);
}

#[test]
fn default_alignment_guarantees() {
    let heap = test_heap();
    let mut ptrs = std::vec::Vec::new();
    for size in 1..=200usize {
        let p = heap.malloc(size);
        assert!(!p.is_null());
        if size <= 8 {
            assert_eq!(p as usize % 8, 0, "size {}", size);
        } else {
            assert_eq!(p as usize % 16, 0, "size {}", size);
        }
        ptrs.push(p);
    }
    for p in ptrs {
        heap.free(p);
    }
    check(&heap);
}

#[test]
fn small_realloc_same_class_keeps_pointer() {
    let heap = test_heap();
    let p = heap.malloc(50); // class 64
    let q = heap.realloc(p, 64); // still class 64
    assert_eq!(q, p);

    // Crossing into another class moves the slice and copies the payload.
    for i in 0..50 {
        unsafe { *q.add(i) = 0xA5 };
    }
    let r = heap.realloc(q, 100); // class 112
    assert_ne!(r, q);
    for i in 0..50 {
        assert_eq!(unsafe { *r.add(i) }, 0xA5);
    }
    heap.free(r);
    check(&heap);
}

#[test]
fn realloc_migrates_across_paths() {
    let heap = test_heap();

    // Small -> large.
    let p = heap.malloc(100);
    for i in 0..100 {
        unsafe { *p.add(i) = (i % 97) as u8 };
    }
    let q = heap.realloc(p, 600);
    assert!(!q.is_null());
    for i in 0..100 {
        assert_eq!(unsafe { *q.add(i) }, (i % 97) as u8);
    }

    // Large -> small.
    let r = heap.realloc(q, 40);
    assert!(!r.is_null());
    for i in 0..40 {
        assert_eq!(unsafe { *r.add(i) }, (i % 97) as u8);
    }

    // Large -> large with a move (single-alloc to blocked).
    let s = heap.realloc(r, 20_000);
    assert!(!s.is_null());
    for i in 0..40 {
        assert_eq!(unsafe { *s.add(i) }, (i % 97) as u8);
    }
    let t = heap.realloc(s, 300);
    assert!(!t.is_null());
    for i in 0..40 {
        assert_eq!(unsafe { *t.add(i) }, (i % 97) as u8);
    }

    heap.free(t);
    check(&heap);
    assert_eq!(heap.stats().allocated_bytes, 0);
}

#[test]
fn single_alloc_realloc_shrinks_in_place() {
    let heap = test_heap();
    let p = heap.malloc(16 * PAGE_SIZE); // 16-page single-alloc
    assert!(!p.is_null());
    let q = heap.realloc(p, 9 * PAGE_SIZE);
    assert_eq!(q, p, "shrink should stay in place");
    assert_eq!(heap.usable_size(q), 9 * PAGE_SIZE);
    check(&heap);

    // Growing back reuses the tail we just freed.
    let r = heap.realloc(q, 16 * PAGE_SIZE);
    assert_eq!(r, p, "grow into the adjacent free run stays in place");
    check(&heap);
    heap.free(r);
}

#[test]
fn single_alloc_realloc_extends_the_region() {
    let heap = test_heap();
    let p = heap.malloc(16 * PAGE_SIZE);
    assert!(!p.is_null());

    // The slab is the last thing in the region, so growth maps new pages
    // instead of moving the allocation.
    let q = heap.realloc(p, 32 * PAGE_SIZE);
    assert_eq!(q, p, "grow at the region end stays in place");
    assert_eq!(heap.usable_size(q), 32 * PAGE_SIZE);
    check(&heap);

    // A trailing free run smaller than the growth is absorbed and the
    // region extended for the rest.
    let r = heap.realloc(q, 9 * PAGE_SIZE);
    assert_eq!(r, p);
    let s = heap.realloc(r, 48 * PAGE_SIZE);
    assert_eq!(s, p, "absorb the trailing run, extend for the difference");
    assert_eq!(heap.usable_size(s), 48 * PAGE_SIZE);
    check(&heap);
    heap.free(s);

    let stats = heap.stats();
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.free_pages, stats.heap_pages);
}

#[test]
fn allocations_do_not_overlap() {
    let heap = test_heap();
    let sizes = [1usize, 8, 24, 64, 128, 129, 512, 2000, 8192, 9000, 20000];
    let mut live: std::vec::Vec<(*mut u8, usize, u8)> = std::vec::Vec::new();

    for round in 0..4u8 {
        for (i, &size) in sizes.iter().enumerate() {
            let p = heap.malloc(size);
            assert!(!p.is_null());
            let tag = round.wrapping_mul(31).wrapping_add(i as u8);
            unsafe { core::ptr::write_bytes(p, tag, size) };
            live.push((p, size, tag));
        }
        // Free every third allocation to churn the freelists.
        let mut idx = 0;
        live.retain(|&(p, _, _)| {
            idx += 1;
            if idx % 3 == 0 {
                heap.free(p);
                false
            } else {
                true
            }
        });
        check(&heap);
    }

    // Every surviving allocation still holds its own tag.
    for &(p, size, tag) in &live {
        for off in 0..size {
            assert_eq!(unsafe { *p.add(off) }, tag);
        }
    }
    for (p, _, _) in live {
        heap.free(p);
    }

    check(&heap);
    let stats = heap.stats();
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.small_slabs + stats.blocked_slabs + stats.single_alloc_slabs, 0);
    assert_eq!(stats.free_pages, stats.heap_pages);
}

#[test]
fn freed_memory_is_reused() {
    let heap = test_heap();
    let p = heap.malloc(32);
    heap.free(p);
    assert_eq!(heap.malloc(32), p, "small slice reuse is LIFO");

    let q = heap.malloc(4000);
    heap.free(q);
    assert_eq!(heap.malloc(4000), q, "blocked space is reused");
}

#[test]
fn oom_returns_null_and_rolls_back() {
    // 16-page region: big requests must fail cleanly.
    let heap = Heap::with_max_size(MockSource, 16 * PAGE_SIZE);
    assert!(heap.malloc(1 << 20).is_null());

    // The failure left the heap fully usable.
    let p = heap.malloc(100);
    assert!(!p.is_null());
    check(&heap);

    // Exhaust the region, then drain it.
    let mut live = std::vec::Vec::new();
    loop {
        let q = heap.malloc(2 * PAGE_SIZE);
        if q.is_null() {
            break;
        }
        live.push(q);
    }
    assert!(!live.is_empty());
    check(&heap);
    for q in live {
        heap.free(q);
    }
    heap.free(p);
    check(&heap);
    let stats = heap.stats();
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.free_pages, stats.heap_pages);
}

#[test]
fn free_sized_hints_accepted() {
    let heap = test_heap();
    let p = heap.malloc(96);
    heap.free_sized(p, 96);
    let q = heap.aligned_alloc(4096, 100);
    heap.free_aligned_sized(q, 4096, 100);
    assert_eq!(heap.stats().allocated_bytes, 0);
}

#[test]
fn thread_cache_round_trip() {
    let heap = test_heap();
    let mut cache = ThreadCache::new(&heap);

    let p = cache.malloc(64);
    assert!(!p.is_null());
    cache.free(p);
    assert_eq!(cache.cached(), 1);

    // The parked slice satisfies the next same-class request locally.
    let q = cache.malloc(64);
    assert_eq!(q, p);
    assert_eq!(cache.cached(), 0);

    // Large allocations bypass the cache entirely.
    let big = cache.malloc(4096);
    cache.free(big);
    assert_eq!(cache.cached(), 0);

    cache.free(q);
    drop(cache);
    // Dropping flushed the parked slice back to its slab.
    assert_eq!(heap.stats().allocated_bytes, 0);
}

#[test]
fn thread_cache_flushes_at_threshold() {
    let heap = test_heap();
    let mut cache = ThreadCache::new(&heap);

    let mut ptrs = std::vec::Vec::new();
    for _ in 0..crate::FLUSH_THRESHOLD {
        ptrs.push(cache.malloc(16));
    }
    for p in ptrs {
        cache.free(p);
    }
    // Crossing the threshold flushed everything back.
    assert_eq!(cache.cached(), 0);
    assert_eq!(heap.stats().allocated_bytes, 0);
}

#[test]
fn concurrent_malloc_free() {
    let heap = test_heap();
    let sizes = [8usize, 40, 128, 300, 1500, 9000];

    std::thread::scope(|scope| {
        for t in 0..4usize {
            let heap = &heap;
            scope.spawn(move || {
                let mut live = std::vec::Vec::new();
                for i in 0..400usize {
                    let size = sizes[(i * 7 + t) % sizes.len()];
                    let p = heap.malloc(size);
                    assert!(!p.is_null());
                    unsafe { core::ptr::write_bytes(p, t as u8, size) };
                    live.push((p, size));
                    if live.len() > 16 {
                        let (q, qsize) = live.swap_remove(i % live.len());
                        for off in (0..qsize).step_by(qsize.max(64) / 16) {
                            assert_eq!(unsafe { *q.add(off) }, t as u8);
                        }
                        heap.free(q);
                    }
                }
                for (p, _) in live {
                    heap.free(p);
                }
            });
        }
    });

    check(&heap);
    let stats = heap.stats();
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.free_pages, stats.heap_pages);
}

#[test]
fn usable_size_reports_rounded_sizes() {
    let heap = test_heap();
    let small = heap.malloc(24);
    assert_eq!(heap.usable_size(small), 32);
    let block = heap.malloc(1024);
    assert_eq!(heap.usable_size(block), 1032);
    let single = heap.malloc(200_000);
    assert_eq!(heap.usable_size(single), 49 * PAGE_SIZE);
    heap.free(small);
    heap.free(block);
    heap.free(single);
}
