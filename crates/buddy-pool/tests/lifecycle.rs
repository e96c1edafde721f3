#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use core::{
    alloc::Layout,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};
use std::{collections::HashMap, sync::OnceLock};

use buddy_pool::{
    ChunkAllocator, HEADER_ALIGN, HEADER_SIZE, Pool, PoolError, SizeClass, SystemChunks, chunk_layout,
};
use parking_lot::Mutex;
use proptest::{collection::vec, prelude::*};

/// Chunk allocator that records every chunk it hands out and refuses to
/// hand out more than `limit` in total.
#[derive(Debug)]
struct CountingChunks {
    acquired: AtomicUsize,
    released: AtomicUsize,
    limit: AtomicUsize,
    live: Mutex<HashMap<usize, Layout>>,
}

impl CountingChunks {
    fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    fn with_limit(limit: usize) -> Self {
        Self {
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit),
            live: Mutex::new(HashMap::new()),
        }
    }

    fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Relaxed)
    }

    fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    fn live_layouts(&self) -> Vec<Layout> {
        self.live.lock().values().copied().collect()
    }
}

unsafe impl ChunkAllocator for CountingChunks {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if self.acquired() >= self.limit.load(Ordering::Relaxed) {
            return None;
        }
        let ptr = SystemChunks.allocate(layout)?;
        self.acquired.fetch_add(1, Ordering::Relaxed);
        self.live.lock().insert(ptr.as_ptr().addr(), layout);
        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        let recorded = self.live.lock().remove(&ptr.as_ptr().addr());
        assert_eq!(recorded, Some(layout), "chunk released twice or with another layout");
        self.released.fetch_add(1, Ordering::Relaxed);
        unsafe { SystemChunks.deallocate(ptr, layout) }
    }
}

fn class(exp: u8) -> SizeClass {
    SizeClass::new(exp).unwrap()
}

#[test]
fn exhaustion_acquires_growth_chunks_at_the_request_class() {
    let chunks = CountingChunks::new();
    let pool = Pool::with_allocator(&chunks);
    assert!(pool.reserve(6, 1).unwrap());
    assert_eq!(chunks.acquired(), 1);

    let _first = pool.allocate(20).unwrap();
    assert_eq!(chunks.acquired(), 1);

    // one acquisition round of two chunks, both of class 6
    let _second = pool.allocate(20).unwrap();
    assert_eq!(chunks.acquired(), 3);
    let layout = chunk_layout(class(6)).unwrap();
    assert!(chunks.live_layouts().iter().all(|&l| l == layout));
    assert_eq!(pool.free_bytes(class(6)), 64);

    let _third = pool.allocate(20).unwrap();
    assert_eq!(chunks.acquired(), 3);
    let _fourth = pool.allocate(20).unwrap();
    assert_eq!(chunks.acquired(), 5);
}

#[test]
fn larger_free_blocks_are_split_instead_of_growing() {
    let chunks = CountingChunks::new();
    let pool = Pool::builder()
        .chunk_allocator(&chunks)
        .seed(12, 1)
        .build()
        .unwrap();
    for _ in 0..8 {
        pool.allocate(200).unwrap();
    }
    assert_eq!(chunks.acquired(), 1);
}

#[test]
fn growth_chunk_count_is_configurable() {
    let chunks = CountingChunks::new();
    let pool = Pool::builder()
        .chunk_allocator(&chunks)
        .growth_chunks(0)
        .build()
        .unwrap();
    assert_eq!(pool.growth_chunks(), 1);
    pool.allocate(900).unwrap();
    assert_eq!(chunks.acquired(), 1);
    assert_eq!(
        chunks.live_layouts(),
        [Layout::from_size_align(1024 + HEADER_SIZE, HEADER_ALIGN).unwrap()]
    );
}

#[test]
fn teardown_releases_every_chunk_once() {
    let chunks = CountingChunks::new();
    {
        let pool = Pool::with_allocator(&chunks);
        pool.reserve(10, 2).unwrap();
        let ptrs = [10, 500, 90, 3000, 20, 20, 20, 200, 5000]
            .map(|size| pool.allocate(size).unwrap());
        // free every other block and leave the rest outstanding
        for &ptr in ptrs.iter().step_by(2) {
            unsafe { pool.deallocate(ptr) };
        }
        assert!(chunks.acquired() > 2);
        pool.snapshot().check_invariants().unwrap();
    }
    assert_eq!(chunks.released(), chunks.acquired());
    assert!(chunks.live_layouts().is_empty());
}

#[test]
fn chunk_carved_into_many_blocks_is_released_whole() {
    let chunks = CountingChunks::new();
    {
        let pool = Pool::builder()
            .chunk_allocator(&chunks)
            .seed(14, 1)
            .build()
            .unwrap();
        // 256 blocks of class 6 fill the class-14 chunk exactly
        let ptrs = (0..256).map(|_| pool.allocate(20).unwrap()).collect::<Vec<_>>();
        assert_eq!(chunks.acquired(), 1);

        let snapshot = pool.snapshot();
        snapshot.check_invariants().unwrap();
        assert_eq!(snapshot.chunk_bases()[0].split_depth, 255);
        assert_eq!(snapshot.block_count(class(6)), 256);

        for ptr in ptrs {
            unsafe { pool.deallocate(ptr) };
            pool.snapshot().check_invariants().unwrap();
        }
        assert_eq!(pool.snapshot().total_free_bytes(), class(14).size());
    }
    assert_eq!(chunks.released(), 1);
    assert!(chunks.live_layouts().is_empty());
}

#[test]
fn failed_seeding_keeps_and_releases_obtained_chunks() {
    let chunks = CountingChunks::with_limit(1);
    {
        let pool = Pool::with_allocator(&chunks);
        let err = pool.reserve(7, 3).unwrap_err();
        assert!(matches!(
            err,
            PoolError::OutOfMemory { count: 3, .. }
        ));
        assert!(err.to_string().contains("class 7"));
        assert_eq!(pool.snapshot().block_count(class(7)), 1);
        assert_eq!(pool.seed(), None);
    }
    assert_eq!(chunks.acquired(), 1);
    assert_eq!(chunks.released(), 1);

    let chunks = CountingChunks::with_limit(0);
    let err = Pool::builder()
        .chunk_allocator(&chunks)
        .seed(8, 1)
        .build()
        .unwrap_err();
    assert!(err.is_out_of_memory());
    assert_eq!(chunks.released(), 0);
}

#[test]
fn low_memory_handler_can_reenter_the_pool() {
    static POOL: OnceLock<Pool<&'static CountingChunks>> = OnceLock::new();
    static CACHED: AtomicPtr<u8> = AtomicPtr::new(ptr::null_mut());
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    let chunks: &'static CountingChunks = Box::leak(Box::new(CountingChunks::with_limit(1)));
    let pool = POOL.get_or_init(|| {
        Pool::builder()
            .chunk_allocator(chunks)
            .growth_chunks(1)
            .low_memory_handler(move || {
                CALLS.fetch_add(1, Ordering::Relaxed);
                let pool = POOL.get().unwrap();
                if let Some(cached) = NonNull::new(CACHED.swap(ptr::null_mut(), Ordering::Relaxed)) {
                    unsafe { pool.deallocate(cached) };
                }
                chunks.set_limit(usize::MAX);
            })
            .build()
            .unwrap()
    });

    assert!(pool.reserve(6, 1).unwrap());
    let cached = pool.allocate(20).unwrap();
    CACHED.store(cached.as_ptr(), Ordering::Relaxed);

    let ptr = pool.allocate(20).unwrap();
    assert_eq!(CALLS.load(Ordering::Relaxed), 1);
    assert_eq!(chunks.acquired(), 2);
    assert!(CACHED.load(Ordering::Relaxed).is_null());

    let snapshot = pool.snapshot();
    snapshot.check_invariants().unwrap();
    assert_eq!(snapshot.chunk_bases().len(), 2);
    assert_eq!(snapshot.class(class(6)).unwrap().free_count(), 1);
    unsafe { pool.deallocate(ptr) };
}

#[test]
fn allocating_from_the_low_memory_handler_does_not_nest_it() {
    static POOL: OnceLock<Pool<&'static CountingChunks>> = OnceLock::new();
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    static NESTED_FAILURES: AtomicUsize = AtomicUsize::new(0);

    let chunks: &'static CountingChunks = Box::leak(Box::new(CountingChunks::with_limit(0)));
    let pool = POOL.get_or_init(|| {
        Pool::builder()
            .chunk_allocator(chunks)
            .low_memory_handler(|| {
                CALLS.fetch_add(1, Ordering::Relaxed);
                let pool = POOL.get().unwrap();
                if pool.allocate(20).is_err_and(|err| err.is_out_of_memory()) {
                    NESTED_FAILURES.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build()
            .unwrap()
    });

    assert!(pool.allocate(20).unwrap_err().is_out_of_memory());
    assert_eq!(CALLS.load(Ordering::Relaxed), 1);
    assert_eq!(NESTED_FAILURES.load(Ordering::Relaxed), 1);

    // the next failing request gets the handler again
    assert!(pool.allocate(20).unwrap_err().is_out_of_memory());
    assert_eq!(CALLS.load(Ordering::Relaxed), 2);
    assert_eq!(NESTED_FAILURES.load(Ordering::Relaxed), 2);
    assert!(pool.is_empty());
}

#[test]
fn pools_are_shared_between_threads() {
    let chunks = CountingChunks::new();
    {
        let pool = Pool::builder()
            .chunk_allocator(&chunks)
            .seed(16, 1)
            .build()
            .unwrap();
        std::thread::scope(|s| {
            for t in 0..4 {
                let pool = &pool;
                s.spawn(move || {
                    for i in 0..200 {
                        let size = 1 + (t * 37 + i * 13) % 900;
                        let ptr = pool.allocate(size).unwrap();
                        unsafe {
                            ptr.as_ptr().write_bytes(0xcc, size);
                            pool.deallocate(ptr);
                        }
                    }
                });
            }
        });
        pool.snapshot().check_invariants().unwrap();
    }
    assert_eq!(chunks.released(), chunks.acquired());
}

#[derive(Debug, Clone)]
enum Op {
    Allocate(usize),
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0_usize..3000).prop_map(Op::Allocate),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

proptest! {
    #[test]
    fn random_traces_keep_invariants_and_release_all(
        seed in (5_u8..12, 0_usize..3),
        ops in vec(op(), 1..80),
    ) {
        let chunks = CountingChunks::new();
        {
            let pool = Pool::with_allocator(&chunks);
            pool.reserve(seed.0, seed.1).unwrap();
            let mut live = Vec::new();
            for op in ops {
                match op {
                    Op::Allocate(size) => live.push(pool.allocate(size).unwrap()),
                    Op::Free(index) if !live.is_empty() => {
                        let ptr = live.swap_remove(index % live.len());
                        unsafe { pool.deallocate(ptr) };
                    }
                    Op::Free(_) => {}
                }
                prop_assert_eq!(pool.snapshot().check_invariants(), Ok(()));
            }
        }
        prop_assert_eq!(chunks.released(), chunks.acquired());
        prop_assert!(chunks.live_layouts().is_empty());
    }
}
