//! A segregated-fit power-of-two buddy memory pool.
//!
//! A [`Pool`] obtains large chunks from a [`ChunkAllocator`], carves them into
//! power-of-two blocks and serves requests of any size from the smallest
//! block that fits. Freed blocks merge back with their buddy.
//!
//! # Layout
//!
//! Every block starts with a [`HEADER_SIZE`]-byte header, followed by the
//! memory handed to the caller. A block of class `e` spans `2^e` bytes
//! including its header:
//!
//! ```text
//! chunk of class 8, after allocate(20):
//!
//! 0         64        128                 256      +HEADER_SIZE
//! ┌─────────┬─────────┬───────────────────┬────────┐
//! │ class 6 │ class 6 │      class 7      │ slack  │
//! │ occupied│ free    │      free         │        │
//! └─────────┴─────────┴───────────────────┴────────┘
//! ▲ chunk base, split depth 2
//! ```
//!
//! The table keeps one circular list per class holding both free and
//! occupied blocks, plus a counter of free bytes per class.
//!
//! # Allocation
//!
//! A request of `n` bytes is rounded up to the class `e` with
//! `2^e >= n + HEADER_SIZE`. The pool takes a free block of the first class
//! at or above `e` that has one. A larger block is divided: the pieces it
//! sheds, one per class between `e` and its own class, stay free in their
//! lists. If no class has a free block, the pool acquires
//! [`PoolBuilder::growth_chunks`] chunks of class `e` and retries.
//!
//! # Deallocation
//!
//! A freed block merges with its buddy if the buddy is free and of the same
//! class. Only one level is merged per call; chunks are fully reassembled and
//! returned to the chunk allocator when the pool is dropped.
//!
//! # Usage
//!
//! ```rust
//! use buddy_pool::{Pool, SizeClass};
//!
//! let pool = Pool::with_seed(8, 2)?;
//! let a = pool.allocate(20)?;
//! let b = pool.allocate(100)?;
//!
//! let snapshot = pool.snapshot();
//! assert!(snapshot.check_invariants().is_ok());
//! assert_eq!(snapshot.free_bytes(SizeClass::new(7).unwrap()), 128);
//!
//! unsafe {
//!     pool.deallocate(a);
//!     pool.deallocate(b);
//! }
//! # Ok::<(), buddy_pool::PoolError>(())
//! ```
//!
//! # Thread Safety
//!
//! Each pool guards its table with one reentrant lock, so `Pool` is `Sync`
//! whenever its chunk allocator is. The low-memory handler runs with that
//! lock held and may call back into the pool on the same thread.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub use self::{
    adapter::PoolAllocator,
    chunk::{ChunkAllocator, SystemChunks, chunk_layout},
    class::{CLASS_COUNT, MIN_SERVING_CLASS, SizeClass},
    counter::live_pool_count,
    dump::{BlockInfo, ClassSnapshot, InvariantViolation, TableSnapshot},
    error::{Location, PoolError},
    header::{BlockState, HEADER_ALIGN, HEADER_SIZE},
    pool::{DEFAULT_GROWTH_CHUNKS, LowMemoryHandler, Pool, PoolBuilder},
};

mod adapter;
mod chunk;
mod class;
mod counter;
mod dump;
mod error;
mod header;
mod pool;
mod table;
