//! Chunk acquisition and release.
//!
//! A chunk is one region obtained from a [`ChunkAllocator`] in a single
//! request. A chunk of class `e` spans `2^e + HEADER_SIZE` bytes aligned to
//! [`HEADER_ALIGN`]; it enters the table as one free block of class `e` and is
//! returned to the allocator as a whole when its pool is torn down.

use core::{alloc::Layout, ptr::NonNull};

use log::debug;

use crate::{
    class::SizeClass,
    header::{BlockHeader, HEADER_ALIGN, HEADER_SIZE},
    table::{Blocks, SizeClassTable},
};

/// Source of raw chunk memory for a pool.
///
/// # Safety
///
/// Implementations must return either `None` or a pointer to a fresh region
/// that is valid for reads and writes of `layout.size()` bytes, aligned to
/// `layout.align()`, and not in use anywhere else until it is passed back to
/// [`deallocate`](Self::deallocate).
pub unsafe trait ChunkAllocator {
    /// Allocates a region described by `layout`, or returns `None` if the
    /// request cannot be satisfied.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns a region to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// allocator with the same `layout`, and must not have been deallocated
    /// since.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Chunk allocator backed by the process's global allocator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SystemChunks;

unsafe impl ChunkAllocator for SystemChunks {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        // chunk layouts are never zero-sized
        debug_assert!(layout.size() > 0);
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

unsafe impl<A> ChunkAllocator for &A
where
    A: ChunkAllocator + ?Sized,
{
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { (**self).deallocate(ptr, layout) }
    }
}

/// Returns the layout of a chunk of `class`, or `None` if it cannot be
/// represented on this target.
#[must_use]
pub fn chunk_layout(class: SizeClass) -> Option<Layout> {
    let size = class.size().checked_add(HEADER_SIZE)?;
    Layout::from_size_align(size, HEADER_ALIGN).ok()
}

/// Obtains one chunk of `class` and links it into `table` as a free block.
///
/// `layout` must be the [`chunk_layout`] of `class`. Returns `false` if the
/// allocator could not satisfy the request; the table is untouched in that
/// case.
pub(crate) fn acquire_chunk<A>(
    table: &mut SizeClassTable,
    chunks: &A,
    class: SizeClass,
    layout: Layout,
) -> bool
where
    A: ChunkAllocator + ?Sized,
{
    debug_assert_eq!(chunk_layout(class), Some(layout));
    let Some(chunk) = chunks.allocate(layout) else {
        return false;
    };
    unsafe {
        let header = BlockHeader::init(chunk.as_ptr(), None, class);
        table.insert(header);
    }
    true
}

/// Returns every chunk linked in `table` to `chunks` and empties the table.
///
/// Every linked chunk base is released exactly once, with the layout it was
/// acquired with. Blocks that are not chunk bases live inside some chunk and
/// are released along with it.
///
/// Returns the number of chunks released.
///
/// # Safety
///
/// Every chunk linked in `table` must have been obtained from `chunks`, and
/// no pointer into any of them may be used afterwards.
pub(crate) unsafe fn release_all<A>(table: &mut SizeClassTable, chunks: &A) -> usize
where
    A: ChunkAllocator + ?Sized,
{
    // collect first: releasing a chunk invalidates the headers inside it,
    // which may still be linked in later classes
    let mut bases = Vec::new();
    for head in table.take_all() {
        for block in unsafe { Blocks::detached(head) } {
            unsafe {
                if BlockHeader::is_chunk_base(block) {
                    debug_assert_eq!((*block).split_depth, 0, "chunk released while split");
                    bases.push((block, (*block).chunk_class));
                }
            }
        }
    }

    let released = bases.len();
    for (base, class) in bases {
        let Some(layout) = chunk_layout(class) else {
            unreachable!("chunk of class {class} was acquired with a valid layout");
        };
        unsafe {
            chunks.deallocate(NonNull::new_unchecked(base.cast()), layout);
        }
    }
    debug!("released {released} chunk(s)");
    released
}
