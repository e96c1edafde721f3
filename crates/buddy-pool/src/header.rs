//! Block header layout.
//!
//! Every block tracked by a pool starts with a [`BlockHeader`]; the memory
//! handed out to callers begins right after it.
//!
//! ```text
//! Block of class e:
//! ┌──────────────────────────────────┬──────────────────────────────┐
//! │ BlockHeader (HEADER_SIZE bytes)  │ User memory                  │
//! │ prev │ next │ chunk_base │ tags  │ 2^e - HEADER_SIZE bytes      │
//! └──────────────────────────────────┴──────────────────────────────┘
//! ▲                                  ▲
//! └── header pointer                 └── pointer returned to the caller
//! ```
//!
//! A chunk of class `e` spans `2^e + HEADER_SIZE` bytes. The trailing
//! `HEADER_SIZE` bytes are slack that no block ever covers; every block,
//! including the whole chunk, covers exactly `2^class` bytes from its header.

use core::ptr::{self, NonNull};

use crate::class::SizeClass;

/// Size of the header placed in front of every block.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Alignment of every block header, and therefore of every pointer returned
/// by a pool.
pub const HEADER_ALIGN: usize = align_of::<BlockHeader>();

const _: () = assert!(HEADER_SIZE % HEADER_ALIGN == 0);

/// Occupancy of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display, derive_more::IsVariant)]
#[repr(u8)]
pub enum BlockState {
    /// The block can be handed out.
    #[display("free")]
    Free,
    /// The block has been handed out.
    #[display("occupied")]
    Occupied,
}

/// Metadata stored in front of every block.
///
/// Blocks of the same class form a circular doubly-linked list through
/// `prev` and `next`. The links are non-owning: all memory belongs to the
/// chunk the block was carved from.
#[repr(C, align(16))]
#[derive(Debug)]
pub(crate) struct BlockHeader {
    pub(crate) prev: *mut Self,
    pub(crate) next: *mut Self,
    /// Header of the chunk this block was carved from. A chunk base points at
    /// itself.
    pub(crate) chunk_base: *mut Self,
    /// Number of split levels currently open inside the chunk. Only
    /// meaningful on a chunk base.
    pub(crate) split_depth: u32,
    pub(crate) state: BlockState,
    pub(crate) class: SizeClass,
    /// Class the chunk was acquired with. Only meaningful on a chunk base.
    pub(crate) chunk_class: SizeClass,
}

impl BlockHeader {
    /// Writes a fresh free header at `at` and returns it.
    ///
    /// The header is a singleton list (`prev == next == self`) with a split
    /// depth of zero. If `chunk_base` is `None`, the header becomes the base
    /// of a new chunk of class `class`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `at` is aligned to [`HEADER_ALIGN`]
    /// - `at..at + 2^class` is valid for writes and not covered by any other
    ///   live header
    /// - `chunk_base`, if given, points to a live chunk base enclosing `at`
    pub(crate) unsafe fn init(
        at: *mut u8,
        chunk_base: Option<*mut Self>,
        class: SizeClass,
    ) -> *mut Self {
        #[expect(clippy::cast_ptr_alignment)]
        let header = at.cast::<Self>();
        assert!(!header.is_null(), "Header pointer must not be null");
        assert!(header.is_aligned(), "Header pointer must be properly aligned");

        let chunk_base = chunk_base.unwrap_or(header);
        unsafe {
            header.write(Self {
                prev: header,
                next: header,
                chunk_base,
                state: BlockState::Free,
                class,
                split_depth: 0,
                chunk_class: class,
            });
        }
        header
    }

    /// Returns the caller-visible pointer of `header`.
    ///
    /// # Safety
    ///
    /// `header` must point to a live header.
    pub(crate) unsafe fn user_ptr(header: *mut Self) -> NonNull<u8> {
        let ptr = header.cast::<u8>().map_addr(|addr| addr + HEADER_SIZE);
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Recovers the header from a caller-visible pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must have been produced by [`BlockHeader::user_ptr`].
    pub(crate) unsafe fn from_user_ptr(ptr: NonNull<u8>) -> *mut Self {
        #[expect(clippy::cast_ptr_alignment)]
        let header = ptr
            .as_ptr()
            .map_addr(|addr| addr - HEADER_SIZE)
            .cast::<Self>();
        debug_assert!(header.is_aligned());
        header
    }

    /// Returns `true` if `header` is the base of its chunk.
    ///
    /// # Safety
    ///
    /// `header` must point to a live header.
    pub(crate) unsafe fn is_chunk_base(header: *mut Self) -> bool {
        unsafe { ptr::eq((*header).chunk_base, header) }
    }

    /// Returns the split depth of the chunk `header` belongs to.
    ///
    /// # Safety
    ///
    /// `header` must point to a live header.
    pub(crate) unsafe fn chunk_split_depth(header: *mut Self) -> u32 {
        unsafe { (*(*header).chunk_base).split_depth }
    }

    /// Returns the buddy of `header`, or `None` if its chunk is whole.
    ///
    /// The returned header is the start of the buddy region. It has the same
    /// class as `header` unless the buddy region is currently split further.
    ///
    /// # Safety
    ///
    /// `header` must point to a live header whose chunk base is live.
    pub(crate) unsafe fn buddy(header: *mut Self) -> Option<*mut Self> {
        unsafe {
            if Self::chunk_split_depth(header) == 0 {
                return None;
            }
            let base = (*header).chunk_base;
            let offset = header.addr() - base.addr();
            let buddy_offset = buddy_offset(offset, (*header).class);
            Some(base.map_addr(|addr| addr + buddy_offset))
        }
    }
}

/// Returns the chunk offset of the buddy of the block at `offset`.
///
/// A block whose offset is a multiple of `2^(class + 1)` is the low half of
/// its parent and its buddy follows it; otherwise it is the high half and its
/// buddy precedes it. For offsets that are multiples of `2^class` this is the
/// same as testing bit `class` of the offset.
pub(crate) fn buddy_offset(offset: usize, class: SizeClass) -> usize {
    let size = class.size();
    debug_assert!(offset.is_multiple_of(size));
    if offset & size == 0 {
        offset + size
    } else {
        offset - size
    }
}
