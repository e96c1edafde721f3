//! The memory pool and its allocation engine.
//!
//! A [`Pool`] owns one [`SizeClassTable`] behind a reentrant lock. Requests
//! are rounded up to a size class, served from the smallest class that has a
//! free block, and split down when that class is larger than needed. Freed
//! blocks merge with their buddy at most one level per call; whole chunks are
//! only reassembled when the pool is torn down.

use core::{alloc::Layout, cell::RefCell, fmt, ptr::NonNull};

use log::{debug, trace, warn};
use parking_lot::ReentrantMutex;
use snafu::{OptionExt as _, ensure};

use crate::{
    chunk::{self, ChunkAllocator, SystemChunks, chunk_layout},
    class::SizeClass,
    counter::LivePool,
    dump::{BlockInfo, TableSnapshot},
    error::{InvalidClassSnafu, OutOfMemorySnafu, PoolError, RequestTooLargeSnafu},
    header::{BlockHeader, BlockState, HEADER_SIZE},
    table::SizeClassTable,
};

/// Number of chunks acquired when a request finds no free block.
pub const DEFAULT_GROWTH_CHUNKS: usize = 2;

/// Callback invoked when the chunk allocator fails to provide a chunk.
///
/// The handler runs with the pool lock held by the calling thread, and may
/// call back into the same pool, for example to deallocate cached blocks. A
/// chunk request that fails while the handler is running returns
/// [`PoolError::OutOfMemory`] without invoking the handler again.
pub type LowMemoryHandler = Box<dyn Fn() + Send + Sync>;

struct PoolState {
    table: SizeClassTable,
    seed: Option<(SizeClass, usize)>,
    in_handler: bool,
}

/// A segregated-fit buddy memory pool.
///
/// All operations take the pool's lock, so a pool can be shared between
/// threads when its chunk allocator can.
///
/// # Examples
///
/// ```
/// use buddy_pool::Pool;
///
/// let pool = Pool::with_seed(10, 2)?;
/// let ptr = pool.allocate(100)?;
/// unsafe {
///     ptr.as_ptr().write_bytes(0xa5, 100);
///     pool.deallocate(ptr);
/// }
/// # Ok::<(), buddy_pool::PoolError>(())
/// ```
pub struct Pool<A = SystemChunks>
where
    A: ChunkAllocator,
{
    state: ReentrantMutex<RefCell<PoolState>>,
    chunks: A,
    growth_chunks: usize,
    low_memory_handler: Option<LowMemoryHandler>,
    _live: LivePool,
}

impl Pool {
    /// Creates an empty pool backed by the global allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::with_allocator(SystemChunks)
    }

    /// Creates a pool backed by the global allocator and seeds it with
    /// `count` chunks of class `exp`.
    pub fn with_seed(exp: u8, count: usize) -> Result<Self, PoolError> {
        Self::builder().seed(exp, count).build()
    }

    /// Returns a builder for configuring a pool.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Pool<A>
where
    A: ChunkAllocator,
{
    /// Creates an empty pool that obtains its chunks from `chunks`.
    #[must_use]
    pub fn with_allocator(chunks: A) -> Self {
        Self::from_parts(chunks, DEFAULT_GROWTH_CHUNKS, None)
    }

    fn from_parts(
        chunks: A,
        growth_chunks: usize,
        low_memory_handler: Option<LowMemoryHandler>,
    ) -> Self {
        Self {
            state: ReentrantMutex::new(RefCell::new(PoolState {
                table: SizeClassTable::new(),
                seed: None,
                in_handler: false,
            })),
            chunks,
            growth_chunks,
            low_memory_handler,
            _live: LivePool::register(),
        }
    }

    /// Seeds an empty pool with `count` chunks of class `exp`.
    ///
    /// Returns `Ok(false)` without acquiring anything if the pool already
    /// holds chunks. A failed acquisition keeps the chunks obtained before
    /// the failure.
    pub fn reserve(&self, exp: u8, count: usize) -> Result<bool, PoolError> {
        let class = SizeClass::new(exp).context(InvalidClassSnafu { exp })?;
        let layout = chunk_layout(class).context(InvalidClassSnafu { exp })?;

        let state = self.state.lock();
        if !state.borrow().table.is_empty() {
            debug!("reserve of {count} chunk(s) of class {class} rejected: pool is not empty");
            return Ok(false);
        }
        self.acquire(&state, class, layout, count)?;
        state.borrow_mut().seed = Some((class, count));
        debug!("reserved {count} chunk(s) of class {class}");
        Ok(true)
    }

    /// Allocates a block with room for at least `size` bytes.
    ///
    /// The returned pointer is aligned to [`HEADER_ALIGN`] and stays valid
    /// until it is passed to [`deallocate`](Self::deallocate) or the pool is
    /// dropped. If no free block is large enough, the pool first acquires
    /// [`growth_chunks`](Self::growth_chunks) chunks of the request's class.
    ///
    /// [`HEADER_ALIGN`]: crate::HEADER_ALIGN
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, PoolError> {
        let class = size
            .checked_add(HEADER_SIZE)
            .and_then(SizeClass::for_real_size)
            .context(RequestTooLargeSnafu { size })?;
        let layout = chunk_layout(class).context(RequestTooLargeSnafu { size })?;

        let state = self.state.lock();
        loop {
            if let Some(block) = allocate_block(&mut state.borrow_mut().table, class) {
                return Ok(unsafe { BlockHeader::user_ptr(block) });
            }
            self.acquire(&state, class, layout, self.growth_chunks)?;
        }
    }

    /// Returns a block to the pool.
    ///
    /// The block merges with its buddy if the buddy is a free block of the
    /// same class. At most one level is merged per call.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// pool and must not have been deallocated since.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let state = self.state.lock();
        let mut state = state.borrow_mut();
        unsafe {
            let block = BlockHeader::from_user_ptr(ptr);
            free_block(&mut state.table, block);
        }
    }

    /// Copies the current state of the size-class table.
    #[must_use]
    pub fn snapshot(&self) -> TableSnapshot {
        let state = self.state.lock();
        TableSnapshot::capture(&state.borrow().table)
    }

    /// Returns the header of the block behind `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// pool and must not have been deallocated since.
    #[must_use]
    pub unsafe fn block_info(&self, ptr: NonNull<u8>) -> BlockInfo {
        let _state = self.state.lock();
        unsafe { BlockInfo::read(BlockHeader::from_user_ptr(ptr)) }
    }

    /// Returns the class and chunk count this pool was seeded with.
    #[must_use]
    pub fn seed(&self) -> Option<(SizeClass, usize)> {
        self.state.lock().borrow().seed
    }

    /// Returns the free-byte counter of `class`.
    #[must_use]
    pub fn free_bytes(&self, class: SizeClass) -> usize {
        self.state.lock().borrow().table.free_bytes(class)
    }

    /// Returns `true` if this pool holds no chunk.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().borrow().table.is_empty()
    }

    /// Returns the number of chunks acquired when a request finds no free
    /// block.
    #[must_use]
    pub fn growth_chunks(&self) -> usize {
        self.growth_chunks
    }

    /// Returns the chunk allocator of this pool.
    #[must_use]
    pub fn chunk_allocator(&self) -> &A {
        &self.chunks
    }

    /// Links `count` fresh chunks of `class` into the table.
    ///
    /// No table borrow is outstanding while the low-memory handler runs.
    fn acquire(
        &self,
        state: &RefCell<PoolState>,
        class: SizeClass,
        layout: Layout,
        count: usize,
    ) -> Result<(), PoolError> {
        for _ in 0..count {
            if chunk::acquire_chunk(&mut state.borrow_mut().table, &self.chunks, class, layout) {
                continue;
            }
            let Some(handler) = &self.low_memory_handler else {
                return OutOfMemorySnafu { class, count }.fail();
            };
            // a request made from inside the handler fails without nesting it
            ensure!(!state.borrow().in_handler, OutOfMemorySnafu { class, count });
            warn!("no chunk of class {class} available, invoking low-memory handler");
            state.borrow_mut().in_handler = true;
            let reset = HandlerReset(state);
            handler();
            drop(reset);
            ensure!(
                chunk::acquire_chunk(&mut state.borrow_mut().table, &self.chunks, class, layout),
                OutOfMemorySnafu { class, count }
            );
        }
        debug!("acquired {count} chunk(s) of class {class}");
        Ok(())
    }
}

/// Clears `in_handler` once the low-memory handler returns or
/// unwinds.
struct HandlerReset<'a>(&'a RefCell<PoolState>);

impl Drop for HandlerReset<'_> {
    fn drop(&mut self) {
        self.0.borrow_mut().in_handler = false;
    }
}

impl<A> Drop for Pool<A>
where
    A: ChunkAllocator,
{
    fn drop(&mut self) {
        let table = &mut self.state.get_mut().get_mut().table;
        table.force_all_free();
        coalesce_all(table);
        let released = unsafe { chunk::release_all(table, &self.chunks) };
        debug!("pool torn down, {released} chunk(s) released");
    }
}

impl<A> fmt::Debug for Pool<A>
where
    A: ChunkAllocator + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let mut d = f.debug_struct("Pool");
        d.field("chunks", &self.chunks)
            .field("growth_chunks", &self.growth_chunks)
            .field("low_memory_handler", &self.low_memory_handler.is_some());
        if let Ok(state) = state.try_borrow() {
            let free_bytes = SizeClass::all()
                .map(|class| state.table.free_bytes(class))
                .sum::<usize>();
            d.field("seed", &state.seed).field("free_bytes", &free_bytes);
        }
        d.finish_non_exhaustive()
    }
}

/// Builder for [`Pool`].
///
/// # Examples
///
/// ```
/// use buddy_pool::{Pool, SystemChunks};
///
/// let pool = Pool::builder()
///     .chunk_allocator(SystemChunks)
///     .seed(12, 1)
///     .growth_chunks(4)
///     .low_memory_handler(|| eprintln!("low on memory"))
///     .build()?;
/// assert_eq!(pool.growth_chunks(), 4);
/// # Ok::<(), buddy_pool::PoolError>(())
/// ```
pub struct PoolBuilder<A = SystemChunks> {
    chunks: A,
    seed: Option<(u8, usize)>,
    growth_chunks: usize,
    low_memory_handler: Option<LowMemoryHandler>,
}

impl PoolBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: SystemChunks,
            seed: None,
            growth_chunks: DEFAULT_GROWTH_CHUNKS,
            low_memory_handler: None,
        }
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> PoolBuilder<A>
where
    A: ChunkAllocator,
{
    /// Sets the allocator chunks are obtained from.
    #[must_use]
    pub fn chunk_allocator<B>(self, chunks: B) -> PoolBuilder<B>
    where
        B: ChunkAllocator,
    {
        PoolBuilder {
            chunks,
            seed: self.seed,
            growth_chunks: self.growth_chunks,
            low_memory_handler: self.low_memory_handler,
        }
    }

    /// Seeds the pool with `count` chunks of class `exp` on construction.
    #[must_use]
    pub fn seed(mut self, exp: u8, count: usize) -> Self {
        self.seed = Some((exp, count));
        self
    }

    /// Sets the number of chunks acquired when a request finds no free
    /// block. Values below one are raised to one.
    #[must_use]
    pub fn growth_chunks(mut self, count: usize) -> Self {
        self.growth_chunks = count.max(1);
        self
    }

    /// Sets the handler invoked when the chunk allocator runs out of memory.
    ///
    /// The failed chunk request is retried once after the handler returns.
    #[must_use]
    pub fn low_memory_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.low_memory_handler = Some(Box::new(handler));
        self
    }

    pub fn build(self) -> Result<Pool<A>, PoolError> {
        let pool = Pool::from_parts(self.chunks, self.growth_chunks, self.low_memory_handler);
        if let Some((exp, count)) = self.seed {
            pool.reserve(exp, count)?;
        }
        Ok(pool)
    }
}

impl<A> fmt::Debug for PoolBuilder<A>
where
    A: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("chunks", &self.chunks)
            .field("seed", &self.seed)
            .field("growth_chunks", &self.growth_chunks)
            .field("low_memory_handler", &self.low_memory_handler.is_some())
            .finish()
    }
}

/// Marks a free block of `class` occupied, splitting a larger one if
/// needed. Returns `None` if no class at or above `class` has a free block.
fn allocate_block(table: &mut SizeClassTable, class: SizeClass) -> Option<*mut BlockHeader> {
    let available = table.first_available(class)?;
    let block = table.find_free(available)?;
    unsafe {
        if available == class {
            table.mark_occupied(block);
        } else {
            divide(table, block, available, class);
        }
    }
    Some(block)
}

/// Splits the free block `block` of class `from` down to class `to`.
///
/// For every class `i` in `to..from` a free block of class `i` is carved at
/// `block + 2^i`. `block` itself becomes an occupied block of class `to`.
///
/// # Safety
///
/// `block` must be a free block of class `from` linked in `table`, and `to`
/// must be smaller than `from`.
unsafe fn divide(table: &mut SizeClassTable, block: *mut BlockHeader, from: SizeClass, to: SizeClass) {
    debug_assert!(to < from);
    unsafe {
        table.remove(block);
        let base = (*block).chunk_base;
        for class in to.and_larger().take_while(|&class| class < from) {
            let at = block.cast::<u8>().map_addr(|addr| addr + class.size());
            let piece = BlockHeader::init(at, Some(base), class);
            table.insert(piece);
        }
        (*block).class = to;
        (*block).state = BlockState::Occupied;
        (*base).split_depth += u32::from(from.exp() - to.exp());
        table.insert(block);
        trace!(
            "divided block {:#x} from class {from} to {to}, chunk depth {}",
            block.addr(),
            (*base).split_depth,
        );
    }
}

/// Frees an occupied block, merging it with its buddy when possible.
///
/// # Safety
///
/// `block` must be an occupied block linked in `table`.
unsafe fn free_block(table: &mut SizeClassTable, block: *mut BlockHeader) {
    unsafe {
        match mergeable_buddy(block) {
            Some(buddy) => merge(table, block, buddy),
            None => table.mark_free(block),
        }
    }
}

/// Returns the buddy of `block` if it is a free block of the same class.
///
/// # Safety
///
/// `block` must be a block linked in a table.
unsafe fn mergeable_buddy(block: *mut BlockHeader) -> Option<*mut BlockHeader> {
    unsafe {
        (*block).class.next()?;
        let buddy = BlockHeader::buddy(block)?;
        ((*buddy).state.is_free() && (*buddy).class == (*block).class).then_some(buddy)
    }
}

/// Merges `block` with its free buddy into one free block of the next class.
///
/// # Safety
///
/// `buddy` must be the free buddy of `block`, of the same class, and both
/// must be linked in `table`.
unsafe fn merge(table: &mut SizeClassTable, block: *mut BlockHeader, buddy: *mut BlockHeader) {
    unsafe {
        table.remove(block);
        table.remove(buddy);
        let (low, high) = if block.addr() < buddy.addr() {
            (block, buddy)
        } else {
            (buddy, block)
        };
        let Some(class) = (*low).class.next() else {
            unreachable!("merged block of the largest class");
        };
        (*high).state = BlockState::Free;
        (*low).state = BlockState::Free;
        (*low).class = class;
        let base = (*low).chunk_base;
        (*base).split_depth -= 1;
        table.insert(low);
        trace!(
            "merged {:#x} and {:#x} into class {class}, chunk depth {}",
            low.addr(),
            high.addr(),
            (*base).split_depth,
        );
    }
}

/// Merges free buddies class by class, smallest first.
///
/// Merged blocks move up into classes that are visited later, so a table
/// whose blocks are all free ends up holding whole chunks only. Each class is
/// scanned once: its mergeable pairs are disjoint, and merging one leaves the
/// others intact.
fn coalesce_all(table: &mut SizeClassTable) {
    let mut pairs = Vec::new();
    for class in SizeClass::all() {
        pairs.extend(table.blocks(class).filter_map(|block| {
            let buddy = unsafe { mergeable_buddy(block) }?;
            (block.addr() < buddy.addr()).then_some((block, buddy))
        }));
        for (low, high) in pairs.drain(..) {
            unsafe { merge(table, low, high) }
        }
    }
}
