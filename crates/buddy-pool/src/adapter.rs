//! Typed allocation on top of a pool.

use core::{fmt, marker::PhantomData, ptr::NonNull};

use snafu::{OptionExt as _, ensure};

use crate::{
    chunk::{ChunkAllocator, SystemChunks},
    class::SizeClass,
    error::{PoolError, RequestTooLargeSnafu, UnsupportedAlignmentSnafu},
    header::HEADER_ALIGN,
    pool::Pool,
};

/// Allocator for arrays of `T` that forwards to a borrowed [`Pool`].
///
/// Any two adapters over the same pool compare equal, whatever their element
/// type, since memory allocated through one can be released through the
/// other.
///
/// # Examples
///
/// ```
/// use buddy_pool::{Pool, PoolAllocator};
///
/// let pool = Pool::new();
/// let alloc = PoolAllocator::<u64>::new(&pool);
/// let ptr = alloc.allocate(4)?;
/// unsafe {
///     for i in 0..4 {
///         alloc.construct(ptr.add(i), i as u64 * 10);
///     }
///     assert_eq!(*ptr.add(3).as_ptr(), 30);
///     alloc.deallocate(ptr, 4);
/// }
/// # Ok::<(), buddy_pool::PoolError>(())
/// ```
pub struct PoolAllocator<'p, T, A = SystemChunks>
where
    A: ChunkAllocator,
{
    pool: &'p Pool<A>,
    _marker: PhantomData<fn() -> T>,
}

impl<'p, T, A> PoolAllocator<'p, T, A>
where
    A: ChunkAllocator,
{
    #[must_use]
    pub fn new(pool: &'p Pool<A>) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    /// Returns an adapter for elements of type `U` over the same pool.
    #[must_use]
    pub fn rebind<U>(self) -> PoolAllocator<'p, U, A> {
        PoolAllocator::new(self.pool)
    }

    #[must_use]
    pub fn pool(&self) -> &'p Pool<A> {
        self.pool
    }

    /// Allocates uninitialized storage for `n` elements.
    ///
    /// Zero-sized requests still take a block from the pool.
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>, PoolError> {
        let align = align_of::<T>();
        ensure!(
            align <= HEADER_ALIGN,
            UnsupportedAlignmentSnafu {
                align,
                max: HEADER_ALIGN,
            }
        );
        let size = size_of::<T>()
            .checked_mul(n)
            .context(RequestTooLargeSnafu { size: usize::MAX })?;
        Ok(self.pool.allocate(size)?.cast())
    }

    /// Releases storage obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on an adapter over the same
    /// pool and must not have been deallocated since. Any elements still in
    /// it are not dropped.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, _n: usize) {
        unsafe { self.pool.deallocate(ptr.cast()) }
    }

    /// Moves `value` into the slot at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes and properly aligned. Any previous value
    /// at `ptr` is overwritten without being dropped.
    pub unsafe fn construct(&self, ptr: NonNull<T>, value: T) {
        unsafe { ptr.write(value) }
    }

    /// Drops the value at `ptr` in place.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized value that is not used afterwards.
    pub unsafe fn destroy(&self, ptr: NonNull<T>) {
        unsafe { ptr.drop_in_place() }
    }

    /// Returns the largest element count a single call to
    /// [`allocate`](Self::allocate) can satisfy.
    #[must_use]
    pub fn max_size(&self) -> usize {
        let usable = SizeClass::MAX.usable_size();
        match size_of::<T>() {
            0 => usize::MAX,
            size => usable / size,
        }
    }

    #[must_use]
    pub fn address(&self, value: &T) -> NonNull<T> {
        NonNull::from(value)
    }
}

impl<T, A> Clone for PoolAllocator<'_, T, A>
where
    A: ChunkAllocator,
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, A> Copy for PoolAllocator<'_, T, A> where A: ChunkAllocator {}

impl<T, U, A> PartialEq<PoolAllocator<'_, U, A>> for PoolAllocator<'_, T, A>
where
    A: ChunkAllocator,
{
    fn eq(&self, other: &PoolAllocator<'_, U, A>) -> bool {
        core::ptr::eq(self.pool, other.pool)
    }
}

impl<T, A> Eq for PoolAllocator<'_, T, A> where A: ChunkAllocator {}

impl<T, A> fmt::Debug for PoolAllocator<'_, T, A>
where
    A: ChunkAllocator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("pool", &core::ptr::from_ref(self.pool))
            .field("element", &core::any::type_name::<T>())
            .finish()
    }
}
