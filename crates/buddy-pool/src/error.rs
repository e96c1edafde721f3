//! Error types returned by pool operations.

use core::fmt;

use snafu::{GenerateImplicitData, Snafu};

use crate::class::SizeClass;

/// Source location at which an error was created.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The error type returned by [`Pool`](crate::Pool) and
/// [`PoolAllocator`](crate::PoolAllocator) operations.
///
/// Rejected reseeding is not an error: [`Pool::reserve`](crate::Pool::reserve)
/// reports it as `Ok(false)`. Misuse such as freeing a pointer twice is not
/// detected at all.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum PoolError {
    /// The chunk allocator could not satisfy a chunk request.
    #[snafu(display("chunk allocator is out of memory: requested {count} chunk(s) of class {class}"))]
    OutOfMemory {
        class: SizeClass,
        count: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// The request does not fit into the largest size class.
    #[snafu(display("allocation request of {size} bytes exceeds the largest size class"))]
    RequestTooLarge {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    /// The class exponent is outside the table, or its chunk layout cannot be
    /// represented on this target.
    #[snafu(display("invalid size class exponent: {exp}"))]
    InvalidClass {
        exp: u8,
        #[snafu(implicit)]
        location: Location,
    },
    /// The requested alignment is stricter than block headers guarantee.
    #[snafu(display("unsupported alignment: align={align}, max={max}"))]
    UnsupportedAlignment {
        align: usize,
        max: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl PoolError {
    /// Returns the location where this error was created.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::OutOfMemory { location, .. }
            | Self::RequestTooLarge { location, .. }
            | Self::InvalidClass { location, .. }
            | Self::UnsupportedAlignment { location, .. } => *location,
        }
    }

    /// Returns `true` if the error reports chunk allocator exhaustion.
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}
