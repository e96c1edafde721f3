//! Power-of-two size classes.
//!
//! A size class is identified by its exponent `e`: a block of class `e`
//! covers `2^e` bytes measured from the start of its header. The table holds
//! [`CLASS_COUNT`] classes, `0..CLASS_COUNT`.

use crate::header::HEADER_SIZE;

/// Number of size classes tracked by a pool.
pub const CLASS_COUNT: usize = 32;

/// Smallest class whose blocks have room for at least one byte after the
/// header.
///
/// Chunks of smaller classes can be reserved but are never handed out.
pub const MIN_SERVING_CLASS: SizeClass = match SizeClass::for_real_size(HEADER_SIZE + 1) {
    Some(class) => class,
    None => panic!("header does not fit any size class"),
};

/// A power-of-two size class.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display,
)]
#[display("{_0}")]
pub struct SizeClass(u8);

impl SizeClass {
    /// Largest class in the table.
    #[expect(clippy::cast_possible_truncation)]
    pub const MAX: Self = Self((CLASS_COUNT - 1) as u8);

    /// Creates a class from its exponent, or `None` if the exponent is outside
    /// the table.
    #[must_use]
    pub const fn new(exp: u8) -> Option<Self> {
        if (exp as usize) < CLASS_COUNT {
            Some(Self(exp))
        } else {
            None
        }
    }

    /// Returns the smallest class whose blocks span at least `real_size`
    /// bytes, header included.
    ///
    /// Sizes of 0, 1 and 2 bytes all round to class 1. Returns `None` if no
    /// class in the table is large enough.
    ///
    /// # Examples
    ///
    /// ```
    /// use buddy_pool::SizeClass;
    ///
    /// assert_eq!(SizeClass::for_real_size(64).unwrap().exp(), 6);
    /// assert_eq!(SizeClass::for_real_size(65).unwrap().exp(), 7);
    /// assert_eq!(SizeClass::for_real_size(1).unwrap().exp(), 1);
    /// ```
    #[must_use]
    pub const fn for_real_size(real_size: usize) -> Option<Self> {
        let bits = usize::BITS - real_size.saturating_sub(1).leading_zeros();
        let exp = if bits < 1 { 1 } else { bits };
        if exp as usize >= CLASS_COUNT {
            return None;
        }
        #[expect(clippy::cast_possible_truncation)]
        let exp = exp as u8;
        Self::new(exp)
    }

    /// Returns the exponent of this class.
    #[must_use]
    pub const fn exp(self) -> u8 {
        self.0
    }

    /// Returns the number of bytes a block of this class spans, header
    /// included.
    #[must_use]
    pub const fn size(self) -> usize {
        1 << self.0
    }

    /// Returns the number of bytes a block of this class can hand out.
    #[must_use]
    pub const fn usable_size(self) -> usize {
        self.size().saturating_sub(HEADER_SIZE)
    }

    /// Returns the index of this class in the size-class table.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the next larger class, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        Self::new(self.0 + 1)
    }

    /// Returns the next smaller class, if any.
    #[must_use]
    pub const fn prev(self) -> Option<Self> {
        match self.0.checked_sub(1) {
            Some(exp) => Some(Self(exp)),
            None => None,
        }
    }

    /// Returns every class from `self` up to [`SizeClass::MAX`], ascending.
    pub fn and_larger(self) -> impl DoubleEndedIterator<Item = Self> {
        (self.0..=Self::MAX.0).map(Self)
    }

    /// Returns every class of the table, ascending.
    pub fn all() -> impl DoubleEndedIterator<Item = Self> {
        Self(0).and_larger()
    }
}
