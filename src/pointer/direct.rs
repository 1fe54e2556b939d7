//! Direct relative pointers.

use std::fmt;
use std::marker::PhantomData;

use crate::error::Result;
use crate::reading::{Address, ReadingContext, Resolvable};

/// A relative offset whose target holds the pointee.
pub struct RelativeDirectPointer<T> {
    offset: i32,
    _pointee: PhantomData<fn() -> T>,
}

impl<T> RelativeDirectPointer<T> {
    /// Wraps a raw offset.
    #[inline]
    pub const fn new(offset: i32) -> Self {
        Self {
            offset,
            _pointee: PhantomData,
        }
    }

    /// Encodes the pointer stored at `field` that targets `target`.
    ///
    /// Returns `None` if the distance does not fit in 32 bits.
    pub fn from_target<A: Address>(field: A, target: A) -> Option<Self> {
        i32::try_from(target.delta_from(field)).ok().map(Self::new)
    }

    /// Reads the raw offset stored at `field`.
    pub fn read<C: ReadingContext>(ctx: &C, field: C::Address) -> Result<Self> {
        ctx.read_element::<i32>(field).map(Self::new)
    }

    /// Returns the raw offset.
    #[inline]
    pub const fn offset(&self) -> i32 {
        self.offset
    }

    /// Returns true if the pointer is absent.
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.offset == 0
    }

    /// Returns the target address for a pointer stored at `field`.
    #[inline]
    pub fn target<A: Address>(&self, field: A) -> A {
        field.offset_by(self.offset as i64)
    }

    /// Reads the pointee.
    pub fn resolve<C>(&self, ctx: &C, field: C::Address) -> Result<T>
    where
        C: ReadingContext,
        T: Resolvable<C::Address>,
    {
        T::resolve(ctx, self.target(field))
    }

    /// Reads the pointee, or returns `None` for a null pointer.
    pub fn resolve_optional<C>(&self, ctx: &C, field: C::Address) -> Result<Option<T>>
    where
        C: ReadingContext,
        T: Resolvable<C::Address>,
    {
        if self.is_null() {
            return Ok(None);
        }
        self.resolve(ctx, field).map(Some)
    }
}

impl<T> Clone for RelativeDirectPointer<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RelativeDirectPointer<T> {}

impl<T> PartialEq for RelativeDirectPointer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl<T> Eq for RelativeDirectPointer<T> {}

impl<T> fmt::Debug for RelativeDirectPointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelativeDirectPointer({:+#x})", self.offset)
    }
}
