//! Indirect and indirectable relative pointers.
//!
//! Indirect targets are pointer-sized slots that go through
//! [`resolve_slot`], so they may resolve to an external [`Symbol`](crate::symbol::Symbol)
//! instead of an element of this binary.

use std::fmt;
use std::marker::PhantomData;

use super::{IntPairValue, INDIRECT_BIT, INT_PAIR_OFFSET_MASK, INT_PAIR_VALUE_MASK};
use crate::error::Result;
use crate::reading::{Address, ReadingContext, Resolvable};
use crate::symbol::{resolve_slot, SymbolOrElement};

/// Resolves the address an indirectable pointer designates.
fn indirectable_address<C: ReadingContext>(
    ctx: &C,
    target: C::Address,
    indirect: bool,
) -> Result<SymbolOrElement<C::Address>> {
    if indirect {
        resolve_slot(ctx, target)
    } else {
        Ok(SymbolOrElement::Element(target))
    }
}

/// Generates the resolution API shared by every indirect variant.
///
/// The type must provide `is_null()` and `resolve_address()`.
macro_rules! indirect_resolution {
    ($ty:ident < T $(, $extra:ident)* >) => {
        impl<T $(, $extra: IntPairValue)*> $ty<T $(, $extra)*> {
            /// Reads the pointee, or the symbol the slot is bound to.
            pub fn resolve<C>(&self, ctx: &C, field: C::Address) -> Result<SymbolOrElement<T>>
            where
                C: ReadingContext,
                T: Resolvable<C::Address>,
            {
                self.resolve_address(ctx, field)?
                    .try_map(|address| T::resolve(ctx, address))
            }

            /// Like [`resolve`](Self::resolve), but `None` for a null pointer.
            pub fn resolve_optional<C>(
                &self,
                ctx: &C,
                field: C::Address,
            ) -> Result<Option<SymbolOrElement<T>>>
            where
                C: ReadingContext,
                T: Resolvable<C::Address>,
            {
                if self.is_null() {
                    return Ok(None);
                }
                self.resolve(ctx, field).map(Some)
            }

            /// Reads the pointee; a bound symbol is an
            /// [`UnresolvedRequiredSymbol`](crate::error::Error::UnresolvedRequiredSymbol) error.
            pub fn resolve_element<C>(&self, ctx: &C, field: C::Address) -> Result<T>
            where
                C: ReadingContext,
                T: Resolvable<C::Address>,
            {
                self.resolve(ctx, field)?.require()
            }
        }

        impl<T $(, $extra: IntPairValue)*> Clone for $ty<T $(, $extra)*> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<T $(, $extra: IntPairValue)*> Copy for $ty<T $(, $extra)*> {}

        impl<T $(, $extra: IntPairValue)*> PartialEq for $ty<T $(, $extra)*> {
            fn eq(&self, other: &Self) -> bool {
                self.raw == other.raw
            }
        }

        impl<T $(, $extra: IntPairValue)*> Eq for $ty<T $(, $extra)*> {}

        impl<T $(, $extra: IntPairValue)*> fmt::Debug for $ty<T $(, $extra)*> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($ty), "({:#010x})"), self.raw)
            }
        }
    };
}

// =============================================================================
// Relative Indirect Pointer
// =============================================================================

/// A relative offset to a pointer slot holding the pointee's address.
pub struct RelativeIndirectPointer<T> {
    raw: i32,
    _pointee: PhantomData<fn() -> T>,
}

impl<T> RelativeIndirectPointer<T> {
    /// Wraps a raw offset.
    #[inline]
    pub const fn new(raw: i32) -> Self {
        Self {
            raw,
            _pointee: PhantomData,
        }
    }

    /// Reads the raw offset stored at `field`.
    pub fn read<C: ReadingContext>(ctx: &C, field: C::Address) -> Result<Self> {
        ctx.read_element::<i32>(field).map(Self::new)
    }

    /// Returns the offset to the slot.
    #[inline]
    pub const fn offset(&self) -> i32 {
        self.raw
    }

    /// Returns true if the pointer is absent.
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.raw == 0
    }

    /// Returns the address of the slot for a pointer stored at `field`.
    #[inline]
    pub fn slot<A: Address>(&self, field: A) -> A {
        field.offset_by(self.raw as i64)
    }

    /// Resolves the slot without reading the pointee.
    pub fn resolve_address<C: ReadingContext>(
        &self,
        ctx: &C,
        field: C::Address,
    ) -> Result<SymbolOrElement<C::Address>> {
        resolve_slot(ctx, self.slot(field))
    }
}

indirect_resolution!(RelativeIndirectPointer<T>);

// =============================================================================
// Relative Indirectable Pointer
// =============================================================================

/// A relative offset whose bit 0 selects direct (0) or indirect (1) access.
pub struct RelativeIndirectablePointer<T> {
    raw: i32,
    _pointee: PhantomData<fn() -> T>,
}

impl<T> RelativeIndirectablePointer<T> {
    /// Wraps a raw stored value.
    #[inline]
    pub const fn new(raw: i32) -> Self {
        Self {
            raw,
            _pointee: PhantomData,
        }
    }

    /// Reads the raw value stored at `field`.
    pub fn read<C: ReadingContext>(ctx: &C, field: C::Address) -> Result<Self> {
        ctx.read_element::<i32>(field).map(Self::new)
    }

    /// Returns the stored value including the indirect bit.
    #[inline]
    pub const fn raw(&self) -> i32 {
        self.raw
    }

    /// Returns true if the target is a slot.
    #[inline]
    pub const fn is_indirect(&self) -> bool {
        self.raw & INDIRECT_BIT != 0
    }

    /// Returns the offset with the indirect bit cleared.
    #[inline]
    pub const fn offset(&self) -> i32 {
        self.raw & !INDIRECT_BIT
    }

    /// Returns true if the pointer is absent.
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.offset() == 0
    }

    /// Returns the pointee address, or the slot address when indirect.
    #[inline]
    pub fn target<A: Address>(&self, field: A) -> A {
        field.offset_by(self.offset() as i64)
    }

    /// Resolves the pointee address without reading the pointee.
    pub fn resolve_address<C: ReadingContext>(
        &self,
        ctx: &C,
        field: C::Address,
    ) -> Result<SymbolOrElement<C::Address>> {
        indirectable_address(ctx, self.target(field), self.is_indirect())
    }
}

indirect_resolution!(RelativeIndirectablePointer<T>);

// =============================================================================
// Relative Indirectable Pointer Int Pair
// =============================================================================

/// An indirectable pointer with a small value packed into bit 1.
///
/// ```text
/// bit 0     indirect
/// bit 1     value
/// bits 2..  offset (4-byte aligned)
/// ```
pub struct RelativeIndirectablePointerIntPair<T, V> {
    raw: i32,
    _pointee: PhantomData<fn() -> (T, V)>,
}

impl<T, V: IntPairValue> RelativeIndirectablePointerIntPair<T, V> {
    /// Wraps a raw stored value.
    #[inline]
    pub const fn new(raw: i32) -> Self {
        Self {
            raw,
            _pointee: PhantomData,
        }
    }

    /// Reads the raw value stored at `field`.
    pub fn read<C: ReadingContext>(ctx: &C, field: C::Address) -> Result<Self> {
        ctx.read_element::<i32>(field).map(Self::new)
    }

    /// Returns the stored value including flag bits.
    #[inline]
    pub const fn raw(&self) -> i32 {
        self.raw
    }

    /// Returns true if the target is a slot.
    #[inline]
    pub const fn is_indirect(&self) -> bool {
        self.raw & INDIRECT_BIT != 0
    }

    /// Returns the packed value. Independent of resolution.
    #[inline]
    pub fn value(&self) -> V {
        V::from_bits(((self.raw & INT_PAIR_VALUE_MASK) >> 1) as u32)
    }

    /// Returns the offset with flag and value bits cleared.
    #[inline]
    pub const fn offset(&self) -> i32 {
        self.raw & INT_PAIR_OFFSET_MASK
    }

    /// Returns true if the pointer is absent. The packed value may still be set.
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.offset() == 0
    }

    /// Returns the pointee address, or the slot address when indirect.
    #[inline]
    pub fn target<A: Address>(&self, field: A) -> A {
        field.offset_by(self.offset() as i64)
    }

    /// Resolves the pointee address without reading the pointee.
    pub fn resolve_address<C: ReadingContext>(
        &self,
        ctx: &C,
        field: C::Address,
    ) -> Result<SymbolOrElement<C::Address>> {
        indirectable_address(ctx, self.target(field), self.is_indirect())
    }
}

indirect_resolution!(RelativeIndirectablePointerIntPair<T, V>);
