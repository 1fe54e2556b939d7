//! Relative pointer encodings used throughout Swift metadata.
//!
//! Every variant stores a signed 32-bit offset relative to the address of the
//! field that holds it. Pointers are therefore plain values here: decoding a
//! layout yields the raw `i32`, and resolution takes the field's address
//! (usually from [`Located::field_address`](crate::layout::Located::field_address)).
//!
//! | Variant                                | Target                                  |
//! |----------------------------------------|-----------------------------------------|
//! | [`RelativeDirectPointer`]              | `field + offset`                        |
//! | [`RelativeIndirectPointer`]            | slot at `field + offset`                |
//! | [`RelativeIndirectablePointer`]        | either, selected by bit 0               |
//! | [`RelativeIndirectablePointerIntPair`] | either, plus a value in bit 1           |
//!
//! A zero offset means "absent" for nullable pointees. `resolve_optional`
//! checks this before touching the backing store.

mod direct;
mod indirect;

pub use direct::*;
pub use indirect::*;

/// Mask of the indirect bit in indirectable pointers.
pub const INDIRECT_BIT: i32 = 0b1;

/// Mask of the value bits in an int-pair pointer (4-byte alignment).
pub const INT_PAIR_VALUE_MASK: i32 = 0b10;

/// Mask removing both the indirect bit and the int-pair value bits.
pub const INT_PAIR_OFFSET_MASK: i32 = !0b11;

/// A small value packed into the low bits of a relative pointer.
pub trait IntPairValue: Copy {
    /// Builds the value from the extracted (already shifted) bits.
    fn from_bits(bits: u32) -> Self;
}

impl IntPairValue for bool {
    #[inline]
    fn from_bits(bits: u32) -> Self {
        bits != 0
    }
}

impl IntPairValue for u8 {
    #[inline]
    fn from_bits(bits: u32) -> Self {
        bits as u8
    }
}

impl IntPairValue for u32 {
    #[inline]
    fn from_bits(bits: u32) -> Self {
        bits
    }
}
