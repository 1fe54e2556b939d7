//! Fixed-size records that remember where they were read from.
//!
//! Swift metadata is full of relative pointers whose targets are computed from
//! the address of the field holding them. A decoded header on its own has lost
//! that information; [`Located`] keeps the record together with its address so
//! that any field's address can be recovered with [`Located::field_address`].

use std::fmt;
use std::mem::size_of;
use std::ops::Deref;

use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::reading::{Address, ReadingContext};

// =============================================================================
// Locatable Layout
// =============================================================================

/// A fixed-layout on-disk record.
///
/// `SIZE` is the record's wire size. It must equal the in-memory size of the
/// type; [`read_located`] checks this before reading.
pub trait LocatableLayout: FromBytes + KnownLayout + Immutable + Copy {
    /// Byte size of the record as stored in the binary.
    const SIZE: usize;

    /// Name used in diagnostics.
    const NAME: &'static str;
}

/// A layout paired with the address it was read from.
#[derive(Clone, Copy)]
pub struct Located<L, A> {
    /// The decoded record.
    pub layout: L,
    /// Where the record starts.
    pub address: A,
}

impl<L: LocatableLayout, A: Address> Located<L, A> {
    /// Pairs a record with its address.
    #[inline]
    pub fn new(layout: L, address: A) -> Self {
        Self { layout, address }
    }

    /// Returns the address of a field at `offset` bytes into the record.
    ///
    /// Use with `std::mem::offset_of!(L, field)`.
    #[inline]
    pub fn field_address(&self, offset: usize) -> A {
        self.address.advanced(offset)
    }

    /// Returns the address just past the record.
    #[inline]
    pub fn end(&self) -> A {
        self.address.advanced(L::SIZE)
    }
}

impl<L, A> Deref for Located<L, A> {
    type Target = L;

    #[inline]
    fn deref(&self) -> &L {
        &self.layout
    }
}

impl<L: fmt::Debug, A: fmt::Debug> fmt::Debug for Located<L, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Located")
            .field("address", &format_args!("{:x?}", self.address))
            .field("layout", &self.layout)
            .finish()
    }
}

/// Reads `L` at `at` and stamps it with `at`.
pub fn read_located<C, L>(ctx: &C, at: C::Address) -> Result<Located<L, C::Address>>
where
    C: ReadingContext,
    L: LocatableLayout,
{
    if size_of::<L>() != L::SIZE {
        return Err(Error::LayoutSizeMismatch {
            layout: L::NAME,
            expected: L::SIZE,
            actual: size_of::<L>(),
        });
    }
    let layout = ctx.read_element::<L>(at)?;
    Ok(Located::new(layout, at))
}

/// Declares a `LocatableLayout` impl with the given wire size.
macro_rules! locatable {
    ($ty:ty, $size:expr) => {
        impl $crate::layout::LocatableLayout for $ty {
            const SIZE: usize = $size;
            const NAME: &'static str = stringify!($ty);
        }
    };
}

pub(crate) use locatable;

#[cfg(test)]
mod tests {
    use std::mem::offset_of;

    use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

    use super::*;
    use crate::reading::BufferContext;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
    struct Pair {
        first: u32,
        second: i32,
    }
    locatable!(Pair, 8);

    #[repr(C)]
    #[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
    struct Misdeclared {
        value: u64,
    }
    locatable!(Misdeclared, 12);

    fn context() -> BufferContext {
        let mut data = vec![0u8; 32];
        data[0x10..0x14].copy_from_slice(&7u32.to_le_bytes());
        data[0x14..0x18].copy_from_slice(&(-8i32).to_le_bytes());
        BufferContext::new(data)
    }

    #[test]
    fn test_field_address() {
        let ctx = context();
        let pair: Located<Pair, u64> = ctx.read_locatable_layout(0x10).unwrap();
        assert_eq!(pair.first, 7);
        assert_eq!(pair.second, -8);
        assert_eq!(pair.field_address(offset_of!(Pair, first)), 0x10);
        assert_eq!(pair.field_address(offset_of!(Pair, second)), 0x14);
        assert_eq!(pair.end(), 0x18);
    }

    #[test]
    fn test_size_mismatch() {
        let ctx = context();
        let err = read_located::<_, Misdeclared>(&ctx, 0).unwrap_err();
        assert!(matches!(
            err,
            Error::LayoutSizeMismatch {
                expected: 12,
                actual: 8,
                ..
            }
        ));
    }

    #[test]
    fn test_debug_in_generic_record() {
        #[derive(Debug)]
        struct Holder<A> {
            pair: Located<Pair, A>,
        }

        let ctx = context();
        let holder = Holder {
            pair: ctx.read_locatable_layout::<Pair>(0x10).unwrap(),
        };
        let text = format!("{holder:?}");
        assert!(text.contains("address: 10"));
        assert!(text.contains("second: -8"));
    }

    #[test]
    fn test_short_read() {
        let ctx = context();
        assert!(read_located::<_, Pair>(&ctx, 28).is_err());
    }
}
